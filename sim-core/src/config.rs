//! §6 External interfaces — the JSON configuration document.
//!
//! Shape follows the design doc's top-level `name`/`description?`/`settings`
//! layout exactly; `agentSpawns` and `statistics` are open maps since the
//! controller types and tracker settings they name are plugin-defined
//! (recipes, controller policies, and tracker filters are all out of scope
//! per spec.md and are therefore carried as opaque `serde_json::Value`).

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub settings: SimulationSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationSettings {
    pub agent_num_processes: u32,
    pub simulation_steps: u64,
    pub ticks_per_step: u32,
    #[serde(default)]
    pub checkpoint_frequency: Option<u64>,
    #[serde(default)]
    pub initial_checkpoint: Option<String>,
    /// External recipe/item data file reference; the recipes themselves are
    /// out of scope per spec.md §1, so this is only a pass-through path.
    #[serde(default)]
    pub item_settings: Option<Value>,
    pub agent_spawns: HashMap<String, HashMap<String, SpawnSpec>>,
    #[serde(default)]
    pub statistics: HashMap<String, HashMap<String, TrackerSettings>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpawnSpec {
    pub quantity: u32,
    #[serde(default)]
    pub settings: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerSettings {
    /// Spelled `OuputPath` (sic) to match the design doc's binding field
    /// name verbatim.
    #[serde(rename = "OuputPath")]
    pub output_path: String,
    #[serde(flatten)]
    pub filters: HashMap<String, Value>,
}

impl SimulationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: SimulationConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal structural validation: the settings must actually be able to
    /// drive a simulation (at least one step, at least one tick, at least
    /// one spawn group).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.settings.simulation_steps == 0 {
            return Err(ConfigError::Invalid("simulationSteps must be > 0".into()));
        }
        if self.settings.ticks_per_step == 0 {
            return Err(ConfigError::Invalid("ticksPerStep must be > 0".into()));
        }
        if self.settings.agent_spawns.is_empty() {
            return Err(ConfigError::Invalid("agentSpawns must not be empty".into()));
        }
        if let Some(freq) = self.settings.checkpoint_frequency {
            if freq == 0 {
                return Err(ConfigError::Invalid("checkpointFrequency must be > 0 when set".into()));
            }
        }
        Ok(())
    }

    /// Every `(agentId, controllerType, settings)` this config spawns, in a
    /// stable order (`spawnPrefix0`, `spawnPrefix1`, ... per prefix, prefixes
    /// in the map's iteration order collected and sorted for determinism).
    pub fn spawn_plan(&self) -> Vec<(String, String, Option<Value>)> {
        let mut prefixes: Vec<&String> = self.settings.agent_spawns.keys().collect();
        prefixes.sort();
        let mut plan = Vec::new();
        for prefix in prefixes {
            let mut controllers: Vec<&String> = self.settings.agent_spawns[prefix].keys().collect();
            controllers.sort();
            for controller_type in controllers {
                let spec = &self.settings.agent_spawns[prefix][controller_type];
                for index in 0..spec.quantity {
                    plan.push((
                        format!("{prefix}{index}"),
                        controller_type.clone(),
                        spec.settings.clone(),
                    ));
                }
            }
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "name": "demo",
            "settings": {
                "agentNumProcesses": 2,
                "simulationSteps": 10,
                "ticksPerStep": 8,
                "checkpointFrequency": 5,
                "agentSpawns": {
                    "farmer": { "default": { "quantity": 3 } },
                    "trader": { "default": { "quantity": 1, "settings": {"startingCash": 500} } }
                },
                "statistics": {
                    "prices": { "ItemPriceTracker": { "OuputPath": "prices.csv" } }
                }
            }
        }"#
    }

    #[test]
    fn parses_camel_case_wire_format() {
        let config: SimulationConfig = serde_json::from_str(sample_json()).unwrap();
        assert_eq!(config.settings.agent_num_processes, 2);
        assert_eq!(config.settings.checkpoint_frequency, Some(5));
        assert_eq!(config.settings.agent_spawns["farmer"]["default"].quantity, 3);
        assert_eq!(
            config.settings.statistics["prices"]["ItemPriceTracker"].output_path,
            "prices.csv"
        );
    }

    #[test]
    fn spawn_plan_expands_quantity_into_indexed_ids() {
        let config = SimulationConfig {
            name: "t".into(),
            description: None,
            settings: SimulationSettings {
                agent_num_processes: 1,
                simulation_steps: 1,
                ticks_per_step: 1,
                checkpoint_frequency: None,
                initial_checkpoint: None,
                item_settings: None,
                agent_spawns: HashMap::from([(
                    "farmer".to_string(),
                    HashMap::from([(
                        "default".to_string(),
                        SpawnSpec { quantity: 3, settings: None },
                    )]),
                )]),
                statistics: HashMap::new(),
            },
        };
        let plan = config.spawn_plan();
        let ids: Vec<&str> = plan.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["farmer0", "farmer1", "farmer2"]);
    }

    #[test]
    fn rejects_zero_simulation_steps() {
        let mut config = SimulationConfig {
            name: "t".into(),
            description: None,
            settings: SimulationSettings {
                agent_num_processes: 1,
                simulation_steps: 0,
                ticks_per_step: 1,
                checkpoint_frequency: None,
                initial_checkpoint: None,
                item_settings: None,
                agent_spawns: HashMap::from([(
                    "a".to_string(),
                    HashMap::from([("d".to_string(), SpawnSpec { quantity: 1, settings: None })]),
                )]),
                statistics: HashMap::new(),
            },
        };
        assert!(config.validate().is_err());
        config.settings.simulation_steps = 5;
        assert!(config.validate().is_ok());
    }
}

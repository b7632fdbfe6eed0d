//! Process bootstrap: wires a `Network`, the three marketplaces, a
//! `Manager`, and every agent named by a config's `spawn_plan()` into one
//! running simulation, then drives it to completion. This is the one place
//! in the crate that owns every other module at once — `runsim` only needs
//! to load a `SimulationConfig` and call [`run`].
//!
//! `instrument`'s recorder is thread-local (see `statistics`), so a
//! `StatisticsSink` only observes every recorded row if the whole run stays
//! on one OS thread. `runsim` therefore drives this function from a
//! `Builder::new_current_thread()` runtime rather than the default
//! multi-thread one; agents still run concurrently as separate tasks; they
//! just never run on more than one OS thread at a time (DESIGN.md).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::{info, warn};

use crate::agent::{AgentRuntime, run_dispatch_loop};
use crate::collaborators::{Controller, DefaultController};
use crate::config::SimulationConfig;
use crate::manager::{self, ManagerConfig};
use crate::market::{ItemMarket, LaborMarket, LandMarket};
use crate::network::Network;
use crate::statistics::StatisticsSink;
use crate::types::{AgentId, Cents};

const ITEM_MARKET_ID: &str = "item-market";
const LABOR_MARKET_ID: &str = "labor-market";
const LAND_MARKET_ID: &str = "land-market";
const MANAGER_ID: &str = "manager";

/// Starting balance handed to every spawned agent. A spawn's own `settings`
/// blob is opaque to this runtime (§4.6 controllers own their policy), so
/// there is no richer place to source a per-agent starting balance from.
const DEFAULT_STARTING_BALANCE: Cents = 0;

pub struct SimulationOutcome {
    pub steps_completed: u64,
    pub statistics_root: PathBuf,
}

/// Build and run one simulation to completion per `config`. Returns once the
/// Manager has torn the run down, after a best-effort statistics flush.
pub async fn run(config: &SimulationConfig) -> anyhow::Result<SimulationOutcome> {
    run_with_step_timeout(config, Duration::from_secs(30)).await
}

/// `run`, parameterized by the Manager's per-step wait budget. Split out so
/// tests can exercise the wiring without paying the production timeout when
/// no tick-blocking agent exists to raise `ADVANCE_STEP` on its own.
async fn run_with_step_timeout(
    config: &SimulationConfig,
    step_timeout: Duration,
) -> anyhow::Result<SimulationOutcome> {
    let network = Network::new();
    let checkpoint_dir = checkpoint_dir_for(config);

    let item_market = ItemMarket::new(AgentId::new(ITEM_MARKET_ID));
    let labor_market = LaborMarket::new(AgentId::new(LABOR_MARKET_ID));
    let land_market = LandMarket::new(AgentId::new(LAND_MARKET_ID));
    if let Some(dir) = &checkpoint_dir {
        item_market.with_checkpoint_dir(dir.clone());
        labor_market.with_checkpoint_dir(dir.clone());
        land_market.with_checkpoint_dir(dir.clone());
    }

    let item_link = network.register(AgentId::new(ITEM_MARKET_ID));
    let labor_link = network.register(AgentId::new(LABOR_MARKET_ID));
    let land_link = network.register(AgentId::new(LAND_MARKET_ID));
    tokio::spawn(item_market.run(item_link, fresh_rng()));
    tokio::spawn(labor_market.run(labor_link, fresh_rng()));
    tokio::spawn(land_market.run(land_link, fresh_rng()));

    let statistics = if config.settings.statistics.is_empty() {
        StatisticsSink::disabled()
    } else {
        StatisticsSink::new(&config.name, &config.settings.statistics)
    };

    let manager_id = AgentId::new(MANAGER_ID);
    let manager_link = network.register(manager_id.clone());

    for (agent_id, controller_type, _settings) in config.spawn_plan() {
        spawn_agent(
            &network,
            AgentId::new(agent_id),
            &controller_type,
            checkpoint_dir.clone(),
        );
    }

    let manager_config = ManagerConfig {
        simulation_steps: config.settings.simulation_steps,
        ticks_per_step: config.settings.ticks_per_step,
        checkpoint_frequency: config.settings.checkpoint_frequency,
        step_timeout,
        checkpoint_dir: checkpoint_dir.clone(),
    };
    info!(name = %config.name, "starting simulation run");
    let steps_completed = manager::run(manager_id, &network, manager_link, manager_config).await;

    if let Err(e) = statistics.flush() {
        warn!(error = %e, "statistics flush failed; run results are otherwise complete");
    }

    Ok(SimulationOutcome { steps_completed, statistics_root: statistics.output_root().to_path_buf() })
}

/// Register one agent, wire its runtime to the three marketplaces, and spawn
/// its dispatch loop. Every `controllerType` other than the built-in default
/// is out of scope for this crate (§4.6: real policies are supplied by
/// callers), so unrecognized types fall back to `DefaultController` with a
/// warning rather than failing the whole run.
fn spawn_agent(network: &Network, id: AgentId, controller_type: &str, checkpoint_dir: Option<PathBuf>) {
    let link = network.register(id.clone());
    let (runtime, inbound) = AgentRuntime::new(id.clone(), DEFAULT_STARTING_BALANCE, link);
    runtime.set_markets(
        Some(AgentId::new(ITEM_MARKET_ID)),
        Some(AgentId::new(LABOR_MARKET_ID)),
        Some(AgentId::new(LAND_MARKET_ID)),
    );
    if let Some(dir) = checkpoint_dir {
        runtime.with_checkpoint_dir(dir);
    }

    let controller = resolve_controller(controller_type);
    tokio::spawn(run_dispatch_loop(runtime, inbound, controller));
}

fn resolve_controller(controller_type: &str) -> Box<dyn Controller> {
    match controller_type {
        "default" | "" => Box::new(DefaultController),
        other => {
            warn!(controller_type = other, "unrecognized controller type, using default");
            Box::new(DefaultController)
        }
    }
}

fn checkpoint_dir_for(config: &SimulationConfig) -> Option<PathBuf> {
    config
        .settings
        .checkpoint_frequency
        .map(|_| PathBuf::from("CHECKPOINTS").join(&config.name))
}

fn fresh_rng() -> StdRng {
    StdRng::from_rng(&mut rand::rng())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::config::{SimulationSettings, SpawnSpec};

    fn minimal_config() -> SimulationConfig {
        SimulationConfig {
            name: "unit-test-sim".into(),
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
                    HashMap::from([("default".to_string(), SpawnSpec { quantity: 2, settings: None })]),
                )]),
                statistics: HashMap::new(),
            },
        }
    }

    #[test]
    fn checkpoint_dir_is_none_without_a_configured_frequency() {
        let config = minimal_config();
        assert_eq!(checkpoint_dir_for(&config), None);
    }

    #[test]
    fn checkpoint_dir_is_scoped_under_the_sim_name() {
        let mut config = minimal_config();
        config.settings.checkpoint_frequency = Some(5);
        assert_eq!(
            checkpoint_dir_for(&config),
            Some(PathBuf::from("CHECKPOINTS").join("unit-test-sim"))
        );
    }

    #[tokio::test(flavor = "current_thread")]
    async fn runs_a_small_simulation_to_completion_with_no_blocking_agents() {
        let config = minimal_config();
        let outcome = run(&config).await.unwrap();
        // With no tick-blocking subscribers the Manager advances on its own
        // step timeout; two spawned agents that never subscribe should not
        // prevent that, and the run should reach every configured step.
        assert_eq!(outcome.steps_completed, 1);
    }
}

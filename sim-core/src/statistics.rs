//! §6 statistics trackers — CSV output under `OUTPUT/<simName>/<OuputPath>`.
//!
//! `spec.md` treats "statistics output formatting" as an external
//! collaborator concern: it names the five recognized tracker types and
//! their CSV destination, but leaves the aggregation itself unspecified.
//! These reference trackers follow the teacher's own instrumentation style
//! (`tracing::info!(target: ..., ...)` at the point of the domain event,
//! feature-gated behind `instrument`) rather than inventing a second
//! recording path; the workspace's `instrument` crate turns those events
//! into column-oriented tables keyed by tracing target.
//!
//! Every recorded row carries the step it happened in, but this module does
//! not pre-aggregate rows down to exactly one per step — which aggregation
//! rule a tracker should use (sum, mean, last-value) is exactly the part the
//! design doc leaves to the implementation.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::agent::AgentRuntime;
use crate::config::TrackerSettings;
use crate::error::StatisticsError;

/// The five tracker types `spec.md` §6 recognizes, matched against the
/// `trackerType` key in a `statistics` config entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    LaborContract,
    Consumption,
    ItemPrice,
    Production,
    Accounting,
}

impl TrackerKind {
    /// The tracing `target` this tracker's events are recorded under —
    /// doubles as the `instrument` recorder's table name.
    pub fn target(&self) -> &'static str {
        match self {
            TrackerKind::LaborContract => "labor_contract",
            TrackerKind::Consumption => "consumption",
            TrackerKind::ItemPrice => "item_price",
            TrackerKind::Production => "production",
            TrackerKind::Accounting => "accounting",
        }
    }

    fn from_config_key(key: &str) -> Option<Self> {
        match key {
            "LaborContractTracker" => Some(TrackerKind::LaborContract),
            "ConsumptionTracker" => Some(TrackerKind::Consumption),
            "ItemPriceTracker" => Some(TrackerKind::ItemPrice),
            "ProductionTracker" => Some(TrackerKind::Production),
            "AccountingTracker" => Some(TrackerKind::Accounting),
            _ => None,
        }
    }
}

struct TrackerSpec {
    kind: TrackerKind,
    output_path: PathBuf,
}

/// Owns the configured trackers for one simulation run and knows how to
/// flush their recorded rows to `OUTPUT/<simName>/<OuputPath>`.
///
/// Recording happens through a thread-local recorder (see `instrument`), so
/// a `StatisticsSink` only observes every event if the whole simulation runs
/// on a single OS thread. `runSim` therefore drives the simulation on a
/// `current_thread` tokio runtime rather than the multi-thread one (see
/// DESIGN.md) — agents still run cooperatively as separate tasks, just never
/// on more than one OS thread at a time.
pub struct StatisticsSink {
    output_root: PathBuf,
    specs: Vec<TrackerSpec>,
}

impl StatisticsSink {
    /// Build from the config's `statistics` map: `name -> trackerType ->
    /// settings`. An unrecognized tracker type is logged and skipped rather
    /// than rejected, since the filters under it are plugin-defined.
    pub fn new(sim_name: &str, statistics: &HashMap<String, HashMap<String, TrackerSettings>>) -> Self {
        let output_root = PathBuf::from("OUTPUT").join(sim_name);
        let mut specs = Vec::new();
        for trackers in statistics.values() {
            for (tracker_type, settings) in trackers {
                match TrackerKind::from_config_key(tracker_type) {
                    Some(kind) => specs.push(TrackerSpec {
                        kind,
                        output_path: output_root.join(&settings.output_path),
                    }),
                    None => warn!(tracker_type, "unrecognized statistics tracker type, skipping"),
                }
            }
        }
        #[cfg(feature = "instrument")]
        instrument::install_subscriber();
        Self { output_root, specs }
    }

    /// A sink with no configured trackers; `flush` is then a no-op.
    pub fn disabled() -> Self {
        Self { output_root: PathBuf::from("OUTPUT"), specs: Vec::new() }
    }

    pub fn output_root(&self) -> &std::path::Path {
        &self.output_root
    }

    /// Drain the recorder and write each configured tracker's table to its
    /// CSV path. A tracker with no recorded rows this run is skipped rather
    /// than writing an empty file. Per §7, a flush failure is logged and the
    /// run continues rather than aborting.
    #[cfg(feature = "instrument")]
    pub fn flush(&self) -> Result<(), StatisticsError> {
        if self.specs.is_empty() {
            return Ok(());
        }
        let mut dataframes = instrument::drain_to_dataframes();
        for spec in &self.specs {
            let Some(df) = dataframes.get_mut(spec.kind.target()) else {
                continue;
            };
            instrument::save_csv_at(df, &spec.output_path)
                .map_err(|e| StatisticsError::Write(e.to_string()))?;
        }
        Ok(())
    }

    #[cfg(not(feature = "instrument"))]
    pub fn flush(&self) -> Result<(), StatisticsError> {
        Ok(())
    }
}

/// §4.3.8 — emit one row with this step's flow deltas for `runtime`, called
/// right before the ledger's `close_step` folds those deltas into the EMA
/// and resets them, so the emitted numbers are the step's totals rather than
/// the smoothed running average.
pub fn record_accounting_step(runtime: &Arc<AgentRuntime>) {
    #[cfg(feature = "instrument")]
    {
        let acc = runtime.accounting.lock();
        tracing::info!(
            target: "accounting",
            step = runtime.current_step(),
            agent_id = %runtime.id,
            labor_income = acc.labor_income.step_total,
            labor_expense = acc.labor_expense.step_total,
            trade_revenue = acc.trade_revenue.step_total,
            trade_expense = acc.trade_expense.step_total,
            land_revenue = acc.land_revenue.step_total,
            land_expense = acc.land_expense.step_total,
            currency_inflow = acc.currency_inflow.step_total,
            currency_outflow = acc.currency_outflow.step_total,
        );
    }
    #[cfg(not(feature = "instrument"))]
    let _ = runtime;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_all_five_tracker_types() {
        assert_eq!(TrackerKind::from_config_key("LaborContractTracker"), Some(TrackerKind::LaborContract));
        assert_eq!(TrackerKind::from_config_key("ConsumptionTracker"), Some(TrackerKind::Consumption));
        assert_eq!(TrackerKind::from_config_key("ItemPriceTracker"), Some(TrackerKind::ItemPrice));
        assert_eq!(TrackerKind::from_config_key("ProductionTracker"), Some(TrackerKind::Production));
        assert_eq!(TrackerKind::from_config_key("AccountingTracker"), Some(TrackerKind::Accounting));
        assert_eq!(TrackerKind::from_config_key("NotATracker"), None);
    }

    #[test]
    fn builds_output_paths_under_out_dir_and_sim_name() {
        let mut trackers = HashMap::new();
        trackers.insert(
            "ItemPriceTracker".to_string(),
            TrackerSettings { output_path: "prices.csv".to_string(), filters: HashMap::new() },
        );
        let mut statistics = HashMap::new();
        statistics.insert("prices".to_string(), trackers);

        let sink = StatisticsSink::new("demo", &statistics);
        assert_eq!(sink.output_root(), PathBuf::from("OUTPUT").join("demo"));
        assert_eq!(sink.specs.len(), 1);
        assert_eq!(sink.specs[0].output_path, PathBuf::from("OUTPUT/demo/prices.csv"));
    }

    #[test]
    fn unrecognized_tracker_type_is_skipped_not_rejected() {
        let mut trackers = HashMap::new();
        trackers.insert(
            "SomeFutureTracker".to_string(),
            TrackerSettings { output_path: "x.csv".to_string(), filters: HashMap::new() },
        );
        let mut statistics = HashMap::new();
        statistics.insert("misc".to_string(), trackers);

        let sink = StatisticsSink::new("demo", &statistics);
        assert!(sink.specs.is_empty());
    }
}

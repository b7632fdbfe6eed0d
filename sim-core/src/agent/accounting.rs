//! §4.3.8 Accounting — per-flow bookkeeping counters.
//!
//! Every tracked flow keeps a cumulative total, a step-scoped delta (reset at
//! each tick grant), and an exponential moving average of the step deltas.
//! Shape follows the teacher's stock-flow accounting module (`Debug + Clone
//! + Default` plain-data structs, free functions over them) with the fields
//! changed to match what the runtime actually tracks here.

use serde::{Deserialize, Serialize};

use crate::types::Cents;

/// Default EMA smoothing factor (§9 design notes).
pub const DEFAULT_ALPHA: f64 = 0.2;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FlowCounter {
    pub cumulative_total: Cents,
    pub step_total: Cents,
    pub ema: f64,
}

impl FlowCounter {
    /// Record a flow amount against the running totals. Called atomically
    /// alongside the balance/inventory mutation that caused it.
    pub fn record(&mut self, amount: Cents) {
        self.cumulative_total += amount;
        self.step_total += amount;
    }

    /// Reverse a provisional record (e.g. a transaction that later failed).
    pub fn reverse(&mut self, amount: Cents) {
        self.cumulative_total -= amount;
        self.step_total -= amount;
    }

    /// Close out the step: fold `step_total` into the EMA, then reset it.
    /// Called once per step by the runtime after the tick grant lands.
    pub fn close_step(&mut self, alpha: f64) {
        self.ema = alpha * self.step_total as f64 + (1.0 - alpha) * self.ema;
        self.step_total = 0;
    }
}

/// The full set of flows an agent tracks (§3 `AgentState` bookkeeping
/// counters).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccountingLedger {
    pub labor_income: FlowCounter,
    pub labor_expense: FlowCounter,
    pub trade_revenue: FlowCounter,
    pub trade_expense: FlowCounter,
    pub land_revenue: FlowCounter,
    pub land_expense: FlowCounter,
    pub currency_inflow: FlowCounter,
    pub currency_outflow: FlowCounter,
}

impl AccountingLedger {
    pub fn close_step(&mut self, alpha: f64) {
        self.labor_income.close_step(alpha);
        self.labor_expense.close_step(alpha);
        self.trade_revenue.close_step(alpha);
        self.trade_expense.close_step(alpha);
        self.land_revenue.close_step(alpha);
        self.land_expense.close_step(alpha);
        self.currency_inflow.close_step(alpha);
        self.currency_outflow.close_step(alpha);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ema_smooths_toward_step_total() {
        let mut c = FlowCounter::default();
        c.record(100);
        c.close_step(DEFAULT_ALPHA);
        assert_eq!(c.cumulative_total, 100);
        assert_eq!(c.step_total, 0);
        assert!((c.ema - 20.0).abs() < 1e-9);
    }

    #[test]
    fn reverse_undoes_a_provisional_record() {
        let mut c = FlowCounter::default();
        c.record(50);
        c.reverse(50);
        assert_eq!(c.cumulative_total, 0);
        assert_eq!(c.step_total, 0);
    }
}

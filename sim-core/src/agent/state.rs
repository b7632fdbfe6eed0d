//! §3 `AgentState` — everything an agent owns. No shared references across
//! agents; the only way to observe another agent's state is an `INFO_REQ`
//! packet round trip.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::agent::accounting::AccountingLedger;
use crate::agent::nutrition::NutritionState;
use crate::types::{Cents, Inventory, LandHoldings, LandState, LaborContract};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentState {
    pub balance: Cents,
    pub inventory: Inventory,
    pub land_holdings: LandHoldings,
    pub labor_contracts_as_employer: Vec<LaborContract>,
    pub labor_contracts_as_worker: Vec<LaborContract>,
    pub ticks_remaining: u32,
    pub nutrition: Option<NutritionState>,
    pub accounting: AccountingLedger,
}

impl AgentState {
    pub fn new(initial_balance: Cents) -> Self {
        Self {
            balance: initial_balance,
            inventory: HashMap::new(),
            land_holdings: HashMap::new(),
            labor_contracts_as_employer: Vec::new(),
            labor_contracts_as_worker: Vec::new(),
            ticks_remaining: 0,
            nutrition: None,
            accounting: AccountingLedger::default(),
        }
    }

    pub fn item_quantity(&self, item_id: &str) -> f64 {
        self.inventory.get(item_id).copied().unwrap_or(0.0)
    }

    /// Credit `quantity` of `item_id`, eliding zero/near-zero entries.
    pub fn credit_item(&mut self, item_id: &str, quantity: f64) {
        if quantity == 0.0 {
            return;
        }
        let entry = self.inventory.entry(item_id.to_string()).or_insert(0.0);
        *entry += quantity;
        if *entry <= 0.0 {
            self.inventory.remove(item_id);
        }
    }

    /// Debit `quantity` of `item_id` if enough is present; `false` means no
    /// side effect occurred.
    pub fn try_debit_item(&mut self, item_id: &str, quantity: f64) -> bool {
        let have = self.item_quantity(item_id);
        if have < quantity {
            return false;
        }
        self.credit_item(item_id, -quantity);
        true
    }

    pub fn unallocated_hectares(&self, allocation: &str) -> f64 {
        self.land_holdings
            .get(&(allocation.to_string(), LandState::Unallocated))
            .copied()
            .unwrap_or(0.0)
    }

    pub fn allocated_hectares(&self, allocation: &str) -> f64 {
        self.land_holdings
            .get(&(allocation.to_string(), LandState::Allocated))
            .copied()
            .unwrap_or(0.0)
    }

    /// Move hectares from unallocated to allocated. Preserves the sum.
    pub fn allocate_land(&mut self, allocation: &str, hectares: f64) -> bool {
        if self.unallocated_hectares(allocation) < hectares {
            return false;
        }
        *self
            .land_holdings
            .entry((allocation.to_string(), LandState::Unallocated))
            .or_insert(0.0) -= hectares;
        *self
            .land_holdings
            .entry((allocation.to_string(), LandState::Allocated))
            .or_insert(0.0) += hectares;
        true
    }

    /// Inverse of `allocate_land`.
    pub fn deallocate_land(&mut self, allocation: &str, hectares: f64) -> bool {
        if self.allocated_hectares(allocation) < hectares {
            return false;
        }
        *self
            .land_holdings
            .entry((allocation.to_string(), LandState::Allocated))
            .or_insert(0.0) -= hectares;
        *self
            .land_holdings
            .entry((allocation.to_string(), LandState::Unallocated))
            .or_insert(0.0) += hectares;
        true
    }

    pub fn try_debit_unallocated_land(&mut self, allocation: &str, hectares: f64) -> bool {
        if self.unallocated_hectares(allocation) < hectares {
            return false;
        }
        *self
            .land_holdings
            .entry((allocation.to_string(), LandState::Unallocated))
            .or_insert(0.0) -= hectares;
        true
    }

    pub fn credit_unallocated_land(&mut self, allocation: &str, hectares: f64) {
        *self
            .land_holdings
            .entry((allocation.to_string(), LandState::Unallocated))
            .or_insert(0.0) += hectares;
    }

    pub fn try_debit_ticks(&mut self, ticks: u32) -> bool {
        if self.ticks_remaining < ticks {
            return false;
        }
        self.ticks_remaining -= ticks;
        true
    }

    pub fn reset_ticks(&mut self, ticks_per_step: u32) {
        self.ticks_remaining = ticks_per_step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_then_deallocate_restores_holdings() {
        let mut s = AgentState::new(0);
        s.credit_unallocated_land("plains", 10.0);
        assert!(s.allocate_land("plains", 4.0));
        assert_eq!(s.unallocated_hectares("plains"), 6.0);
        assert_eq!(s.allocated_hectares("plains"), 4.0);
        assert!(s.deallocate_land("plains", 4.0));
        assert_eq!(s.unallocated_hectares("plains"), 10.0);
        assert_eq!(s.allocated_hectares("plains"), 0.0);
    }

    #[test]
    fn item_credit_elides_zero_entries() {
        let mut s = AgentState::new(0);
        s.credit_item("apple", 3.0);
        assert!(s.try_debit_item("apple", 3.0));
        assert!(!s.inventory.contains_key("apple"));
    }

    #[test]
    fn insufficient_item_debit_is_a_no_op() {
        let mut s = AgentState::new(0);
        s.credit_item("apple", 1.0);
        assert!(!s.try_debit_item("apple", 2.0));
        assert_eq!(s.item_quantity("apple"), 1.0);
    }
}

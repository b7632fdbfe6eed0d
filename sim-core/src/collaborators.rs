//! §4.6 Collaborator interfaces — the boundary between this runtime and the
//! domain logic the spec places out of scope (controllers, recipes, utility
//! curves). Only the traits and a minimal reference implementation of each
//! live here; real policies belong to callers of this crate.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::state::AgentState;
use crate::packet::PacketBody;
use crate::types::ItemContainer;

/// The decision policy plugged into an agent. All calls are single-threaded
/// per agent — the runtime never calls two `Controller` methods on the same
/// agent concurrently.
#[async_trait]
pub trait Controller: Send {
    async fn on_start(&mut self) {}
    async fn on_packet(&mut self, packet: &PacketBody) {
        let _ = packet;
    }
    async fn on_tick_grant(&mut self, ticks: u32) {
        let _ = ticks;
    }
    /// Opaque state blob folded into checkpoints.
    fn save_state(&self) -> Vec<u8> {
        Vec::new()
    }
    fn load_state(&mut self, bytes: &[u8]) {
        let _ = bytes;
    }
    /// Whether to accept an incoming trade request, given the current
    /// listing price the runtime re-validated against (§9 open question:
    /// sellers re-validate their own listing, so the controller is only
    /// ever asked to weigh in on an already-current price).
    fn accept_trade(&self, _unit_price: crate::types::Cents, _quantity: f64) -> bool {
        true
    }
    fn accept_labor_application(&self, _skill_level: f64) -> bool {
        true
    }
}

/// Reference controller: accepts every trade and labor application at the
/// listing price, carries no state. Exists to drive the transactional
/// protocols end-to-end in tests without any real decision policy.
#[derive(Debug, Default, Clone)]
pub struct DefaultController;

#[async_trait]
impl Controller for DefaultController {}

pub trait UtilityFunction: Send + Sync {
    fn marginal_utility(&self, item_id: &str, current_holding: f64) -> f64;
}

/// Diminishing-returns utility `1 / (1 + holding)`, a reasonable default
/// curve shape when no real utility policy is supplied.
#[derive(Debug, Default, Clone)]
pub struct InverseHoldingUtility;

impl UtilityFunction for InverseHoldingUtility {
    fn marginal_utility(&self, _item_id: &str, current_holding: f64) -> f64 {
        1.0 / (1.0 + current_holding.max(0.0))
    }
}

/// `inputsFor` result: item inputs, land (by allocation), and labor ticks
/// required per skill level, to produce one step's worth of output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductionInputs {
    pub items: HashMap<String, f64>,
    pub land: HashMap<String, f64>,
    pub labor: HashMap<String, u32>,
}

pub trait ProductionFunction: Send + Sync {
    fn inputs_for(&self, item_id: &str, target_qty_per_step: f64) -> ProductionInputs;
    fn max_production(&self, item_id: &str, state: &AgentState) -> f64;
}

/// A fixed, linear recipe book: `item -> ProductionInputs` scaled by target
/// quantity, loaded from the (external) recipe data file — out of scope per
/// spec.md, so the recipes themselves are just data handed in by the caller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeBook {
    pub recipes: HashMap<String, ProductionInputs>,
}

impl ProductionFunction for RecipeBook {
    fn inputs_for(&self, item_id: &str, target_qty_per_step: f64) -> ProductionInputs {
        let Some(base) = self.recipes.get(item_id) else {
            return ProductionInputs::default();
        };
        ProductionInputs {
            items: base
                .items
                .iter()
                .map(|(k, v)| (k.clone(), v * target_qty_per_step))
                .collect(),
            land: base
                .land
                .iter()
                .map(|(k, v)| (k.clone(), v * target_qty_per_step))
                .collect(),
            labor: base
                .labor
                .iter()
                .map(|(k, v)| (k.clone(), (*v as f64 * target_qty_per_step).ceil() as u32))
                .collect(),
        }
    }

    fn max_production(&self, item_id: &str, state: &AgentState) -> f64 {
        let Some(base) = self.recipes.get(item_id) else {
            return 0.0;
        };
        let mut max_fraction = f64::INFINITY;
        for (item, qty) in &base.items {
            if *qty <= 0.0 {
                continue;
            }
            let have = state.item_quantity(item);
            max_fraction = max_fraction.min(have / qty);
        }
        for (allocation, hectares) in &base.land {
            if *hectares <= 0.0 {
                continue;
            }
            let have = state.allocated_hectares(allocation);
            max_fraction = max_fraction.min(have / hectares);
        }
        for ticks in base.labor.values() {
            if *ticks == 0 {
                continue;
            }
            max_fraction = max_fraction.min(state.ticks_remaining as f64 / *ticks as f64);
        }
        if max_fraction.is_infinite() {
            0.0
        } else {
            max_fraction.max(0.0)
        }
    }
}

pub trait NutritionTracker: Send + Sync {
    fn consume(&mut self, container: &ItemContainer);
    fn step_decay(&mut self);
    fn requirement(&self) -> Vec<ItemContainer>;
}

impl NutritionTracker for crate::agent::nutrition::NutritionState {
    fn consume(&mut self, container: &ItemContainer) {
        crate::agent::nutrition::NutritionState::consume(self, container)
    }

    fn step_decay(&mut self) {
        crate::agent::nutrition::NutritionState::step_decay(self)
    }

    fn requirement(&self) -> Vec<ItemContainer> {
        crate::agent::nutrition::NutritionState::requirement(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state::AgentState;

    #[test]
    fn recipe_book_scales_inputs_by_target_quantity() {
        let mut book = RecipeBook::default();
        book.recipes.insert(
            "bread".into(),
            ProductionInputs {
                items: HashMap::from([("flour".into(), 2.0)]),
                land: HashMap::new(),
                labor: HashMap::from([("baking".into(), 1)]),
            },
        );
        let inputs = book.inputs_for("bread", 3.0);
        assert_eq!(inputs.items["flour"], 6.0);
        assert_eq!(inputs.labor["baking"], 3);
    }

    #[test]
    fn max_production_is_bounded_by_the_scarcest_input() {
        let mut book = RecipeBook::default();
        book.recipes.insert(
            "bread".into(),
            ProductionInputs {
                items: HashMap::from([("flour".into(), 2.0)]),
                land: HashMap::new(),
                labor: HashMap::new(),
            },
        );
        let mut state = AgentState::new(0);
        state.credit_item("flour", 5.0);
        assert_eq!(book.max_production("bread", &state), 2.5);
    }
}

//! §4.3.9 Nutrition (optional per agent) and §4.6 `NutritionTracker`.
//!
//! Adapted from the teacher's need/utility-curve module: a per-nutrient
//! balance with a decay schedule, plus a threshold-based "hungry" flag that
//! is exposed but carries no runtime-level consequence — only the
//! controller may react to it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::ItemContainer;

/// One tracked nutrient: a running balance, a per-step decay rate, and how
/// many consecutive steps it has been empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NutrientTrack {
    pub balance: f64,
    pub decay_per_step: f64,
    pub empty_steps: u32,
    pub hungry_threshold_steps: u32,
}

impl NutrientTrack {
    pub fn new(decay_per_step: f64, hungry_threshold_steps: u32) -> Self {
        Self {
            balance: 0.0,
            decay_per_step,
            empty_steps: 0,
            hungry_threshold_steps,
        }
    }

    pub fn is_hungry(&self) -> bool {
        self.empty_steps >= self.hungry_threshold_steps
    }
}

/// State carried by an agent that has nutrition enabled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NutritionState {
    pub tracks: HashMap<String, NutrientTrack>,
    pub auto_eat: bool,
}

impl NutritionState {
    pub fn consume(&mut self, container: &ItemContainer) {
        if let Some(track) = self.tracks.get_mut(&container.item_id) {
            track.balance += container.quantity;
            if track.balance > 0.0 {
                track.empty_steps = 0;
            }
        }
    }

    /// Apply one step's decay to every tracked nutrient, bumping the
    /// empty-step counter for anything that bottoms out.
    pub fn step_decay(&mut self) {
        for track in self.tracks.values_mut() {
            track.balance = (track.balance - track.decay_per_step).max(0.0);
            if track.balance <= 0.0 {
                track.empty_steps += 1;
            }
        }
    }

    pub fn any_hungry(&self) -> bool {
        self.tracks.values().any(|t| t.is_hungry())
    }

    /// Nutrients that still need replenishing this step, as the containers
    /// `acquireItem` should go fetch. A nutrient "requires" up to one unit
    /// of deficit below zero balance.
    pub fn requirement(&self) -> Vec<ItemContainer> {
        self.tracks
            .iter()
            .filter(|(_, t)| t.balance <= 0.0)
            .map(|(item_id, t)| ItemContainer::new(item_id.clone(), t.decay_per_step - t.balance))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hungry_after_threshold_empty_steps() {
        let mut s = NutritionState::default();
        s.tracks.insert("grain".into(), NutrientTrack::new(1.0, 2));
        s.step_decay();
        assert!(!s.any_hungry());
        s.step_decay();
        assert!(s.any_hungry());
    }

    #[test]
    fn consuming_resets_empty_streak() {
        let mut s = NutritionState::default();
        s.tracks.insert("grain".into(), NutrientTrack::new(1.0, 1));
        s.step_decay();
        assert!(s.any_hungry());
        s.consume(&ItemContainer::new("grain", 2.0));
        assert!(!s.any_hungry());
    }
}

//! Scents — dormant triggers registered against a condition tree.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::condition::Condition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Level,
    EdgeRising,
    EdgeFalling,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scent {
    pub scent_id: String,
    pub agent_endpoint: Option<String>,
    pub condition: Condition,
    pub cooldown_ms: u64,
    #[serde(default)]
    pub activation_payload: serde_json::Value,
    pub trigger_mode: TriggerMode,
    /// Reserved for future use: a band of tolerance around a threshold
    /// condition's crossing point to avoid rapid re-triggering on noisy
    /// input near the boundary. Carried through but not yet consulted by
    /// the evaluator — see DESIGN.md.
    #[serde(default)]
    pub hysteresis: Option<f64>,
    pub max_execution_ms: u64,
    #[serde(default)]
    pub context_trails: Option<HashSet<String>>,

    // Runtime fields.
    #[serde(default)]
    pub last_triggered_at: Option<i64>,
    #[serde(default)]
    pub last_condition_met: bool,
}

impl Scent {
    pub fn in_cooldown(&self, now: i64) -> bool {
        match self.last_triggered_at {
            Some(t) => now - t < self.cooldown_ms as i64,
            None => false,
        }
    }

    /// Reset semantics for updates (spec.md §9 Open Question): `level` mode
    /// preserves `last_condition_met`; edge modes reset it so a subsequent
    /// rising/falling transition is not missed because the prior state was
    /// carried over from before the update.
    pub fn reset_runtime_on_update(&mut self) {
        match self.trigger_mode {
            TriggerMode::Level => {}
            TriggerMode::EdgeRising | TriggerMode::EdgeFalling => {
                self.last_condition_met = false;
            }
        }
    }
}

//! Background evaluation loop
//!
//! Runs at a fixed cadence, walking the scent table and firing triggers
//! subject to cooldown and edge-trigger semantics (spec.md §4.6). Trigger
//! dispatch happens outside any lock: a local handler is invoked directly,
//! otherwise an outbound HTTP POST is sent to the scent's `agent_endpoint`
//! bounded by `max_execution_ms`. Delivery failures are logged and
//! swallowed — cooldown is the retry/backoff mechanism, not this loop.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, trace, warn};

use super::blackboard::{Blackboard, TriggerPayload};
use super::condition::{evaluate, EvaluationContext};
use super::decay::is_evaporated;
use super::scent::TriggerMode;

pub struct Evaluator {
    board: Arc<Blackboard>,
    http: reqwest::Client,
}

impl Evaluator {
    pub fn new(board: Arc<Blackboard>) -> Self {
        Self {
            board,
            http: reqwest::Client::new(),
        }
    }

    /// Spawn the periodic tick loop. Returns a handle the caller can abort
    /// on shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_ms = self.board.config().engine.evaluation_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    async fn tick(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let pheromones: Vec<_> = self
            .board
            .store()
            .values()
            .into_iter()
            .filter(|p| !is_evaporated(p, now))
            .collect();
        let history = self.board.emission_history_snapshot();

        for scent in self.board.snapshot_scents() {
            if scent.in_cooldown(now) {
                trace!(scent_id = %scent.scent_id, "skipping — in cooldown");
                continue;
            }

            let ctx = EvaluationContext {
                pheromones: &pheromones,
                now,
                emission_history: &history,
            };
            let result = evaluate(&scent.condition, &ctx);

            let should_fire = match scent.trigger_mode {
                TriggerMode::Level => result.met,
                TriggerMode::EdgeRising => result.met && !scent.last_condition_met,
                TriggerMode::EdgeFalling => !result.met && scent.last_condition_met,
            };

            self.board
                .update_scent_runtime(&scent.scent_id, if should_fire { Some(now) } else { None }, result.met);

            if should_fire {
                info!(scent_id = %scent.scent_id, ?scent.trigger_mode, "firing trigger");
                let context_pheromones = match &scent.context_trails {
                    Some(trails) => pheromones
                        .iter()
                        .filter(|p| trails.contains(&p.trail))
                        .map(|p| super::blackboard::snapshot(p, now))
                        .collect(),
                    None => pheromones
                        .iter()
                        .filter(|p| result.matching_pheromone_ids.contains(&p.id))
                        .map(|p| super::blackboard::snapshot(p, now))
                        .collect(),
                };

                let payload = TriggerPayload {
                    scent_id: scent.scent_id.clone(),
                    triggered_at: now,
                    condition_snapshot: result,
                    context_pheromones,
                    activation_payload: scent.activation_payload.clone(),
                };

                self.dispatch(&scent.scent_id, scent.agent_endpoint.clone(), scent.max_execution_ms, payload);
            }
        }
    }

    fn dispatch(&self, scent_id: &str, endpoint: Option<String>, max_execution_ms: u64, payload: TriggerPayload) {
        if let Some(handler) = self.board.handler_for(scent_id) {
            tokio::spawn(async move {
                handler(payload).await;
            });
            return;
        }

        let Some(endpoint) = endpoint else {
            trace!(scent_id, "no handler and no agent_endpoint; trigger dropped");
            return;
        };

        let http = self.http.clone();
        let scent_id = scent_id.to_string();
        let timeout = Duration::from_millis(max_execution_ms);
        tokio::spawn(async move {
            let notification = serde_json::json!({
                "jsonrpc": "2.0",
                "method": "sbp/trigger",
                "params": payload,
            });
            let result = tokio::time::timeout(timeout, http.post(&endpoint).json(&notification).send()).await;
            match result {
                Ok(Ok(resp)) if resp.status().is_success() => {
                    trace!(scent_id, endpoint, "trigger delivered");
                }
                Ok(Ok(resp)) => {
                    warn!(scent_id, endpoint, status = %resp.status(), "trigger delivery returned non-success");
                }
                Ok(Err(e)) => {
                    warn!(scent_id, endpoint, error = %e, "trigger delivery failed");
                }
                Err(_) => {
                    warn!(scent_id, endpoint, "trigger delivery timed out");
                }
            }
        });
    }
}

//! Blackboard core
//!
//! Owns the pheromone store, scent table, emission-history ring, and
//! trigger-handler table. Orchestrates `emit`/`sniff`/`register_scent`/
//! `deregister_scent`/`evaporate`/`inspect`. The transport layer only ever
//! calls these public operations — it never touches the store or scent
//! table directly (spec.md §3 Ownership).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::condition::{evaluate, EmissionRecord, EvaluationContext, EvaluationResult};
use super::config::Config;
use super::decay::{compute_intensity, is_evaporated, time_to_evaporation, DecayModel, TimeToEvaporation};
use super::error::BlackboardError;
use super::pheromone::{InMemoryStore, Pheromone, PheromoneStore, TagFilter};
use super::scent::{Scent, TriggerMode};

pub type TriggerHandler = Arc<dyn Fn(TriggerPayload) -> BoxFuture<'static, ()> + Send + Sync>;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Reserved trail prefixes (spec.md §6): `system.*`, `sbp.*`, `_*` are set
/// aside for the protocol's own internal signaling and are not available to
/// callers of `emit`.
fn is_reserved_trail(trail: &str) -> bool {
    trail.starts_with("system.") || trail.starts_with("sbp.") || trail.starts_with('_')
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    New,
    Reinforce,
    Replace,
    Max,
    Add,
}

impl Default for MergeStrategy {
    fn default() -> Self {
        MergeStrategy::Reinforce
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmitParams {
    pub trail: String,
    pub signal_type: String,
    pub intensity: f64,
    #[serde(default)]
    pub decay_model: Option<DecayModel>,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default)]
    pub source_agent: Option<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub ttl_floor: Option<f64>,
    #[serde(default)]
    pub merge_strategy: MergeStrategy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitAction {
    Created,
    Reinforced,
    Replaced,
    Merged,
}

#[derive(Debug, Clone, Serialize)]
pub struct EmitResult {
    pub id: String,
    pub action: EmitAction,
    pub current_intensity: f64,
    pub previous_intensity: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SniffParams {
    #[serde(default)]
    pub trails: Vec<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub min_intensity: Option<f64>,
    #[serde(default)]
    pub max_age_ms: Option<i64>,
    #[serde(default)]
    pub tags: TagFilter,
    #[serde(default)]
    pub include_evaporated: bool,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PheromoneSnapshot {
    pub id: String,
    pub trail: String,
    pub signal_type: String,
    pub current_intensity: f64,
    pub emitted_at: i64,
    pub last_reinforced_at: i64,
    pub payload: serde_json::Value,
    pub source_agent: Option<String>,
    pub tags: HashSet<String>,
}

/// Build a read-only snapshot of a pheromone's current state. Exposed for
/// the evaluation loop to build `TriggerPayload.context_pheromones` without
/// reaching into the store's internals.
pub fn snapshot(p: &Pheromone, now: i64) -> PheromoneSnapshot {
    PheromoneSnapshot::of(p, now)
}

impl PheromoneSnapshot {
    fn of(p: &Pheromone, now: i64) -> Self {
        Self {
            id: p.id.clone(),
            trail: p.trail.clone(),
            signal_type: p.signal_type.clone(),
            current_intensity: compute_intensity(p, now),
            emitted_at: p.emitted_at,
            last_reinforced_at: p.last_reinforced_at,
            payload: p.payload.clone(),
            source_agent: p.source_agent.clone(),
            tags: p.tags.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TrailAggregate {
    pub trail: String,
    pub signal_type: String,
    pub count: usize,
    pub sum_intensity: f64,
    pub max_intensity: f64,
    pub avg_intensity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SniffResult {
    pub pheromones: Vec<PheromoneSnapshot>,
    pub aggregates: Vec<TrailAggregate>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EvaporateParams {
    #[serde(default)]
    pub trail: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
    #[serde(default)]
    pub older_than_ms: Option<i64>,
    #[serde(default)]
    pub below_intensity: Option<f64>,
    #[serde(default)]
    pub tags: TagFilter,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaporateResult {
    pub removed_count: usize,
    pub affected_trails: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterScentParams {
    pub scent_id: String,
    #[serde(default)]
    pub agent_endpoint: Option<String>,
    pub condition: super::condition::Condition,
    #[serde(default)]
    pub cooldown_ms: u64,
    #[serde(default)]
    pub activation_payload: serde_json::Value,
    #[serde(default = "default_trigger_mode")]
    pub trigger_mode: TriggerMode,
    #[serde(default)]
    pub hysteresis: Option<f64>,
    #[serde(default = "default_max_execution_ms")]
    pub max_execution_ms: u64,
    #[serde(default)]
    pub context_trails: Option<HashSet<String>>,
}

fn default_trigger_mode() -> TriggerMode {
    TriggerMode::Level
}
fn default_max_execution_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterStatus {
    Registered,
    Updated,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterScentResult {
    pub scent_id: String,
    pub status: RegisterStatus,
    pub current_condition_state: EvaluationResult,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeregisterStatus {
    Deregistered,
    NotFound,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeregisterScentResult {
    pub scent_id: String,
    pub status: DeregisterStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InspectParams {
    #[serde(default = "default_true")]
    pub trails: bool,
    #[serde(default = "default_true")]
    pub scents: bool,
    #[serde(default = "default_true")]
    pub stats: bool,
    #[serde(default)]
    pub verbose: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct TrailInfo {
    pub trail: String,
    pub count: usize,
    pub total_intensity: f64,
    pub avg_intensity: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScentInfo {
    pub scent_id: String,
    pub agent_endpoint: Option<String>,
    pub last_condition_met: bool,
    pub in_cooldown: bool,
    pub last_triggered_at: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsInfo {
    pub total_pheromones: usize,
    pub active_pheromones: usize,
    pub scent_count: usize,
    pub uptime_ms: i64,
}

/// Per-pheromone diagnostic, only populated when `InspectParams.verbose`
/// is set. `time_to_evaporation` is spec.md §B's companion diagnostic to
/// `compute_intensity` — it was previously only logged at `trace` level
/// and never actually reached a caller.
#[derive(Debug, Clone, Serialize)]
pub struct PheromoneDiagnostic {
    pub id: String,
    pub trail: String,
    pub signal_type: String,
    pub intensity: f64,
    pub time_to_evaporation: TimeToEvaporation,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct InspectResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trails: Option<Vec<TrailInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scents: Option<Vec<ScentInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StatsInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<Vec<PheromoneDiagnostic>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TriggerPayload {
    pub scent_id: String,
    pub triggered_at: i64,
    pub condition_snapshot: EvaluationResult,
    pub context_pheromones: Vec<PheromoneSnapshot>,
    pub activation_payload: serde_json::Value,
}

pub struct Blackboard {
    store: Arc<dyn PheromoneStore>,
    config: Arc<Config>,
    scents: Mutex<HashMap<String, Scent>>,
    emission_history: Mutex<VecDeque<EmissionRecord>>,
    handlers: Mutex<HashMap<String, TriggerHandler>>,
    started_at: i64,
}

impl Blackboard {
    pub fn new(config: Arc<Config>) -> Self {
        Self::with_store(Arc::new(InMemoryStore::new()), config)
    }

    pub fn with_store(store: Arc<dyn PheromoneStore>, config: Arc<Config>) -> Self {
        Self {
            store,
            config,
            scents: Mutex::new(HashMap::new()),
            emission_history: Mutex::new(VecDeque::new()),
            handlers: Mutex::new(HashMap::new()),
            started_at: now_ms(),
        }
    }

    fn scents_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Scent>> {
        self.scents.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn history_lock(&self) -> std::sync::MutexGuard<'_, VecDeque<EmissionRecord>> {
        self.emission_history.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handlers_lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, TriggerHandler>> {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// emit(params) → EmitResult (spec.md §4.4).
    pub fn emit(&self, params: EmitParams) -> Result<EmitResult, BlackboardError> {
        if params.trail.is_empty() || params.signal_type.is_empty() {
            return Err(BlackboardError::InvalidInput(
                "trail and signal_type must be non-empty".into(),
            ));
        }
        if is_reserved_trail(&params.trail) {
            return Err(BlackboardError::InvalidInput(format!(
                "trail '{}' uses a reserved prefix (system.*, sbp.*, _*)",
                params.trail
            )));
        }
        if let Some(model) = &params.decay_model {
            super::decay::validate_decay_model(model).map_err(BlackboardError::InvalidInput)?;
        }
        let now = now_ms();
        let clamped = params.intensity.clamp(0.0, 1.0);
        let payload_hash = Pheromone::payload_hash(&params.payload);

        self.append_emission(&params.trail, &params.signal_type, now, clamped);

        let existing = if params.merge_strategy != MergeStrategy::New {
            self.store
                .values()
                .into_iter()
                .find(|p| {
                    p.trail == params.trail
                        && p.signal_type == params.signal_type
                        && Pheromone::payload_hash(&p.payload) == payload_hash
                        && !is_evaporated(p, now)
                })
        } else {
            None
        };

        let result = match existing {
            Some(mut p) => {
                let previous_intensity = compute_intensity(&p, now);
                let action = match params.merge_strategy {
                    MergeStrategy::Reinforce => {
                        p.initial_intensity = clamped;
                        p.last_reinforced_at = now;
                        EmitAction::Reinforced
                    }
                    MergeStrategy::Replace => {
                        p.initial_intensity = clamped;
                        p.last_reinforced_at = now;
                        p.payload = params.payload.clone();
                        p.tags = params.tags.clone();
                        p.source_agent = params.source_agent.clone();
                        EmitAction::Replaced
                    }
                    MergeStrategy::Max => {
                        p.initial_intensity = previous_intensity.max(clamped);
                        p.last_reinforced_at = now;
                        EmitAction::Merged
                    }
                    MergeStrategy::Add => {
                        p.initial_intensity = (previous_intensity + clamped).min(1.0);
                        p.last_reinforced_at = now;
                        EmitAction::Merged
                    }
                    MergeStrategy::New => unreachable!(),
                };
                let current_intensity = compute_intensity(&p, now);
                let id = p.id.clone();
                self.store.set(&id, p);
                debug!(trail = %params.trail, signal_type = %params.signal_type, ?action, "emit merged");
                EmitResult {
                    id,
                    action,
                    current_intensity,
                    previous_intensity: Some(previous_intensity),
                }
            }
            None => {
                let id = Uuid::now_v7().to_string();
                let decay_model = params
                    .decay_model
                    .unwrap_or_else(|| DecayModel::exponential(self.config.engine.default_half_life_ms));
                let ttl_floor = params.ttl_floor.unwrap_or(self.config.engine.default_ttl_floor);
                let p = Pheromone {
                    id: id.clone(),
                    trail: params.trail.clone(),
                    signal_type: params.signal_type.clone(),
                    emitted_at: now,
                    last_reinforced_at: now,
                    initial_intensity: clamped,
                    decay_model,
                    payload: params.payload.clone(),
                    source_agent: params.source_agent.clone(),
                    tags: params.tags.clone(),
                    ttl_floor,
                };
                let current_intensity = compute_intensity(&p, now);
                self.store.set(&id, p);
                info!(trail = %params.trail, signal_type = %params.signal_type, %id, "emit created");
                if self.store.size() > self.config.engine.max_pheromones {
                    self.garbage_collect(now);
                }
                EmitResult {
                    id,
                    action: EmitAction::Created,
                    current_intensity,
                    previous_intensity: None,
                }
            }
        };

        Ok(result)
    }

    fn append_emission(&self, trail: &str, signal_type: &str, now: i64, intensity: f64) {
        let mut history = self.history_lock();
        history.push_back(EmissionRecord {
            trail: trail.to_string(),
            signal_type: signal_type.to_string(),
            timestamp: now,
            intensity_sample: Some(intensity),
        });
        let window = self.config.engine.emission_history_window_ms as i64;
        let cutoff = now - window;
        while history.front().map(|r| r.timestamp < cutoff).unwrap_or(false) {
            history.pop_front();
        }
    }

    /// sniff(params) → SniffResult (spec.md §4.4).
    pub fn sniff(&self, params: SniffParams) -> SniffResult {
        let now = now_ms();
        let all = self.store.values();

        let mut filtered: Vec<&Pheromone> = all
            .iter()
            .filter(|p| {
                if !params.trails.is_empty() && !params.trails.contains(&p.trail) {
                    return false;
                }
                if !params.types.is_empty() && !params.types.contains(&p.signal_type) {
                    return false;
                }
                if !params.tags.matches(&p.tags) {
                    return false;
                }
                if let Some(max_age) = params.max_age_ms {
                    if now - p.emitted_at > max_age {
                        return false;
                    }
                }
                let evaporated = is_evaporated(p, now);
                if evaporated && !params.include_evaporated {
                    return false;
                }
                if let Some(min_intensity) = params.min_intensity {
                    if compute_intensity(p, now) < min_intensity {
                        return false;
                    }
                }
                true
            })
            .collect();

        filtered.sort_by(|a, b| {
            compute_intensity(b, now)
                .partial_cmp(&compute_intensity(a, now))
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut aggregates: HashMap<(String, String), (usize, f64, f64)> = HashMap::new();
        for p in &filtered {
            let intensity = compute_intensity(p, now);
            let entry = aggregates
                .entry((p.trail.clone(), p.signal_type.clone()))
                .or_insert((0, 0.0, 0.0));
            entry.0 += 1;
            entry.1 += intensity;
            entry.2 = entry.2.max(intensity);
        }

        let truncated: Vec<PheromoneSnapshot> = filtered
            .iter()
            .take(params.limit.unwrap_or(usize::MAX))
            .map(|p| PheromoneSnapshot::of(p, now))
            .collect();

        let mut aggregate_list: Vec<TrailAggregate> = aggregates
            .into_iter()
            .map(|((trail, signal_type), (count, sum, max))| TrailAggregate {
                trail,
                signal_type,
                count,
                sum_intensity: sum,
                max_intensity: max,
                avg_intensity: if count > 0 { sum / count as f64 } else { 0.0 },
            })
            .collect();
        aggregate_list.sort_by(|a, b| (a.trail.as_str(), a.signal_type.as_str()).cmp(&(b.trail.as_str(), b.signal_type.as_str())));

        SniffResult {
            pheromones: truncated,
            aggregates: aggregate_list,
            timestamp: now,
        }
    }

    /// evaporate(params) → EvaporateResult (spec.md §4.4).
    pub fn evaporate(&self, params: EvaporateParams) -> EvaporateResult {
        let now = now_ms();
        let mut removed = 0usize;
        let mut trails = HashSet::new();

        for (id, p) in self.store.entries() {
            if let Some(ref trail) = params.trail {
                if &p.trail != trail {
                    continue;
                }
            }
            if !params.types.is_empty() && !params.types.contains(&p.signal_type) {
                continue;
            }
            if let Some(older_than) = params.older_than_ms {
                if now - p.emitted_at < older_than {
                    continue;
                }
            }
            if !params.tags.matches(&p.tags) {
                continue;
            }
            if let Some(below) = params.below_intensity {
                if compute_intensity(&p, now) >= below {
                    continue;
                }
            }
            self.store.delete(&id);
            trails.insert(p.trail.clone());
            removed += 1;
        }

        warn!(removed, ?trails, "evaporate");
        EvaporateResult {
            removed_count: removed,
            affected_trails: trails.into_iter().collect(),
        }
    }

    /// registerScent(params) → RegisterScentResult (spec.md §4.4).
    pub fn register_scent(&self, params: RegisterScentParams) -> Result<RegisterScentResult, BlackboardError> {
        super::condition::validate(&params.condition).map_err(BlackboardError::InvalidCondition)?;
        let now = now_ms();
        let mut scents = self.scents_lock();
        let existing = scents.get(&params.scent_id).cloned();

        let mut scent = Scent {
            scent_id: params.scent_id.clone(),
            agent_endpoint: params.agent_endpoint,
            condition: params.condition,
            cooldown_ms: params.cooldown_ms,
            activation_payload: params.activation_payload,
            trigger_mode: params.trigger_mode,
            hysteresis: params.hysteresis,
            max_execution_ms: params.max_execution_ms,
            context_trails: params.context_trails,
            last_triggered_at: existing.as_ref().and_then(|s| s.last_triggered_at),
            last_condition_met: existing.as_ref().map(|s| s.last_condition_met).unwrap_or(false),
        };

        if existing.is_some() {
            scent.reset_runtime_on_update();
        }

        let current_condition_state = {
            let pheromones = self.store.values();
            let history = self.history_lock().iter().cloned().collect::<Vec<_>>();
            let ctx = EvaluationContext {
                pheromones: &pheromones,
                now,
                emission_history: &history,
            };
            evaluate(&scent.condition, &ctx)
        };

        let status = if existing.is_some() {
            RegisterStatus::Updated
        } else {
            RegisterStatus::Registered
        };
        info!(scent_id = %params.scent_id, ?status, "register_scent");
        scents.insert(params.scent_id.clone(), scent);

        Ok(RegisterScentResult {
            scent_id: params.scent_id,
            status,
            current_condition_state,
        })
    }

    /// deregisterScent(params) → DeregisterScentResult.
    pub fn deregister_scent(&self, scent_id: &str) -> DeregisterScentResult {
        let removed = self.scents_lock().remove(scent_id).is_some();
        self.handlers_lock().remove(scent_id);
        info!(scent_id, removed, "deregister_scent");
        DeregisterScentResult {
            scent_id: scent_id.to_string(),
            status: if removed {
                DeregisterStatus::Deregistered
            } else {
                DeregisterStatus::NotFound
            },
        }
    }

    /// inspect(params) → InspectResult.
    pub fn inspect(&self, params: InspectParams) -> InspectResult {
        let now = now_ms();
        let mut result = InspectResult::default();

        if params.trails {
            let pheromones = self.store.values();
            let mut per_trail: HashMap<String, (usize, f64)> = HashMap::new();
            for p in &pheromones {
                if is_evaporated(p, now) {
                    continue;
                }
                let intensity = compute_intensity(p, now);
                let entry = per_trail.entry(p.trail.clone()).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += intensity;
            }
            let mut trails: Vec<TrailInfo> = per_trail
                .into_iter()
                .map(|(trail, (count, total))| TrailInfo {
                    trail,
                    count,
                    total_intensity: total,
                    avg_intensity: if count > 0 { total / count as f64 } else { 0.0 },
                })
                .collect();
            trails.sort_by(|a, b| a.trail.cmp(&b.trail));
            if params.verbose {
                let mut diagnostics: Vec<PheromoneDiagnostic> = pheromones
                    .iter()
                    .map(|p| {
                        let ttl = time_to_evaporation(p);
                        trace!(id = %p.id, ttl = %time_to_evaporation_display(ttl), "diagnostic");
                        PheromoneDiagnostic {
                            id: p.id.clone(),
                            trail: p.trail.clone(),
                            signal_type: p.signal_type.clone(),
                            intensity: compute_intensity(p, now),
                            time_to_evaporation: ttl,
                        }
                    })
                    .collect();
                diagnostics.sort_by(|a, b| a.id.cmp(&b.id));
                result.diagnostics = Some(diagnostics);
            }
            result.trails = Some(trails);
        }

        if params.scents {
            let scents = self.scents_lock();
            let mut list: Vec<ScentInfo> = scents
                .values()
                .map(|s| ScentInfo {
                    scent_id: s.scent_id.clone(),
                    agent_endpoint: s.agent_endpoint.clone(),
                    last_condition_met: s.last_condition_met,
                    in_cooldown: s.in_cooldown(now),
                    last_triggered_at: s.last_triggered_at,
                })
                .collect();
            list.sort_by(|a, b| a.scent_id.cmp(&b.scent_id));
            result.scents = Some(list);
        }

        if params.stats {
            let scents = self.scents_lock();
            let total = self.store.size();
            let active = self.store.values().iter().filter(|p| !is_evaporated(p, now)).count();
            result.stats = Some(StatsInfo {
                total_pheromones: total,
                active_pheromones: active,
                scent_count: scents.len(),
                uptime_ms: now - self.started_at,
            });
        }

        result
    }

    /// Register an in-process trigger handler. A present handler preempts
    /// HTTP dispatch for that scent (spec.md §4.4).
    pub fn on_trigger(&self, scent_id: &str, handler: TriggerHandler) {
        self.handlers_lock().insert(scent_id.to_string(), handler);
    }

    pub fn off_trigger(&self, scent_id: &str) {
        self.handlers_lock().remove(scent_id);
    }

    pub fn handler_for(&self, scent_id: &str) -> Option<TriggerHandler> {
        self.handlers_lock().get(scent_id).cloned()
    }

    /// GC: delete every pheromone with `isEvaporated(p, now)` (spec.md §5).
    pub fn garbage_collect(&self, now: i64) -> usize {
        let mut removed = 0usize;
        for (id, p) in self.store.entries() {
            if is_evaporated(&p, now) {
                self.store.delete(&id);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "garbage collected evaporated pheromones");
        }
        removed
    }

    pub fn store(&self) -> &Arc<dyn PheromoneStore> {
        &self.store
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn snapshot_scents(&self) -> Vec<Scent> {
        self.scents_lock().values().cloned().collect()
    }

    pub fn get_scent(&self, scent_id: &str) -> Option<Scent> {
        self.scents_lock().get(scent_id).cloned()
    }

    pub fn update_scent_runtime(&self, scent_id: &str, last_triggered_at: Option<i64>, last_condition_met: bool) {
        if let Some(scent) = self.scents_lock().get_mut(scent_id) {
            if let Some(t) = last_triggered_at {
                scent.last_triggered_at = Some(t);
            }
            scent.last_condition_met = last_condition_met;
        }
    }

    pub fn emission_history_snapshot(&self) -> Vec<EmissionRecord> {
        self.history_lock().iter().cloned().collect()
    }
}

fn time_to_evaporation_display(t: TimeToEvaporation) -> String {
    match t {
        TimeToEvaporation::At { at_ms } => at_ms.to_string(),
        TimeToEvaporation::Never => "never".to_string(),
        TimeToEvaporation::AlreadyEvaporated => "evaporated".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::condition::{Aggregate, Condition, Operator};

    fn board() -> Blackboard {
        Blackboard::new(Arc::new(Config::default()))
    }

    #[test]
    fn emit_then_sniff_roundtrip() {
        let board = board();
        let result = board
            .emit(EmitParams {
                trail: "market.signals".into(),
                signal_type: "buy".into(),
                intensity: 0.9,
                decay_model: Some(DecayModel::Immortal),
                payload: serde_json::json!({"x": 1}),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::New,
            })
            .unwrap();
        assert_eq!(result.action, EmitAction::Created);

        let sniffed = board.sniff(SniffParams {
            trails: vec!["market.signals".into()],
            ..Default::default()
        });
        assert_eq!(sniffed.pheromones.len(), 1);
        assert!(sniffed.pheromones[0].current_intensity <= 0.9 + 1e-9);
    }

    #[test]
    fn reinforce_keeps_id_new_merge_gets_fresh_id() {
        let board = board();
        let payload = serde_json::json!({"k": "v"});
        let first = board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.5,
                decay_model: Some(DecayModel::Immortal),
                payload: payload.clone(),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::Reinforce,
            })
            .unwrap();
        let second = board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.9,
                decay_model: Some(DecayModel::Immortal),
                payload: payload.clone(),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::Reinforce,
            })
            .unwrap();
        assert_eq!(first.id, second.id);

        let fresh = board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.9,
                decay_model: Some(DecayModel::Immortal),
                payload,
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::New,
            })
            .unwrap();
        assert_ne!(first.id, fresh.id);
    }

    #[test]
    fn evaporate_removes_trail() {
        let board = board();
        board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.5,
                decay_model: Some(DecayModel::Immortal),
                payload: serde_json::json!({}),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::New,
            })
            .unwrap();
        board.evaporate(EvaporateParams {
            trail: Some("a".into()),
            types: vec![],
            older_than_ms: None,
            below_intensity: None,
            tags: TagFilter::default(),
        });
        let sniffed = board.sniff(SniffParams {
            trails: vec!["a".into()],
            ..Default::default()
        });
        assert_eq!(sniffed.pheromones.len(), 0);
    }

    #[test]
    fn register_scent_idempotent_status_transition() {
        let board = board();
        let condition = Condition::Threshold {
            trail: "a".into(),
            signal_type: "t".into(),
            tags: TagFilter::default(),
            aggregate: Aggregate::Any,
            operator: Operator::Ge,
            value: 1.0,
        };
        let first = board.register_scent(RegisterScentParams {
            scent_id: "s1".into(),
            agent_endpoint: None,
            condition: condition.clone(),
            cooldown_ms: 0,
            activation_payload: serde_json::json!({}),
            trigger_mode: TriggerMode::Level,
            hysteresis: None,
            max_execution_ms: 1000,
            context_trails: None,
        }).unwrap();
        assert_eq!(first.status, RegisterStatus::Registered);
        let second = board.register_scent(RegisterScentParams {
            scent_id: "s1".into(),
            agent_endpoint: None,
            condition,
            cooldown_ms: 0,
            activation_payload: serde_json::json!({}),
            trigger_mode: TriggerMode::Level,
            hysteresis: None,
            max_execution_ms: 1000,
            context_trails: None,
        }).unwrap();
        assert_eq!(second.status, RegisterStatus::Updated);
    }

    #[test]
    fn register_scent_rejects_invalid_condition() {
        let board = board();
        let condition = Condition::Threshold {
            trail: "".into(),
            signal_type: "t".into(),
            tags: TagFilter::default(),
            aggregate: Aggregate::Any,
            operator: Operator::Ge,
            value: 1.0,
        };
        let result = board.register_scent(RegisterScentParams {
            scent_id: "bad".into(),
            agent_endpoint: None,
            condition,
            cooldown_ms: 0,
            activation_payload: serde_json::json!({}),
            trigger_mode: TriggerMode::Level,
            hysteresis: None,
            max_execution_ms: 1000,
            context_trails: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn deregister_returns_not_found_when_absent() {
        let board = board();
        let result = board.deregister_scent("missing");
        assert_eq!(result.status, DeregisterStatus::NotFound);
    }

    #[test]
    fn emit_rejects_reserved_trail_prefixes() {
        let board = board();
        for trail in ["system.health", "sbp.internal", "_scratch"] {
            let err = board
                .emit(EmitParams {
                    trail: trail.into(),
                    signal_type: "t".into(),
                    intensity: 0.5,
                    decay_model: Some(DecayModel::Immortal),
                    payload: serde_json::json!({}),
                    source_agent: None,
                    tags: Default::default(),
                    ttl_floor: None,
                    merge_strategy: MergeStrategy::New,
                })
                .unwrap_err();
            assert_eq!(err.rpc_code(), -32602);
        }
    }

    #[test]
    fn emit_rejects_decay_model_that_would_increase_intensity() {
        let board = board();
        let err = board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.5,
                decay_model: Some(DecayModel::Linear { rate_per_ms: -0.01 }),
                payload: serde_json::json!({}),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::New,
            })
            .unwrap_err();
        assert_eq!(err.rpc_code(), -32602);
    }

    #[test]
    fn emit_rejects_non_finite_half_life() {
        let board = board();
        let err = board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.5,
                decay_model: Some(DecayModel::Exponential { half_life_ms: f64::NAN }),
                payload: serde_json::json!({}),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::New,
            })
            .unwrap_err();
        assert_eq!(err.rpc_code(), -32602);
    }

    #[test]
    fn emit_rejects_non_monotone_step_decay() {
        let board = board();
        let err = board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.5,
                decay_model: Some(DecayModel::Step {
                    steps: vec![
                        crate::core::decay::DecayStep { at_ms: 0, intensity: 0.2 },
                        crate::core::decay::DecayStep { at_ms: 1000, intensity: 0.8 },
                    ],
                }),
                payload: serde_json::json!({}),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::New,
            })
            .unwrap_err();
        assert_eq!(err.rpc_code(), -32602);
    }

    #[test]
    fn inspect_verbose_exposes_time_to_evaporation_diagnostic() {
        let board = board();
        board
            .emit(EmitParams {
                trail: "a".into(),
                signal_type: "t".into(),
                intensity: 0.9,
                decay_model: Some(DecayModel::Exponential { half_life_ms: 10_000.0 }),
                payload: serde_json::json!({}),
                source_agent: None,
                tags: Default::default(),
                ttl_floor: None,
                merge_strategy: MergeStrategy::New,
            })
            .unwrap();

        let quiet = board.inspect(InspectParams {
            trails: true,
            scents: false,
            stats: false,
            verbose: false,
        });
        assert!(quiet.diagnostics.is_none());

        let verbose = board.inspect(InspectParams {
            trails: true,
            scents: false,
            stats: false,
            verbose: true,
        });
        let diagnostics = verbose.diagnostics.expect("verbose inspect should expose diagnostics");
        assert_eq!(diagnostics.len(), 1);
        assert!(matches!(diagnostics[0].time_to_evaporation, TimeToEvaporation::At { .. }));
    }
}

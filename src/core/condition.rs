//! Scent condition language and evaluator
//!
//! A `Condition` is a small tree language (threshold / composite / rate /
//! pattern) evaluated against a snapshot of live pheromones plus a bounded
//! emission history. Evaluation is pure given its `EvaluationContext` — no
//! locks are taken here, the caller hands in an already-collected snapshot.

use serde::{Deserialize, Serialize};

use super::decay::compute_intensity;
use super::pheromone::{Pheromone, TagFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Sum,
    Max,
    Avg,
    Count,
    Any,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl Operator {
    pub fn apply(&self, lhs: f64, rhs: f64) -> bool {
        match self {
            Operator::Ge => lhs >= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Le => lhs <= rhs,
            Operator::Lt => lhs < rhs,
            Operator::Eq => (lhs - rhs).abs() < f64::EPSILON,
            Operator::Ne => (lhs - rhs).abs() >= f64::EPSILON,
        }
    }
}

/// A single step in a pattern condition: an emission matching `trail`/`type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternStep {
    pub trail: String,
    /// `"*"` matches any signal type.
    pub signal_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Condition {
    Threshold {
        trail: String,
        /// `"*"` matches any signal type.
        signal_type: String,
        #[serde(default)]
        tags: TagFilter,
        aggregate: Aggregate,
        operator: Operator,
        value: f64,
    },
    And {
        children: Vec<Condition>,
    },
    Or {
        children: Vec<Condition>,
    },
    Not {
        child: Box<Condition>,
    },
    Rate {
        trail: String,
        signal_type: String,
        window_ms: u64,
        metric: RateMetric,
        operator: Operator,
        value: f64,
    },
    Pattern {
        sequence: Vec<PatternStep>,
        window_ms: u64,
        #[serde(default = "default_true")]
        ordered: bool,
    },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateMetric {
    EmissionsPerSecond,
    IntensityDelta,
}

/// `(trail, type, timestamp)` — appended on every emit, pruned when older
/// than the history window. `intensity_sample` is carried so a future true
/// `intensity_delta` implementation has data to work from; the current
/// evaluator still approximates the delta as emission count (spec.md §9
/// Open Question), documented in DESIGN.md.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmissionRecord {
    pub trail: String,
    pub signal_type: String,
    pub timestamp: i64,
    pub intensity_sample: Option<f64>,
}

pub struct EvaluationContext<'a> {
    pub pheromones: &'a [Pheromone],
    pub now: i64,
    pub emission_history: &'a [EmissionRecord],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub met: bool,
    pub value: f64,
    pub matching_pheromone_ids: Vec<String>,
}

/// Structural validation (spec.md §6 `-32006 invalid_condition`): catches
/// malformed trees before they ever reach the evaluator — empty trail/type
/// names and non-finite comparison values, which would otherwise silently
/// evaluate to `false` forever rather than signal a caller mistake.
pub fn validate(condition: &Condition) -> Result<(), String> {
    match condition {
        Condition::Threshold { trail, signal_type, value, .. } => {
            if trail.is_empty() || signal_type.is_empty() {
                return Err("threshold condition requires non-empty trail and signal_type".into());
            }
            if !value.is_finite() {
                return Err("threshold value must be finite".into());
            }
            Ok(())
        }
        Condition::And { children } | Condition::Or { children } => {
            children.iter().try_for_each(validate)
        }
        Condition::Not { child } => validate(child),
        Condition::Rate { trail, signal_type, window_ms, value, .. } => {
            if trail.is_empty() || signal_type.is_empty() {
                return Err("rate condition requires non-empty trail and signal_type".into());
            }
            if *window_ms == 0 {
                return Err("rate condition window_ms must be positive".into());
            }
            if !value.is_finite() {
                return Err("rate value must be finite".into());
            }
            Ok(())
        }
        Condition::Pattern { sequence, window_ms, .. } => {
            if sequence.is_empty() {
                return Err("pattern condition requires a non-empty sequence".into());
            }
            if *window_ms == 0 {
                return Err("pattern condition window_ms must be positive".into());
            }
            if sequence.iter().any(|s| s.trail.is_empty() || s.signal_type.is_empty()) {
                return Err("pattern condition steps require non-empty trail and signal_type".into());
            }
            Ok(())
        }
    }
}

pub fn evaluate(condition: &Condition, ctx: &EvaluationContext) -> EvaluationResult {
    match condition {
        Condition::Threshold {
            trail,
            signal_type,
            tags,
            aggregate,
            operator,
            value,
        } => evaluate_threshold(trail, signal_type, tags, *aggregate, *operator, *value, ctx),
        Condition::And { children } => evaluate_and(children, ctx),
        Condition::Or { children } => evaluate_or(children, ctx),
        Condition::Not { child } => evaluate_not(child, ctx),
        Condition::Rate {
            trail,
            signal_type,
            window_ms,
            metric,
            operator,
            value,
        } => evaluate_rate(trail, signal_type, *window_ms, *metric, *operator, *value, ctx),
        Condition::Pattern {
            sequence,
            window_ms,
            ordered,
        } => evaluate_pattern(sequence, *window_ms, *ordered, ctx),
    }
}

fn matches_type(filter: &str, actual: &str) -> bool {
    filter == "*" || filter == actual
}

fn evaluate_threshold(
    trail: &str,
    signal_type: &str,
    tags: &TagFilter,
    aggregate: Aggregate,
    operator: Operator,
    value: f64,
    ctx: &EvaluationContext,
) -> EvaluationResult {
    let matches: Vec<&Pheromone> = ctx
        .pheromones
        .iter()
        .filter(|p| {
            p.trail == trail
                && matches_type(signal_type, &p.signal_type)
                && tags.matches(&p.tags)
                && super::decay::compute_intensity(p, ctx.now) >= p.ttl_floor
        })
        .collect();

    let intensities: Vec<f64> = matches.iter().map(|p| compute_intensity(p, ctx.now)).collect();

    let agg_value = match aggregate {
        Aggregate::Sum => intensities.iter().sum(),
        Aggregate::Max => intensities.iter().cloned().fold(0.0, f64::max),
        Aggregate::Avg => {
            if intensities.is_empty() {
                0.0
            } else {
                intensities.iter().sum::<f64>() / intensities.len() as f64
            }
        }
        Aggregate::Count => matches.len() as f64,
        Aggregate::Any => {
            if matches.is_empty() {
                0.0
            } else {
                1.0
            }
        }
    };

    EvaluationResult {
        met: operator.apply(agg_value, value),
        value: agg_value,
        matching_pheromone_ids: matches.iter().map(|p| p.id.clone()).collect(),
    }
}

fn evaluate_and(children: &[Condition], ctx: &EvaluationContext) -> EvaluationResult {
    if children.is_empty() {
        return EvaluationResult {
            met: false,
            value: 0.0,
            matching_pheromone_ids: vec![],
        };
    }
    let results: Vec<EvaluationResult> = children.iter().map(|c| evaluate(c, ctx)).collect();
    let met = results.iter().all(|r| r.met);
    let met_count = results.iter().filter(|r| r.met).count();
    EvaluationResult {
        met,
        value: met_count as f64,
        matching_pheromone_ids: union_ids(&results),
    }
}

fn evaluate_or(children: &[Condition], ctx: &EvaluationContext) -> EvaluationResult {
    if children.is_empty() {
        return EvaluationResult {
            met: false,
            value: 0.0,
            matching_pheromone_ids: vec![],
        };
    }
    let results: Vec<EvaluationResult> = children.iter().map(|c| evaluate(c, ctx)).collect();
    let met = results.iter().any(|r| r.met);
    let met_count = results.iter().filter(|r| r.met).count();
    EvaluationResult {
        met,
        value: met_count as f64,
        matching_pheromone_ids: union_ids(&results),
    }
}

fn evaluate_not(child: &Condition, ctx: &EvaluationContext) -> EvaluationResult {
    let result = evaluate(child, ctx);
    EvaluationResult {
        met: !result.met,
        value: if result.met { 0.0 } else { 1.0 },
        matching_pheromone_ids: result.matching_pheromone_ids,
    }
}

fn union_ids(results: &[EvaluationResult]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut ids = Vec::new();
    for r in results {
        for id in &r.matching_pheromone_ids {
            if seen.insert(id.clone()) {
                ids.push(id.clone());
            }
        }
    }
    ids
}

fn evaluate_rate(
    trail: &str,
    signal_type: &str,
    window_ms: u64,
    metric: RateMetric,
    operator: Operator,
    value: f64,
    ctx: &EvaluationContext,
) -> EvaluationResult {
    let cutoff = ctx.now - window_ms as i64;
    let records: Vec<&EmissionRecord> = ctx
        .emission_history
        .iter()
        .filter(|r| r.trail == trail && matches_type(signal_type, &r.signal_type) && r.timestamp >= cutoff)
        .collect();

    let metric_value = match metric {
        RateMetric::EmissionsPerSecond => {
            let seconds = (window_ms as f64 / 1000.0).max(f64::EPSILON);
            records.len() as f64 / seconds
        }
        // Open Question (spec.md §9): approximated as emission count over
        // the window until per-emission intensity sampling is wired up for
        // a true delta.
        RateMetric::IntensityDelta => records.len() as f64,
    };

    EvaluationResult {
        met: operator.apply(metric_value, value),
        value: metric_value,
        matching_pheromone_ids: vec![],
    }
}

fn evaluate_pattern(
    sequence: &[PatternStep],
    window_ms: u64,
    ordered: bool,
    ctx: &EvaluationContext,
) -> EvaluationResult {
    if sequence.is_empty() {
        return EvaluationResult {
            met: true,
            value: 1.0,
            matching_pheromone_ids: vec![],
        };
    }

    let cutoff = ctx.now - window_ms as i64;
    let candidates: Vec<&EmissionRecord> = ctx
        .emission_history
        .iter()
        .filter(|r| r.timestamp >= cutoff)
        .collect();

    let matched_steps = if ordered {
        let mut cursor = 0usize;
        let mut matched = 0usize;
        for step in sequence {
            let mut found = None;
            for (i, rec) in candidates.iter().enumerate().skip(cursor) {
                if rec.trail == step.trail && matches_type(&step.signal_type, &rec.signal_type) {
                    found = Some(i);
                    break;
                }
            }
            match found {
                Some(i) => {
                    cursor = i + 1;
                    matched += 1;
                }
                None => break,
            }
        }
        matched
    } else {
        let mut used = vec![false; candidates.len()];
        let mut matched = 0usize;
        for step in sequence {
            if let Some(i) = candidates.iter().enumerate().find_map(|(i, rec)| {
                if !used[i] && rec.trail == step.trail && matches_type(&step.signal_type, &rec.signal_type) {
                    Some(i)
                } else {
                    None
                }
            }) {
                used[i] = true;
                matched += 1;
            }
        }
        matched
    };

    EvaluationResult {
        met: matched_steps == sequence.len(),
        value: matched_steps as f64 / sequence.len() as f64,
        matching_pheromone_ids: vec![],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::decay::DecayModel;

    fn ph(trail: &str, signal_type: &str, intensity: f64) -> Pheromone {
        Pheromone {
            id: format!("{trail}/{signal_type}"),
            trail: trail.into(),
            signal_type: signal_type.into(),
            emitted_at: 0,
            last_reinforced_at: 0,
            initial_intensity: intensity,
            decay_model: DecayModel::Immortal,
            payload: serde_json::json!({}),
            source_agent: None,
            tags: Default::default(),
            ttl_floor: 0.01,
        }
    }

    #[test]
    fn threshold_max_aggregate() {
        let pheromones = vec![ph("a", "alert", 0.8), ph("a", "alert", 0.3)];
        let ctx = EvaluationContext {
            pheromones: &pheromones,
            now: 0,
            emission_history: &[],
        };
        let cond = Condition::Threshold {
            trail: "a".into(),
            signal_type: "alert".into(),
            tags: TagFilter::default(),
            aggregate: Aggregate::Max,
            operator: Operator::Ge,
            value: 0.7,
        };
        let result = evaluate(&cond, &ctx);
        assert!(result.met);
        assert_eq!(result.value, 0.8);
    }

    #[test]
    fn composite_and_empty_children_not_met() {
        let ctx = EvaluationContext {
            pheromones: &[],
            now: 0,
            emission_history: &[],
        };
        let cond = Condition::And { children: vec![] };
        assert!(!evaluate(&cond, &ctx).met);
    }

    #[test]
    fn composite_and_of_threshold_and_count() {
        let pheromones = vec![
            ph("a", "alert", 0.8),
            ph("a", "warn", 0.5),
            ph("a", "warn", 0.5),
            ph("a", "warn", 0.5),
        ];
        let ctx = EvaluationContext {
            pheromones: &pheromones,
            now: 0,
            emission_history: &[],
        };
        let cond = Condition::And {
            children: vec![
                Condition::Threshold {
                    trail: "a".into(),
                    signal_type: "alert".into(),
                    tags: TagFilter::default(),
                    aggregate: Aggregate::Max,
                    operator: Operator::Ge,
                    value: 0.7,
                },
                Condition::Threshold {
                    trail: "a".into(),
                    signal_type: "warn".into(),
                    tags: TagFilter::default(),
                    aggregate: Aggregate::Count,
                    operator: Operator::Ge,
                    value: 2.0,
                },
            ],
        };
        assert!(evaluate(&cond, &ctx).met);
    }

    #[test]
    fn pattern_ordered_sequence() {
        let history = vec![
            EmissionRecord { trail: "pipeline".into(), signal_type: "step-1".into(), timestamp: 0, intensity_sample: None },
            EmissionRecord { trail: "pipeline".into(), signal_type: "step-2".into(), timestamp: 100, intensity_sample: None },
            EmissionRecord { trail: "pipeline".into(), signal_type: "step-3".into(), timestamp: 200, intensity_sample: None },
        ];
        let ctx = EvaluationContext {
            pheromones: &[],
            now: 300,
            emission_history: &history,
        };
        let cond = Condition::Pattern {
            sequence: vec![
                PatternStep { trail: "pipeline".into(), signal_type: "step-1".into() },
                PatternStep { trail: "pipeline".into(), signal_type: "step-2".into() },
                PatternStep { trail: "pipeline".into(), signal_type: "step-3".into() },
            ],
            window_ms: 1000,
            ordered: true,
        };
        assert!(evaluate(&cond, &ctx).met);
    }

    #[test]
    fn pattern_reversed_fails_ordered_but_passes_unordered() {
        let history = vec![
            EmissionRecord { trail: "pipeline".into(), signal_type: "step-3".into(), timestamp: 0, intensity_sample: None },
            EmissionRecord { trail: "pipeline".into(), signal_type: "step-2".into(), timestamp: 100, intensity_sample: None },
            EmissionRecord { trail: "pipeline".into(), signal_type: "step-1".into(), timestamp: 200, intensity_sample: None },
        ];
        let sequence = vec![
            PatternStep { trail: "pipeline".into(), signal_type: "step-1".into() },
            PatternStep { trail: "pipeline".into(), signal_type: "step-2".into() },
            PatternStep { trail: "pipeline".into(), signal_type: "step-3".into() },
        ];
        let ctx = EvaluationContext {
            pheromones: &[],
            now: 300,
            emission_history: &history,
        };
        let ordered = Condition::Pattern {
            sequence: sequence.clone(),
            window_ms: 1000,
            ordered: true,
        };
        assert!(!evaluate(&ordered, &ctx).met);

        let unordered = Condition::Pattern {
            sequence,
            window_ms: 1000,
            ordered: false,
        };
        assert!(evaluate(&unordered, &ctx).met);
    }

    #[test]
    fn rate_emissions_per_second() {
        let history: Vec<EmissionRecord> = (0..5)
            .map(|i| EmissionRecord {
                trail: "a".into(),
                signal_type: "t".into(),
                timestamp: i * 100,
                intensity_sample: None,
            })
            .collect();
        let ctx = EvaluationContext {
            pheromones: &[],
            now: 1000,
            emission_history: &history,
        };
        let cond = Condition::Rate {
            trail: "a".into(),
            signal_type: "t".into(),
            window_ms: 1000,
            metric: RateMetric::EmissionsPerSecond,
            operator: Operator::Ge,
            value: 3.0,
        };
        assert!(evaluate(&cond, &ctx).met);
    }
}

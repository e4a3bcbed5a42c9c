//! Decay function
//!
//! Pure, side-effect-free mapping from a pheromone and a wall-clock instant
//! to its current intensity. Nothing here touches a clock itself — `now` is
//! always passed in — so the whole module is trivially testable and safe
//! to call from both the evaluation loop and request handlers without
//! synchronization.

use serde::{Deserialize, Serialize};

use super::pheromone::Pheromone;

/// A single point in a `Step` decay curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DecayStep {
    pub at_ms: u64,
    pub intensity: f64,
}

/// How a pheromone's intensity falls off with elapsed time.
///
/// Immutable once set on a pheromone (spec.md §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecayModel {
    Exponential { half_life_ms: f64 },
    Linear { rate_per_ms: f64 },
    /// `steps` MUST be sorted ascending by `at_ms`; callers that build this
    /// from untrusted input should sort before constructing.
    Step { steps: Vec<DecayStep> },
    Immortal,
}

impl DecayModel {
    pub fn exponential(half_life_ms: f64) -> Self {
        Self::Exponential { half_life_ms }
    }

    pub fn linear(rate_per_ms: f64) -> Self {
        Self::Linear { rate_per_ms }
    }

    pub fn step(mut steps: Vec<DecayStep>) -> Self {
        steps.sort_by(|a, b| a.at_ms.cmp(&b.at_ms));
        Self::Step { steps }
    }
}

/// Rejects decay model parameters that would break the monotone
/// non-increasing intensity invariant (spec.md §3) or produce non-finite
/// intensities downstream in `compute_intensity`. Called from `emit` before
/// a caller-supplied `decay_model` is ever stored.
pub fn validate_decay_model(model: &DecayModel) -> Result<(), String> {
    match model {
        DecayModel::Exponential { half_life_ms } => {
            if !half_life_ms.is_finite() || *half_life_ms < 0.0 {
                return Err("exponential decay_model requires a finite, non-negative half_life_ms".into());
            }
            Ok(())
        }
        DecayModel::Linear { rate_per_ms } => {
            if !rate_per_ms.is_finite() || *rate_per_ms < 0.0 {
                return Err("linear decay_model requires a finite, non-negative rate_per_ms (negative values would make intensity increase over time)".into());
            }
            Ok(())
        }
        DecayModel::Step { steps } => {
            if steps.is_empty() {
                return Err("step decay_model requires at least one step".into());
            }
            let mut last_intensity = f64::INFINITY;
            for step in steps {
                if !step.intensity.is_finite() || step.intensity < 0.0 {
                    return Err("step decay_model intensities must be finite and non-negative".into());
                }
                if step.intensity > last_intensity {
                    return Err("step decay_model intensities must be non-increasing by at_ms".into());
                }
                last_intensity = step.intensity;
            }
            Ok(())
        }
        DecayModel::Immortal => Ok(()),
    }
}

/// `current_intensity(p, t) = computeIntensity(p, t)` — never stored.
/// Storage holds only `initial_intensity` and `last_reinforced_at`.
pub fn compute_intensity(p: &Pheromone, now: i64) -> f64 {
    let elapsed = (now - p.last_reinforced_at).max(0) as f64;

    let raw = match &p.decay_model {
        DecayModel::Exponential { half_life_ms } => {
            if *half_life_ms <= 0.0 {
                if elapsed > 0.0 { 0.0 } else { p.initial_intensity }
            } else {
                p.initial_intensity * 0.5_f64.powf(elapsed / half_life_ms)
            }
        }
        DecayModel::Linear { rate_per_ms } => {
            (p.initial_intensity - rate_per_ms * elapsed).max(0.0)
        }
        DecayModel::Step { steps } => {
            let mut value = p.initial_intensity;
            for step in steps {
                if (step.at_ms as f64) <= elapsed {
                    value = step.intensity;
                } else {
                    break;
                }
            }
            value
        }
        DecayModel::Immortal => p.initial_intensity,
    };

    raw.clamp(0.0, 1.0)
}

/// `isEvaporated(p, now) = computeIntensity(p, now) < p.ttl_floor`.
pub fn is_evaporated(p: &Pheromone, now: i64) -> bool {
    compute_intensity(p, now) < p.ttl_floor
}

/// Diagnostic-only: inverts the closed-form decay to estimate the wall-clock
/// timestamp (ms since epoch) at which a pheromone will cross its
/// `ttl_floor`. Never used in the hot path — only by `inspect`'s verbose
/// diagnostics.
pub fn time_to_evaporation(p: &Pheromone) -> TimeToEvaporation {
    let floor = p.ttl_floor;
    if p.initial_intensity <= floor {
        return TimeToEvaporation::AlreadyEvaporated;
    }

    match &p.decay_model {
        DecayModel::Exponential { half_life_ms } => {
            if *half_life_ms <= 0.0 {
                return TimeToEvaporation::AlreadyEvaporated;
            }
            // floor = initial * 0.5^(t/hl)  =>  t = hl * log2(initial/floor)
            let ratio = p.initial_intensity / floor;
            let t = half_life_ms * ratio.log2();
            TimeToEvaporation::At { at_ms: p.last_reinforced_at + t.round() as i64 }
        }
        DecayModel::Linear { rate_per_ms } => {
            if *rate_per_ms <= 0.0 {
                TimeToEvaporation::Never
            } else {
                let t = (p.initial_intensity - floor) / rate_per_ms;
                TimeToEvaporation::At { at_ms: p.last_reinforced_at + t.round() as i64 }
            }
        }
        DecayModel::Step { steps } => {
            for step in steps {
                if step.intensity < floor {
                    return TimeToEvaporation::At { at_ms: p.last_reinforced_at + step.at_ms as i64 };
                }
            }
            TimeToEvaporation::Never
        }
        DecayModel::Immortal => TimeToEvaporation::Never,
    }
}

/// Wire-representable so `inspect`'s verbose trails diagnostic can emit it
/// directly (spec.md §B) instead of only logging it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TimeToEvaporation {
    At { at_ms: i64 },
    Never,
    AlreadyEvaporated,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pheromone::Pheromone;

    fn p(initial: f64, decay: DecayModel, reinforced_at: i64) -> Pheromone {
        Pheromone {
            id: "test".into(),
            trail: "a".into(),
            signal_type: "t".into(),
            emitted_at: reinforced_at,
            last_reinforced_at: reinforced_at,
            initial_intensity: initial,
            decay_model: decay,
            payload: serde_json::json!({}),
            source_agent: None,
            tags: Default::default(),
            ttl_floor: 0.01,
        }
    }

    #[test]
    fn exponential_half_life() {
        let ph = p(1.0, DecayModel::exponential(10_000.0), 0);
        assert!((compute_intensity(&ph, 0) - 1.0).abs() < 1e-9);
        assert!((compute_intensity(&ph, 10_000) - 0.5).abs() < 0.01);
        assert!((compute_intensity(&ph, 20_000) - 0.25).abs() < 0.01);
    }

    #[test]
    fn linear_clamps_at_zero() {
        let ph = p(1.0, DecayModel::linear(0.1), 0);
        assert_eq!(compute_intensity(&ph, 100_000), 0.0);
    }

    #[test]
    fn step_uses_greatest_applicable() {
        let ph = p(
            1.0,
            DecayModel::step(vec![
                DecayStep { at_ms: 0, intensity: 0.9 },
                DecayStep { at_ms: 1000, intensity: 0.5 },
                DecayStep { at_ms: 2000, intensity: 0.1 },
            ]),
            0,
        );
        assert_eq!(compute_intensity(&ph, 500), 0.9);
        assert_eq!(compute_intensity(&ph, 1500), 0.5);
        assert_eq!(compute_intensity(&ph, 3000), 0.1);
    }

    #[test]
    fn immortal_never_decays() {
        let ph = p(0.7, DecayModel::Immortal, 0);
        assert_eq!(compute_intensity(&ph, 1_000_000), 0.7);
    }

    #[test]
    fn monotone_non_increasing_exponential() {
        let ph = p(1.0, DecayModel::exponential(5_000.0), 0);
        let mut last = compute_intensity(&ph, 0);
        for t in (0..50_000).step_by(1000) {
            let cur = compute_intensity(&ph, t);
            assert!(cur <= last + 1e-9);
            last = cur;
        }
    }

    #[test]
    fn evaporation_threshold() {
        let ph = p(1.0, DecayModel::exponential(1000.0), 0);
        assert!(!is_evaporated(&ph, 0));
        assert!(is_evaporated(&ph, 100_000));
    }
}

//! Tunables for every stage of the engine.
//!
//! Each group has a `Default` carrying the production baseline; all of them
//! deserialize with missing fields falling back to those defaults, so a
//! deployment only spells out what it overrides.

use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlapOptions {
    /// Two sampled points closer than this are considered coincident.
    pub coincidence_threshold_m: f64,
    /// Routes are resampled to at most this spacing before comparison.
    pub sample_spacing_m: f64,
}

impl Default for OverlapOptions {
    fn default() -> Self {
        Self {
            coincidence_threshold_m: 120.0,
            sample_spacing_m: 40.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringWeights {
    pub overlap: f64,
    pub interest: f64,
}

impl ScoringWeights {
    /// Weights clamped to be non-negative and scaled to sum to 1. Falls back
    /// to overlap-only when both are zero.
    pub fn normalized(&self) -> Self {
        let overlap = self.overlap.max(0.0);
        let interest = self.interest.max(0.0);
        let sum = overlap + interest;
        if sum <= f64::EPSILON {
            return Self {
                overlap: 1.0,
                interest: 0.0,
            };
        }
        Self {
            overlap: overlap / sum,
            interest: interest / sum,
        }
    }
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            overlap: 0.8,
            interest: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingOptions {
    /// Candidates below this overlap score are not worth suggesting.
    pub min_overlap_score: f64,
    /// Every pair of participants must share at least this much of their
    /// time windows.
    pub min_time_overlap_minutes: u16,
    /// Upper bound on candidates returned per request.
    pub max_candidates: usize,
    /// Skip counterparts whose routes share no neighbouring H3 cell.
    pub spatial_prefilter: bool,
    /// H3 resolution used for the pre-filter.
    pub prefilter_resolution: u8,
    /// Largest gap allowed between consecutive route segments.
    pub continuity_tolerance_m: f64,
    pub walk_speed_kmh: f64,
    pub transit_speed_kmh: f64,
}

impl Default for MatchingOptions {
    fn default() -> Self {
        Self {
            min_overlap_score: 0.3,
            min_time_overlap_minutes: 10,
            max_candidates: 20,
            spatial_prefilter: true,
            prefilter_resolution: 8,
            continuity_tolerance_m: 150.0,
            walk_speed_kmh: 4.8,
            transit_speed_kmh: 20.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleOptions {
    /// How long a declined pair stays out of each other's suggestions.
    pub decline_cooldown_hours: i64,
    /// Pending suggestions older than this expire.
    pub suggestion_ttl_hours: i64,
    /// Terminal matches are dropped this long after their last update.
    pub retention_days: i64,
}

impl LifecycleOptions {
    pub fn decline_cooldown(&self) -> TimeDelta {
        TimeDelta::hours(self.decline_cooldown_hours)
    }

    pub fn suggestion_ttl(&self) -> TimeDelta {
        TimeDelta::hours(self.suggestion_ttl_hours)
    }

    pub fn retention(&self) -> TimeDelta {
        TimeDelta::days(self.retention_days)
    }
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            decline_cooldown_hours: 24,
            suggestion_ttl_hours: 48,
            retention_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Wall-clock budget for committing assignments in one run.
    pub run_budget_ms: u64,
    /// Pause between runs of the background worker.
    pub interval_ms: u64,
}

impl QueueOptions {
    pub fn run_budget(&self) -> Duration {
        Duration::from_millis(self.run_budget_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            run_budget_ms: 2_000,
            interval_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub overlap: OverlapOptions,
    pub weights: ScoringWeights,
    pub matching: MatchingOptions,
    pub lifecycle: LifecycleOptions,
    pub queue: QueueOptions,
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = serde_json::from_str(raw)
            .map_err(|err| EngineError::invalid(format!("config: {}", err)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.overlap.coincidence_threshold_m <= 0.0 {
            return Err(EngineError::invalid("coincidence_threshold_m must be positive"));
        }
        if self.overlap.sample_spacing_m <= 0.0 {
            return Err(EngineError::invalid("sample_spacing_m must be positive"));
        }
        if !(0.0..=1.0).contains(&self.matching.min_overlap_score) {
            return Err(EngineError::invalid("min_overlap_score must be within [0, 1]"));
        }
        if self.matching.prefilter_resolution > 15 {
            return Err(EngineError::invalid("prefilter_resolution must be at most 15"));
        }
        if self.matching.walk_speed_kmh <= 0.0 || self.matching.transit_speed_kmh <= 0.0 {
            return Err(EngineError::invalid("mode speeds must be positive"));
        }
        if self.lifecycle.decline_cooldown_hours < 0
            || self.lifecycle.suggestion_ttl_hours <= 0
            || self.lifecycle.retention_days < 0
        {
            return Err(EngineError::invalid("lifecycle durations must not be negative"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.overlap.coincidence_threshold_m, 120.0);
        assert_eq!(config.matching.min_time_overlap_minutes, 10);
        assert_eq!(config.lifecycle.decline_cooldown_hours, 24);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "weights": { "overlap": 0.6 }, "lifecycle": { "decline_cooldown_hours": 12 } }"#,
        )
        .expect("parse config");
        assert_eq!(config.weights.overlap, 0.6);
        assert_eq!(config.weights.interest, 0.2);
        assert_eq!(config.lifecycle.decline_cooldown_hours, 12);
        assert_eq!(config.lifecycle.retention_days, 30);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let err = EngineConfig::from_json_str(r#"{ "matching": { "min_overlap_score": 1.5 } }"#)
            .unwrap_err();
        assert_eq!(err.kind(), "invalid_input");
    }

    #[test]
    fn test_weights_normalized() {
        let weights = ScoringWeights {
            overlap: 3.0,
            interest: 1.0,
        }
        .normalized();
        assert!((weights.overlap - 0.75).abs() < 1e-12);
        assert!((weights.interest - 0.25).abs() < 1e-12);

        let zero = ScoringWeights {
            overlap: -1.0,
            interest: 0.0,
        }
        .normalized();
        assert_eq!(zero.overlap, 1.0);
    }
}

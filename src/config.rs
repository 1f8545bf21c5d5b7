use crate::models::ResourceKind;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Prior belief parameters for one resource kind: a Beta posterior scaled to
/// `scale`, the largest value the limit could plausibly take.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PriorParams {
    pub alpha: f64,
    pub beta: f64,
    pub scale: f64,
}

/// Nominal quota and prior for one resource kind.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceParams {
    /// Documented quota for the plan; fractions-of-nominal are measured
    /// against this value.
    pub nominal: f64,
    pub prior: PriorParams,
}

/// Per-plan quota table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanParameters {
    pub display_name: String,
    pub messages: ResourceParams,
    pub prompts: ResourceParams,
    pub tokens: ResourceParams,
}

impl PlanParameters {
    pub fn resource(&self, kind: ResourceKind) -> &ResourceParams {
        match kind {
            ResourceKind::Messages => &self.messages,
            ResourceKind::Prompts => &self.prompts,
            ResourceKind::Tokens => &self.tokens,
        }
    }
}

/// Thresholds and defaults for prompt-pattern classification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternConfig {
    /// Ratios at or below this are `simple`.
    pub simple_threshold: f64,
    /// Ratios at or above this are `complex`.
    pub complex_threshold: f64,
    pub simple_multiplier: f64,
    pub moderate_multiplier: f64,
    pub complex_multiplier: f64,
    pub mixed_multiplier: f64,
    /// Cold-start interval factors applied to the default multiplier.
    pub cold_start_low_factor: f64,
    pub cold_start_high_factor: f64,
    /// Relative half-width of computed bounds at exactly `min_samples`.
    pub base_half_width: f64,
    /// Half-width never shrinks below this.
    pub min_half_width: f64,
    /// Samples required before bounds are computed from history.
    pub min_samples: usize,
    /// Share of the recent window a category needs to dominate.
    pub dominance_share: f64,
    /// How many recent samples the dominant-pattern check looks at.
    pub recent_window: usize,
    /// Samples older than this age out of the rolling history.
    pub retention_days: i64,
    /// Hard cap on retained samples.
    pub max_samples: usize,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            simple_threshold: 3.0,
            complex_threshold: 9.0,
            simple_multiplier: 3.0,
            moderate_multiplier: 7.0,
            complex_multiplier: 18.0,
            mixed_multiplier: 10.0,
            cold_start_low_factor: 0.6,
            cold_start_high_factor: 1.4,
            base_half_width: 0.25,
            min_half_width: 0.10,
            min_samples: 5,
            dominance_share: 0.6,
            recent_window: 10,
            retention_days: 7,
            max_samples: 500,
        }
    }
}

/// Margins separating the four likelihood states, as ratios of projected
/// time-to-limit over remaining session time.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LikelihoodMargins {
    pub very_unlikely: f64,
    pub unlikely: f64,
    pub likely: f64,
}

impl Default for LikelihoodMargins {
    fn default() -> Self {
        Self {
            very_unlikely: 3.0,
            unlikely: 1.5,
            likely: 0.9,
        }
    }
}

/// Top-level configuration for the watcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    pub default_plan: String,
    pub session_duration_hours: i64,
    /// Inter-event gap that starts a new block, in seconds.
    pub idle_gap_seconds: i64,
    /// Window at the start of a block in which duplicate-timestamp clusters
    /// are treated as rewrite artifacts.
    pub batch_window_seconds: i64,
    /// Two events this close together belong to the same cluster.
    pub batch_tolerance_seconds: f64,
    pub pattern: PatternConfig,
    pub likelihood: LikelihoodMargins,
    /// A session that went quiet early counts as limit-hit only when its
    /// usage reached at least this fraction of the nominal quota.
    pub limit_hit_fraction: f64,
    /// Closed blocks need at least this many prompts to feed the posterior.
    pub min_prompts_for_belief: u32,
    /// Burn rates are undefined below this much elapsed time.
    pub min_elapsed_hours: f64,
    /// Belief observation counts at which confidence steps up.
    pub confidence_low_threshold: u32,
    pub confidence_high_threshold: u32,
    /// Host refresh cadence; the core itself never schedules.
    pub update_interval_seconds: u64,
    pub plans: HashMap<String, PlanParameters>,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            default_plan: "pro".to_string(),
            session_duration_hours: 5,
            idle_gap_seconds: 300,
            batch_window_seconds: 300,
            batch_tolerance_seconds: 2.0,
            pattern: PatternConfig::default(),
            likelihood: LikelihoodMargins::default(),
            limit_hit_fraction: 0.5,
            min_prompts_for_belief: 3,
            min_elapsed_hours: 0.1,
            confidence_low_threshold: 5,
            confidence_high_threshold: 10,
            update_interval_seconds: 30,
            plans: default_plans(),
        }
    }
}

impl WatchConfig {
    /// Plan table lookup, falling back to the configured default plan.
    pub fn plan(&self, name: &str) -> Option<&PlanParameters> {
        self.plans
            .get(name)
            .or_else(|| self.plans.get(&self.default_plan))
    }

    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Documented quota table for the known subscription plans.
fn default_plans() -> HashMap<String, PlanParameters> {
    let mut plans = HashMap::new();
    plans.insert(
        "pro".to_string(),
        PlanParameters {
            display_name: "Pro".to_string(),
            messages: ResourceParams {
                nominal: 45.0,
                prior: PriorParams { alpha: 8.0, beta: 2.0, scale: 60.0 },
            },
            prompts: ResourceParams {
                nominal: 40.0,
                prior: PriorParams { alpha: 6.0, beta: 3.0, scale: 100.0 },
            },
            tokens: ResourceParams {
                nominal: 19_000.0,
                prior: PriorParams { alpha: 4.0, beta: 2.0, scale: 30_000.0 },
            },
        },
    );
    plans.insert(
        "max5x".to_string(),
        PlanParameters {
            display_name: "Max5x".to_string(),
            messages: ResourceParams {
                nominal: 125.0,
                prior: PriorParams { alpha: 8.0, beta: 2.0, scale: 500.0 },
            },
            prompts: ResourceParams {
                nominal: 50.0,
                prior: PriorParams { alpha: 6.0, beta: 3.0, scale: 200.0 },
            },
            tokens: ResourceParams {
                nominal: 65_000.0,
                prior: PriorParams { alpha: 4.0, beta: 2.0, scale: 100_000.0 },
            },
        },
    );
    plans.insert(
        "max20x".to_string(),
        PlanParameters {
            display_name: "Max20x".to_string(),
            messages: ResourceParams {
                nominal: 900.0,
                prior: PriorParams { alpha: 8.0, beta: 2.0, scale: 2_000.0 },
            },
            prompts: ResourceParams {
                nominal: 200.0,
                prior: PriorParams { alpha: 6.0, beta: 3.0, scale: 800.0 },
            },
            tokens: ResourceParams {
                nominal: 220_000.0,
                prior: PriorParams { alpha: 4.0, beta: 2.0, scale: 400_000.0 },
            },
        },
    );
    plans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_plans_cover_documented_tiers() {
        let config = WatchConfig::default();
        for name in ["pro", "max5x", "max20x"] {
            let plan = config.plans.get(name).unwrap();
            for kind in ResourceKind::ALL {
                let params = plan.resource(kind);
                assert!(params.nominal > 0.0);
                assert!(params.prior.scale >= params.nominal);
            }
        }
    }

    #[test]
    fn unknown_plan_falls_back_to_default() {
        let config = WatchConfig::default();
        let plan = config.plan("enterprise-unknown").unwrap();
        assert_eq!(plan.display_name, "Pro");
    }

    #[test]
    fn config_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let created = WatchConfig::load_or_create(&path).unwrap();
        assert!(path.exists());

        let reloaded = WatchConfig::load_or_create(&path).unwrap();
        assert_eq!(created.default_plan, reloaded.default_plan);
        assert_eq!(created.idle_gap_seconds, reloaded.idle_gap_seconds);
        assert_eq!(created.plans.len(), reloaded.plans.len());
    }
}

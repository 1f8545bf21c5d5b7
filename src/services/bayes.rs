use crate::config::{PlanParameters, PriorParams};
use crate::error::SnapshotError;
use crate::models::{ResourceKind, SessionBlock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Pseudo-observation weight when a session hit a limit.
const HIT_STRENGTH: f64 = 3.0;
/// Weaker weight when a session timed out with margin to spare.
const MARGIN_STRENGTH: f64 = 1.0;

/// Belief about one resource limit: a Beta posterior over the limit divided
/// by `scale`, so `mean = alpha / (alpha + beta) * scale`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitBelief {
    pub alpha: f64,
    pub beta: f64,
    pub scale: f64,
    pub observations: u32,
}

impl LimitBelief {
    pub fn from_prior(prior: PriorParams) -> Self {
        Self {
            alpha: prior.alpha,
            beta: prior.beta,
            scale: prior.scale,
            observations: 0,
        }
    }

    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta) * self.scale
    }

    pub fn variance(&self) -> f64 {
        let ab = self.alpha + self.beta;
        (self.alpha * self.beta) / (ab * ab * (ab + 1.0)) * self.scale * self.scale
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Credible interval via a normal approximation to the Beta quantiles,
    /// clamped to the belief's support.
    pub fn credible_interval(&self, confidence: f64) -> (f64, f64) {
        let z = z_score(confidence);
        let mean = self.mean();
        let spread = z * self.std_dev();
        ((mean - spread).max(0.0), (mean + spread).min(self.scale))
    }

    /// Fold one closed-session observation into the posterior.
    ///
    /// Increments depend only on the observation itself, so replaying the
    /// same multiset of observations in any order lands on the same
    /// parameters, and alpha + beta only ever grows, so the variance shrinks
    /// with every update.
    pub fn update(&mut self, observed_usage: f64, hit_limit: bool) {
        let normalized = (observed_usage / self.scale).clamp(0.0, 1.0);
        if hit_limit {
            // The session ran into the limit: the observed usage sits at the
            // boundary, so pull the mean toward it with full weight.
            self.alpha += HIT_STRENGTH * normalized;
            self.beta += HIT_STRENGTH * (1.0 - normalized);
        } else {
            // Timed out with margin: the limit lies somewhere above the
            // observed usage, so anchor a weak pseudo-observation at the
            // midpoint of [observed, scale].
            let midpoint = (normalized + 1.0) / 2.0;
            self.alpha += MARGIN_STRENGTH * midpoint;
            self.beta += MARGIN_STRENGTH * (1.0 - midpoint);
        }
        self.observations += 1;
    }

    fn is_valid(&self) -> bool {
        self.alpha.is_finite()
            && self.beta.is_finite()
            && self.scale.is_finite()
            && self.alpha > 0.0
            && self.beta > 0.0
            && self.scale > 0.0
    }
}

fn z_score(confidence: f64) -> f64 {
    // The common levels the estimator is queried at; anything else gets the
    // conservative 95% score.
    if (confidence - 0.80).abs() < 1e-9 {
        1.2816
    } else if (confidence - 0.90).abs() < 1e-9 {
        1.6449
    } else {
        1.96
    }
}

/// Opaque serialized belief state, for the host's persistence hooks.
#[derive(Debug, Serialize, Deserialize)]
pub struct BeliefSnapshot {
    pub version: u32,
    pub plan: String,
    pub beliefs: HashMap<ResourceKind, LimitBelief>,
    pub total_observations: u32,
}

/// Maintains one [`LimitBelief`] per resource kind for a subscription plan.
///
/// Beliefs are informed only by closed sessions the pipeline hands over;
/// the estimator itself never looks at an open block.
#[derive(Debug, Clone)]
pub struct BayesianLimitEstimator {
    plan: String,
    beliefs: HashMap<ResourceKind, LimitBelief>,
    total_observations: u32,
}

impl BayesianLimitEstimator {
    /// Seed beliefs from the plan's documented quota table.
    pub fn new(plan_name: &str, plan: &PlanParameters) -> Self {
        let mut beliefs = HashMap::new();
        for kind in ResourceKind::ALL {
            beliefs.insert(kind, LimitBelief::from_prior(plan.resource(kind).prior));
        }
        Self {
            plan: plan_name.to_string(),
            beliefs,
            total_observations: 0,
        }
    }

    pub fn plan(&self) -> &str {
        &self.plan
    }

    /// Closed sessions folded in so far.
    pub fn observations(&self) -> u32 {
        self.total_observations
    }

    pub fn belief(&self, kind: ResourceKind) -> &LimitBelief {
        &self.beliefs[&kind]
    }

    pub fn posterior_mean(&self, kind: ResourceKind) -> f64 {
        self.beliefs[&kind].mean()
    }

    pub fn credible_interval(&self, kind: ResourceKind, confidence: f64) -> (f64, f64) {
        self.beliefs[&kind].credible_interval(confidence)
    }

    /// Fold one observation for one resource kind. `hit_limit` is the
    /// caller's judgement of whether this resource stopped the session.
    pub fn update(&mut self, kind: ResourceKind, observed_usage: f64, hit_limit: bool) {
        if let Some(belief) = self.beliefs.get_mut(&kind) {
            belief.update(observed_usage, hit_limit);
        }
    }

    /// Fold a whole closed block: one observation per resource kind.
    ///
    /// `ended_early` is the caller's knowledge of why the block closed: it
    /// went quiet with window time to spare rather than running out the
    /// clock. Such a session hit a limit if its usage also reached the
    /// configured fraction of the nominal quota; a session that ran the full
    /// window closed with margin, which is evidence the limit sits above
    /// what was used. Open blocks never feed the posterior.
    pub fn observe_closed_block(
        &mut self,
        block: &SessionBlock,
        plan: &PlanParameters,
        limit_hit_fraction: f64,
        ended_early: bool,
    ) {
        if block.is_open {
            log::warn!("Ignoring open block {} for belief update", block.id);
            return;
        }
        for kind in ResourceKind::ALL {
            let usage = block.usage(kind);
            let nominal = plan.resource(kind).nominal;
            let fraction_of_nominal = if nominal > 0.0 { usage / nominal } else { 0.0 };
            let hit_limit = ended_early && fraction_of_nominal >= limit_hit_fraction;
            self.update(kind, usage, hit_limit);
        }
        self.total_observations += 1;
        log::info!(
            "Updated limit beliefs from block {} ({} sessions analyzed)",
            block.id,
            self.total_observations
        );
    }

    pub fn snapshot(&self) -> BeliefSnapshot {
        BeliefSnapshot {
            version: 1,
            plan: self.plan.clone(),
            beliefs: self.beliefs.clone(),
            total_observations: self.total_observations,
        }
    }

    /// Restore persisted beliefs. On a corrupt snapshot the estimator keeps
    /// its current (prior) state and hands the error back; the host logs a
    /// warning and carries on from the priors.
    pub fn restore(&mut self, snapshot: BeliefSnapshot) -> Result<(), SnapshotError> {
        if snapshot.version != 1 {
            return Err(SnapshotError::BeliefStateCorrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.plan != self.plan {
            return Err(SnapshotError::BeliefStateCorrupt(format!(
                "snapshot is for plan {:?}, estimator is for {:?}",
                snapshot.plan, self.plan
            )));
        }
        for kind in ResourceKind::ALL {
            match snapshot.beliefs.get(&kind) {
                Some(belief) if belief.is_valid() => {}
                Some(_) => {
                    return Err(SnapshotError::BeliefStateCorrupt(format!(
                        "invalid shape parameters for {kind}"
                    )))
                }
                None => {
                    return Err(SnapshotError::BeliefStateCorrupt(format!(
                        "missing belief for {kind}"
                    )))
                }
            }
        }
        self.beliefs = snapshot.beliefs;
        self.total_observations = snapshot.total_observations;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResourceParams, WatchConfig};

    fn pro_plan() -> PlanParameters {
        WatchConfig::default().plans.get("pro").unwrap().clone()
    }

    #[test]
    fn prior_mean_matches_shape_parameters() {
        let belief = LimitBelief {
            alpha: 4.0,
            beta: 2.0,
            scale: 1000.0,
            observations: 0,
        };
        assert!((belief.mean() - 666.67).abs() < 0.01);
        assert!((belief.variance() - 31746.03).abs() < 1.0);
    }

    #[test]
    fn hit_observations_pull_the_mean_toward_the_boundary() {
        let mut belief = LimitBelief {
            alpha: 4.0,
            beta: 2.0,
            scale: 1000.0,
            observations: 0,
        };
        let before = belief.mean();
        belief.update(400.0, true);
        assert!(belief.mean() < before);

        let mut high = LimitBelief {
            alpha: 2.0,
            beta: 4.0,
            scale: 1000.0,
            observations: 0,
        };
        let before = high.mean();
        high.update(900.0, true);
        assert!(high.mean() > before);
    }

    #[test]
    fn variance_shrinks_with_every_update() {
        let mut belief = LimitBelief {
            alpha: 4.0,
            beta: 2.0,
            scale: 1000.0,
            observations: 0,
        };
        let mut last = belief.variance();
        for (usage, hit) in [(500.0, true), (800.0, false), (300.0, true), (950.0, false)] {
            belief.update(usage, hit);
            assert!(belief.variance() < last);
            last = belief.variance();
        }
    }

    #[test]
    fn replay_order_does_not_change_the_posterior() {
        let observations = [
            (500.0, true),
            (800.0, false),
            (300.0, true),
            (950.0, true),
            (600.0, false),
        ];

        let run = |order: &[usize]| {
            let mut belief = LimitBelief {
                alpha: 4.0,
                beta: 2.0,
                scale: 1000.0,
                observations: 0,
            };
            for &i in order {
                let (usage, hit) = observations[i];
                belief.update(usage, hit);
            }
            belief
        };

        let forward = run(&[0, 1, 2, 3, 4]);
        let backward = run(&[4, 3, 2, 1, 0]);
        let shuffled = run(&[2, 0, 4, 1, 3]);

        assert!((forward.mean() - backward.mean()).abs() < 1e-9);
        assert!((forward.variance() - backward.variance()).abs() < 1e-9);
        assert!((forward.mean() - shuffled.mean()).abs() < 1e-9);
    }

    #[test]
    fn repeated_limit_hits_drag_the_posterior_down() {
        // Plan with nominal prompt quota 18 and a prior centered near 15:
        // alpha 6, beta 2, scale 20 gives mean 15.
        let mut plan = pro_plan();
        plan.prompts = ResourceParams {
            nominal: 18.0,
            prior: PriorParams {
                alpha: 6.0,
                beta: 2.0,
                scale: 20.0,
            },
        };
        let mut estimator = BayesianLimitEstimator::new("pro", &plan);

        let prior = *estimator.belief(ResourceKind::Prompts);
        assert!((prior.mean() - 15.0).abs() < 0.01);
        let (prior_low, prior_high) = prior.credible_interval(0.95);

        for usage in [12.0, 13.0, 12.0] {
            estimator.update(ResourceKind::Prompts, usage, true);
        }

        let posterior = estimator.belief(ResourceKind::Prompts);
        assert!(posterior.mean() < prior.mean());
        assert!(posterior.mean() > 12.0);
        assert!(posterior.mean() < 14.5);

        let (low, high) = posterior.credible_interval(0.95);
        assert!(high - low < prior_high - prior_low);
    }

    #[test]
    fn open_blocks_never_feed_the_posterior() {
        let plan = pro_plan();
        let mut estimator = BayesianLimitEstimator::new("pro", &plan);
        let block = SessionBlock {
            id: "open".to_string(),
            start_time: chrono::Utc::now(),
            end_time: chrono::Utc::now() + chrono::Duration::hours(5),
            actual_end: chrono::Utc::now(),
            events: Vec::new(),
            user_prompts: 30,
            assistant_messages: 90,
            total_size_units: 10_000,
            per_model_size: Default::default(),
            artifacts: 0,
            is_open: true,
        };
        estimator.observe_closed_block(&block, &plan, 0.5, true);
        assert_eq!(estimator.observations(), 0);
    }

    #[test]
    fn corrupt_snapshot_falls_back_to_priors() {
        let plan = pro_plan();
        let mut estimator = BayesianLimitEstimator::new("pro", &plan);
        let prior_mean = estimator.posterior_mean(ResourceKind::Prompts);

        let mut snapshot = estimator.snapshot();
        snapshot
            .beliefs
            .insert(ResourceKind::Prompts, LimitBelief {
                alpha: f64::NAN,
                beta: -1.0,
                scale: 0.0,
                observations: 3,
            });

        assert!(estimator.restore(snapshot).is_err());
        // Estimator state is untouched: still the plan priors.
        assert_eq!(estimator.posterior_mean(ResourceKind::Prompts), prior_mean);
        assert_eq!(estimator.observations(), 0);
    }

    #[test]
    fn snapshot_roundtrips() {
        let plan = pro_plan();
        let mut estimator = BayesianLimitEstimator::new("pro", &plan);
        estimator.update(ResourceKind::Tokens, 15_000.0, true);

        let json = serde_json::to_string(&estimator.snapshot()).unwrap();
        let mut restored = BayesianLimitEstimator::new("pro", &plan);
        restored
            .restore(serde_json::from_str(&json).unwrap())
            .unwrap();

        assert_eq!(
            restored.posterior_mean(ResourceKind::Tokens),
            estimator.posterior_mean(ResourceKind::Tokens)
        );
    }
}

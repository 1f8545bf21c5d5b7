use crate::config::WatchConfig;
use crate::models::{
    ConfidenceLevel, Likelihood, PredictionOutcome, PredictionResult, Projection,
    RemainingInteractions, ResourceKind, SessionBlock,
};
use crate::services::bayes::BayesianLimitEstimator;
use crate::services::pattern::PatternClassifier;
use chrono::{DateTime, Utc};

/// Combines burn rate, classifier bounds and limit beliefs into the final
/// verdict. Pure: everything it needs comes in as arguments.
pub struct PredictionEngine {
    very_unlikely_margin: f64,
    unlikely_margin: f64,
    likely_margin: f64,
    min_elapsed_hours: f64,
    confidence_low: u32,
    confidence_high: u32,
}

impl PredictionEngine {
    pub fn new(config: &WatchConfig) -> Self {
        Self {
            very_unlikely_margin: config.likelihood.very_unlikely,
            unlikely_margin: config.likelihood.unlikely,
            likely_margin: config.likelihood.likely,
            min_elapsed_hours: config.min_elapsed_hours,
            confidence_low: config.confidence_low_threshold,
            confidence_high: config.confidence_high_threshold,
        }
    }

    /// Predict whether the current block will run into a limit before its
    /// window ends. A block with no interactions yet (or one too young for a
    /// meaningful rate) yields `InsufficientData`, which is not the same
    /// thing as low confidence: low confidence still projects numbers.
    pub fn predict(
        &self,
        current_block: Option<&SessionBlock>,
        classifier: &PatternClassifier,
        estimator: &BayesianLimitEstimator,
        now: DateTime<Utc>,
    ) -> PredictionResult {
        let confidence = self.confidence_level(estimator.observations());
        let sessions_analyzed = estimator.observations();

        let block = match current_block {
            Some(block) if block.is_open => block,
            _ => return insufficient(confidence, sessions_analyzed),
        };

        let elapsed = block.elapsed_hours(now);
        if block.user_prompts == 0 || elapsed < self.min_elapsed_hours {
            return insufficient(confidence, sessions_analyzed);
        }

        // 1. Burn rate per resource, in units per hour.
        // 2. Projected exhaustion per resource from the posterior mean.
        // 3. The limiting factor is whichever runs out first.
        let mut limiting: Option<(ResourceKind, f64)> = None;
        for kind in ResourceKind::ALL {
            let used = block.usage(kind);
            let burn = used / elapsed;
            if burn <= 0.0 {
                continue;
            }
            let remaining_budget = (estimator.posterior_mean(kind) - used).max(0.0);
            let hours = remaining_budget / burn;
            if limiting.map_or(true, |(_, best)| hours < best) {
                limiting = Some((kind, hours));
            }
        }

        let (limiting_factor, time_to_limit_hours) = match limiting {
            Some(found) => found,
            None => return insufficient(confidence, sessions_analyzed),
        };

        let session_remaining_hours = block.remaining_hours(now);
        let likelihood = self.classify_likelihood(time_to_limit_hours, session_remaining_hours);
        let remaining = self.remaining_interactions(block, classifier, estimator);

        PredictionResult {
            confidence,
            sessions_analyzed,
            outcome: PredictionOutcome::Projection(Projection {
                remaining,
                limiting_factor,
                likelihood,
                time_to_limit_hours,
                session_remaining_hours,
            }),
        }
    }

    /// Step function of observation count only; the likelihood never moves it.
    pub fn confidence_level(&self, observations: u32) -> ConfidenceLevel {
        if observations >= self.confidence_high {
            ConfidenceLevel::High
        } else if observations >= self.confidence_low {
            ConfidenceLevel::Medium
        } else {
            ConfidenceLevel::Low
        }
    }

    fn classify_likelihood(&self, time_to_limit: f64, session_remaining: f64) -> Likelihood {
        if session_remaining <= 0.0 {
            // The window is over; nothing left to exhaust.
            return Likelihood::VeryUnlikely;
        }
        let ratio = time_to_limit / session_remaining;
        if ratio >= self.very_unlikely_margin {
            Likelihood::VeryUnlikely
        } else if ratio >= self.unlikely_margin {
            Likelihood::Unlikely
        } else if ratio >= self.likely_margin {
            Likelihood::Likely
        } else {
            Likelihood::VeryLikely
        }
    }

    /// Remaining-interaction estimate. The point comes from the believed
    /// prompt limit; the interval is the envelope of the prompt-limit
    /// credible interval and the classifier's multiplier bounds applied to
    /// the remaining believed message budget.
    fn remaining_interactions(
        &self,
        block: &SessionBlock,
        classifier: &PatternClassifier,
        estimator: &BayesianLimitEstimator,
    ) -> RemainingInteractions {
        let prompts_used = block.usage(ResourceKind::Prompts);
        let messages_used = block.usage(ResourceKind::Messages);

        let point = (estimator.posterior_mean(ResourceKind::Prompts) - prompts_used).max(0.0);

        let (belief_low, belief_high) = estimator.credible_interval(ResourceKind::Prompts, 0.80);
        let belief_remaining_low = (belief_low - prompts_used).max(0.0);
        let belief_remaining_high = (belief_high - prompts_used).max(0.0);

        let bounds = classifier.bounds();
        let message_budget =
            (estimator.posterior_mean(ResourceKind::Messages) - messages_used).max(0.0);
        // A higher multiplier burns the message budget faster, so it maps to
        // the low end of remaining prompts.
        let derived_low = message_budget / bounds.high.max(1.0);
        let derived_high = message_budget / bounds.low.max(1.0);

        let low = belief_remaining_low.min(derived_low);
        let high = belief_remaining_high.max(derived_high);
        let point = point.clamp(low, high);

        RemainingInteractions {
            point: point.round() as u32,
            low: low.floor() as u32,
            high: high.ceil() as u32,
        }
    }
}

fn insufficient(confidence: ConfidenceLevel, sessions_analyzed: u32) -> PredictionResult {
    PredictionResult {
        confidence,
        sessions_analyzed,
        outcome: PredictionOutcome::InsufficientData,
    }
}

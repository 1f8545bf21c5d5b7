use crate::config::PatternConfig;
use crate::error::SnapshotError;
use crate::models::{BoundsSource, MultiplierBounds, PatternCategory, PatternSample};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Classifies per-prompt complexity and keeps a rolling sample history from
/// which multiplier bounds are computed.
#[derive(Debug, Clone)]
pub struct PatternClassifier {
    config: PatternConfig,
    samples: VecDeque<PatternSample>,
}

/// Opaque serialized form of the rolling history, for the host's
/// persistence hooks.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClassifierSnapshot {
    pub version: u32,
    pub samples: Vec<PatternSample>,
}

impl PatternClassifier {
    pub fn new(config: PatternConfig) -> Self {
        Self {
            config,
            samples: VecDeque::new(),
        }
    }

    /// Bucket a sample ratio by the configured thresholds. `Mixed` is an
    /// aggregate label and never comes out of here.
    pub fn classify(&self, ratio: f64) -> PatternCategory {
        if ratio <= self.config.simple_threshold {
            PatternCategory::Simple
        } else if ratio >= self.config.complex_threshold {
            PatternCategory::Complex
        } else {
            PatternCategory::Moderate
        }
    }

    /// Append a sample and age out anything past the retention window.
    pub fn record(&mut self, at: DateTime<Utc>, ratio: f64) {
        let sample = PatternSample {
            at,
            ratio,
            category: self.classify(ratio),
        };
        log::debug!("Recorded prompt sample ratio {ratio:.1} ({})", sample.category);
        self.samples.push_back(sample);
        self.expire(at);
        while self.samples.len() > self.config.max_samples {
            self.samples.pop_front();
        }
    }

    fn expire(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::days(self.config.retention_days);
        while self.samples.front().map_or(false, |s| s.at < cutoff) {
            self.samples.pop_front();
        }
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Dominant category over the recent window, `Mixed` when none reaches
    /// the dominance share.
    pub fn dominant_pattern(&self) -> PatternCategory {
        if self.samples.len() < 3 {
            return PatternCategory::Mixed;
        }
        let recent: Vec<_> = self
            .samples
            .iter()
            .rev()
            .take(self.config.recent_window)
            .collect();
        let total = recent.len() as f64;
        for category in [
            PatternCategory::Simple,
            PatternCategory::Moderate,
            PatternCategory::Complex,
        ] {
            let count = recent.iter().filter(|s| s.category == category).count() as f64;
            if count / total >= self.config.dominance_share {
                return category;
            }
        }
        PatternCategory::Mixed
    }

    fn default_multiplier(&self, category: PatternCategory) -> f64 {
        match category {
            PatternCategory::Simple => self.config.simple_multiplier,
            PatternCategory::Moderate => self.config.moderate_multiplier,
            PatternCategory::Complex => self.config.complex_multiplier,
            PatternCategory::Mixed => self.config.mixed_multiplier,
        }
    }

    /// Expected-multiplier interval from the rolling history.
    ///
    /// Below the minimum sample threshold this is the cold-start path: the
    /// plan-level default for the dominant pattern with the configured wide
    /// factors, marked `ColdStart` so downstream confidence can tell the
    /// difference. Computed bounds weight each category's default by its
    /// frequency in the history; the half-width shrinks as the sample count
    /// grows, so the interval never widens with more evidence, and a larger
    /// complex share can only push the expectation and high bound up.
    pub fn bounds(&self) -> MultiplierBounds {
        let n = self.samples.len();
        if n < self.config.min_samples {
            let expected = self.default_multiplier(self.dominant_pattern());
            return MultiplierBounds {
                low: (expected * self.config.cold_start_low_factor).max(1.0),
                expected,
                high: expected * self.config.cold_start_high_factor,
                source: BoundsSource::ColdStart,
            };
        }

        let total = n as f64;
        let expected: f64 = [
            PatternCategory::Simple,
            PatternCategory::Moderate,
            PatternCategory::Complex,
        ]
        .iter()
        .map(|&category| {
            let share =
                self.samples.iter().filter(|s| s.category == category).count() as f64 / total;
            share * self.default_multiplier(category)
        })
        .sum();

        let shrink = (self.config.min_samples as f64 / n as f64).sqrt();
        let half_width = (self.config.base_half_width * shrink).max(self.config.min_half_width);

        MultiplierBounds {
            low: (expected * (1.0 - half_width)).max(1.0),
            expected,
            high: expected * (1.0 + half_width),
            source: BoundsSource::Computed { samples: n },
        }
    }

    pub fn snapshot(&self) -> ClassifierSnapshot {
        ClassifierSnapshot {
            version: 1,
            samples: self.samples.iter().copied().collect(),
        }
    }

    /// Restore a persisted history. Invalid snapshots leave the classifier
    /// empty (cold start) and report the problem to the caller.
    pub fn restore(&mut self, snapshot: ClassifierSnapshot) -> Result<(), SnapshotError> {
        if snapshot.version != 1 {
            return Err(SnapshotError::HistoryCorrupt(format!(
                "unsupported snapshot version {}",
                snapshot.version
            )));
        }
        if snapshot.samples.iter().any(|s| !s.ratio.is_finite() || s.ratio < 0.0) {
            return Err(SnapshotError::HistoryCorrupt(
                "non-finite or negative ratio in history".to_string(),
            ));
        }
        let mut samples: Vec<PatternSample> = snapshot.samples;
        samples.sort_by_key(|s| s.at);
        self.samples = samples.into();
        Ok(())
    }
}

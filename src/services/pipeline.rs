use crate::config::WatchConfig;
use crate::error::SnapshotError;
use crate::models::{BatchWriteWarning, Event, EventRole, PredictionResult, SessionBlock};
use crate::services::bayes::{BayesianLimitEstimator, BeliefSnapshot};
use crate::services::blocks::SessionBlockBuilder;
use crate::services::ingest::LogIngestor;
use crate::services::pattern::{ClassifierSnapshot, PatternClassifier};
use crate::services::predict::PredictionEngine;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

/// Outcome of one pipeline invocation.
#[derive(Debug)]
pub struct PipelineReport {
    pub prediction: PredictionResult,
    pub warnings: Vec<BatchWriteWarning>,
    pub new_events: usize,
    pub skipped_records: usize,
}

/// Combined persisted state for the host's load/save hooks. Opaque to the
/// host: it decides where the bytes live, not what they mean.
#[derive(Debug, Serialize, Deserialize)]
pub struct PipelineState {
    pub version: u32,
    pub classifier: ClassifierSnapshot,
    pub beliefs: BeliefSnapshot,
    /// Ids of closed blocks already folded into the learners, so a restart
    /// followed by a full re-ingest cannot double-count.
    pub folded_blocks: Vec<String>,
}

/// The four-stage pipeline with its three owned state stores.
///
/// Designed for repeated invocation on a fixed cadence by an external
/// scheduler; every `run` is idempotent with respect to already-processed
/// records. The caller serializes concurrent invocations; at most one run
/// is in flight.
pub struct Pipeline {
    config: WatchConfig,
    plan_name: String,
    ingestor: LogIngestor,
    builder: SessionBlockBuilder,
    classifier: PatternClassifier,
    estimator: BayesianLimitEstimator,
    engine: PredictionEngine,
    events: Vec<Event>,
    blocks: Vec<SessionBlock>,
    folded_blocks: HashSet<String>,
}

impl Pipeline {
    pub fn new(config: WatchConfig, plan_name: &str) -> Result<Self> {
        let plan = config
            .plan(plan_name)
            .ok_or_else(|| anyhow!("unknown plan {plan_name:?} and no default configured"))?;
        let estimator = BayesianLimitEstimator::new(plan_name, plan);
        let builder = SessionBlockBuilder::new(&config);
        let classifier = PatternClassifier::new(config.pattern.clone());
        let engine = PredictionEngine::new(&config);
        Ok(Self {
            config,
            plan_name: plan_name.to_string(),
            ingestor: LogIngestor::new(),
            builder,
            classifier,
            estimator,
            engine,
            events: Vec::new(),
            blocks: Vec::new(),
            folded_blocks: HashSet::new(),
        })
    }

    pub fn plan_name(&self) -> &str {
        &self.plan_name
    }

    pub fn blocks(&self) -> &[SessionBlock] {
        &self.blocks
    }

    pub fn current_block(&self) -> Option<&SessionBlock> {
        self.blocks.last().filter(|b| b.is_open)
    }

    pub fn classifier(&self) -> &PatternClassifier {
        &self.classifier
    }

    pub fn estimator(&self) -> &BayesianLimitEstimator {
        &self.estimator
    }

    /// Run the full pipeline over a batch of raw records.
    ///
    /// Each stage commits its state as a whole: ingestion marks commit after
    /// the batch parses, blocks are swapped in one piece, and the learners
    /// are updated on clones that replace the originals only when the fold
    /// stage finishes.
    pub fn run(&mut self, records: &[(String, Value)], now: DateTime<Utc>) -> PipelineReport {
        // Stage 1: normalize raw records, skipping what does not validate.
        let ingest = self
            .ingestor
            .ingest(records.iter().map(|(s, v)| (s.as_str(), v)));
        let new_events = ingest.events.len();
        let skipped_records = ingest.skipped;
        if new_events > 0 {
            self.events.extend(ingest.events);
            self.events.sort_by_key(|e| e.timestamp);
        }

        // Stage 2: segment into session blocks.
        let output = self.builder.build(&self.events, now);
        self.blocks = output.blocks;
        for warning in &output.warnings {
            log::warn!("Batch-write cluster mid-block: {warning}");
        }

        // Stage 3: fold newly closed blocks into the learners.
        self.fold_closed_blocks();

        // Stage 4: predict from the current block.
        let prediction =
            self.engine
                .predict(self.current_block(), &self.classifier, &self.estimator, now);

        PipelineReport {
            prediction,
            warnings: output.warnings,
            new_events,
            skipped_records,
        }
    }

    /// Fold every closed, not-yet-seen block into classifier and beliefs,
    /// exactly once per block id.
    fn fold_closed_blocks(&mut self) {
        let plan = match self.config.plan(&self.plan_name) {
            Some(plan) => plan.clone(),
            None => return,
        };

        let mut classifier = self.classifier.clone();
        let mut estimator = self.estimator.clone();
        let mut folded = self.folded_blocks.clone();

        for block in self.blocks.iter().filter(|b| !b.is_open) {
            if !folded.insert(block.id.clone()) {
                continue;
            }
            for (at, ratio) in prompt_ratios(block) {
                classifier.record(at, ratio);
            }
            if block.user_prompts >= self.config.min_prompts_for_belief {
                // Went quiet with more than an idle gap of window left, as
                // opposed to running out the clock.
                let ended_early = block.end_time - block.actual_end
                    > chrono::Duration::seconds(self.config.idle_gap_seconds);
                estimator.observe_closed_block(
                    block,
                    &plan,
                    self.config.limit_hit_fraction,
                    ended_early,
                );
            } else {
                log::debug!(
                    "Block {} has {} prompts, too few to judge limits",
                    block.id,
                    block.user_prompts
                );
            }
        }

        self.classifier = classifier;
        self.estimator = estimator;
        self.folded_blocks = folded;
    }

    /// Export the persistable learner state.
    pub fn state_snapshot(&self) -> PipelineState {
        PipelineState {
            version: 1,
            classifier: self.classifier.snapshot(),
            beliefs: self.estimator.snapshot(),
            folded_blocks: self.folded_blocks.iter().cloned().collect(),
        }
    }

    /// Restore persisted learner state. A corrupt snapshot degrades to the
    /// cold-start/prior state with a logged warning instead of failing the
    /// host; the returned error is informational.
    pub fn restore_state(&mut self, state: PipelineState) -> Result<(), SnapshotError> {
        if state.version != 1 {
            return Err(SnapshotError::BeliefStateCorrupt(format!(
                "unsupported state version {}",
                state.version
            )));
        }
        let mut result = Ok(());

        if let Err(e) = self.classifier.restore(state.classifier) {
            log::warn!("Classifier history failed validation, starting cold: {e}");
            result = Err(e);
        }
        if let Err(e) = self.estimator.restore(state.beliefs) {
            log::warn!("Belief state failed validation, falling back to plan priors: {e}");
            result = Err(e);
        }
        self.folded_blocks = state.folded_blocks.into_iter().collect();
        result
    }
}

/// Per-prompt downstream-work ratios in a block: for each counted prompt,
/// the number of assistant messages it triggered before the next prompt.
/// Prompts that produced nothing are not samples.
fn prompt_ratios(block: &SessionBlock) -> Vec<(DateTime<Utc>, f64)> {
    let mut ratios = Vec::new();
    let mut open_prompt: Option<DateTime<Utc>> = None;
    let mut assistant_count = 0u32;

    for event in &block.events {
        if event.is_prompt() {
            if let Some(at) = open_prompt.take() {
                if assistant_count > 0 {
                    ratios.push((at, assistant_count as f64));
                }
            }
            assistant_count = 0;
            open_prompt = Some(event.timestamp);
        } else if event.role == EventRole::Assistant && !event.artifact {
            assistant_count += 1;
        }
    }
    if let Some(at) = open_prompt {
        if assistant_count > 0 {
            ratios.push((at, assistant_count as f64));
        }
    }
    ratios
}

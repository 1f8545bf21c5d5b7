use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Who produced an interaction event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventRole {
    User,
    Assistant,
    System,
}

impl fmt::Display for EventRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventRole::User => write!(f, "user"),
            EventRole::Assistant => write!(f, "assistant"),
            EventRole::System => write!(f, "system"),
        }
    }
}

/// One interaction turn parsed from the usage log.
///
/// Immutable once parsed, except for the `artifact` flag which the block
/// builder sets when it excludes the event from counts.
#[derive(Clone, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    pub role: EventRole,
    /// Coarse size signal: total tokens when usage data exists, otherwise
    /// content character count.
    pub size_units: u64,
    pub model: Option<String>,
    /// User-role entries that carry a tool result instead of a typed prompt.
    pub tool_result: bool,
    /// Excluded from counts by the batch-write filter; retained for audit.
    pub artifact: bool,
    pub message_id: Option<String>,
    pub request_id: Option<String>,
}

impl Event {
    /// A countable user prompt: user-role, not a tool result, not an artifact.
    pub fn is_prompt(&self) -> bool {
        self.role == EventRole::User && !self.tool_result && !self.artifact
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("timestamp", &self.timestamp)
            .field("role", &self.role)
            .field("size_units", &self.size_units)
            .field("model", &self.model)
            .field("tool_result", &self.tool_result)
            .field("artifact", &self.artifact)
            .field("message_id", &"[REDACTED]") // Redact ids for privacy
            .field("request_id", &"[REDACTED]")
            .finish()
    }
}

/// A 5-hour usage window assembled from consecutive events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionBlock {
    /// ISO-8601 of the block start time.
    pub id: String,
    pub start_time: DateTime<Utc>,
    /// start_time + session duration.
    pub end_time: DateTime<Utc>,
    /// Timestamp of the last event seen in the block.
    pub actual_end: DateTime<Utc>,
    pub events: Vec<Event>,
    pub user_prompts: u32,
    pub assistant_messages: u32,
    pub total_size_units: u64,
    pub per_model_size: HashMap<String, u64>,
    pub artifacts: u32,
    pub is_open: bool,
}

impl SessionBlock {
    /// Messages counted against the message quota: prompts plus replies.
    pub fn message_count(&self) -> u32 {
        self.user_prompts + self.assistant_messages
    }

    /// Usage of a resource kind, in that resource's units.
    pub fn usage(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Messages => self.message_count() as f64,
            ResourceKind::Prompts => self.user_prompts as f64,
            ResourceKind::Tokens => self.total_size_units as f64,
        }
    }

    /// Hours between block start and `now`, capped at the block window.
    pub fn elapsed_hours(&self, now: DateTime<Utc>) -> f64 {
        let end = if now < self.end_time { now } else { self.end_time };
        (end - self.start_time).num_seconds().max(0) as f64 / 3600.0
    }

    /// Hours left in the block window at `now`.
    pub fn remaining_hours(&self, now: DateTime<Utc>) -> f64 {
        (self.end_time - now).num_seconds().max(0) as f64 / 3600.0
    }
}

/// Mid-block duplicate-timestamp cluster; counted normally but surfaced
/// so the caller can flag suspect data.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchWriteWarning {
    pub block_id: String,
    pub at: DateTime<Utc>,
    pub cluster_size: usize,
}

impl fmt::Display for BatchWriteWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} events with near-identical timestamps at {} in block {}",
            self.cluster_size, self.at, self.block_id
        )
    }
}

/// The resources a session can run out of.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Messages,
    Prompts,
    Tokens,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Messages,
        ResourceKind::Prompts,
        ResourceKind::Tokens,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Messages => write!(f, "messages"),
            ResourceKind::Prompts => write!(f, "prompts"),
            ResourceKind::Tokens => write!(f, "tokens"),
        }
    }
}

/// Complexity label for one prompt outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternCategory {
    Simple,
    Moderate,
    Complex,
    /// Aggregate label when no single category dominates recent history.
    Mixed,
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternCategory::Simple => write!(f, "simple"),
            PatternCategory::Moderate => write!(f, "moderate"),
            PatternCategory::Complex => write!(f, "complex"),
            PatternCategory::Mixed => write!(f, "mixed"),
        }
    }
}

/// One prompt outcome: how much downstream work a single prompt triggered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PatternSample {
    pub at: DateTime<Utc>,
    /// Assistant messages produced per user prompt.
    pub ratio: f64,
    pub category: PatternCategory,
}

/// Where a multiplier interval came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundsSource {
    /// History below the minimum sample threshold; plan defaults in effect.
    ColdStart,
    Computed { samples: usize },
}

/// Expected assistant-per-prompt multiplier with an uncertainty interval.
#[derive(Debug, Clone, Copy)]
pub struct MultiplierBounds {
    pub low: f64,
    pub expected: f64,
    pub high: f64,
    pub source: BoundsSource,
}

impl MultiplierBounds {
    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// How likely the session is to hit a limit before its window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Likelihood {
    VeryUnlikely,
    Unlikely,
    Likely,
    VeryLikely,
}

impl fmt::Display for Likelihood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Likelihood::VeryUnlikely => write!(f, "very unlikely to hit limits this session"),
            Likelihood::Unlikely => write!(f, "unlikely to hit limits this session"),
            Likelihood::Likely => write!(f, "likely to hit limits this session"),
            Likelihood::VeryLikely => write!(f, "very likely to hit limits this session"),
        }
    }
}

/// How much observed history backs the prediction. Derived purely from
/// observation counts, never from how extreme the likelihood is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    Low,
    Medium,
    High,
}

impl fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfidenceLevel::Low => write!(f, "low confidence - gathering initial data"),
            ConfidenceLevel::Medium => {
                write!(f, "medium confidence - still learning usage patterns")
            }
            ConfidenceLevel::High => write!(f, "high confidence - trained on observed sessions"),
        }
    }
}

/// Remaining-interaction estimate with its interval.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RemainingInteractions {
    pub point: u32,
    pub low: u32,
    pub high: u32,
}

/// Numeric projection for a session with a defined burn rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Projection {
    pub remaining: RemainingInteractions,
    pub limiting_factor: ResourceKind,
    pub likelihood: Likelihood,
    pub time_to_limit_hours: f64,
    pub session_remaining_hours: f64,
}

/// Either a numeric projection or an explicit no-data marker. The marker is
/// not a confidence level: low confidence still yields numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PredictionOutcome {
    InsufficientData,
    Projection(Projection),
}

/// Terminal, consumer-facing value of one pipeline run. Always rederivable
/// from block state, classifier history and beliefs; never persisted as a
/// source of truth.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictionResult {
    pub confidence: ConfidenceLevel,
    pub sessions_analyzed: u32,
    pub outcome: PredictionOutcome,
}

impl PredictionResult {
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self.outcome, PredictionOutcome::InsufficientData)
    }
}

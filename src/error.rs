use thiserror::Error;

/// A single raw record failed validation. Logged and skipped by the
/// ingestor; never fatal to the stream.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("record has no usable timestamp")]
    MissingTimestamp,
    #[error("record timestamp is not valid RFC 3339: {0}")]
    BadTimestamp(String),
    #[error("record role {0:?} is not user, assistant or system")]
    UnknownRole(String),
    #[error("assistant record carries no token usage")]
    MissingUsage,
    #[error("record is not a JSON object")]
    NotAnObject,
}

/// A persisted state snapshot failed validation on load. The caller falls
/// back to plan priors and logs a warning; the host never crashes over it.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("belief state corrupt: {0}")]
    BeliefStateCorrupt(String),
    #[error("classifier history corrupt: {0}")]
    HistoryCorrupt(String),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

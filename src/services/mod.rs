pub mod bayes;
pub mod blocks;
pub mod ingest;
pub mod pattern;
pub mod pipeline;
pub mod predict;

pub use bayes::{BayesianLimitEstimator, BeliefSnapshot, LimitBelief};
pub use blocks::{BlockOutput, SessionBlockBuilder};
pub use ingest::{FileEventSource, IngestReport, LogIngestor};
pub use pattern::{ClassifierSnapshot, PatternClassifier};
pub use pipeline::{Pipeline, PipelineReport, PipelineState};
pub use predict::PredictionEngine;

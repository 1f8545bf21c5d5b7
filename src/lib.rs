//! Predicts whether the current Claude usage session will exhaust its
//! interaction quota before the session's 5-hour window ends.
//!
//! The core is a four-stage pipeline over the local usage log:
//! ingestion → session-block segmentation → pattern classification →
//! Bayesian limit estimation, feeding a prediction engine. Presentation,
//! scheduling and storage media live in the host binary.

pub mod config;
pub mod error;
pub mod models;
pub mod services;

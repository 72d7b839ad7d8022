//! Configuration errors
//!
//! Every error in this crate is a configuration error: it is raised while a
//! profile or scenario is being constructed, so a scenario that fails here
//! never starts.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Unsupported impairment profile kind: {0}")]
    UnsupportedProfile(String),

    #[error("Invalid magnitude for {kind} profile: {reason}")]
    InvalidMagnitude { kind: String, reason: String },

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Invalid percentage: {0}")]
    InvalidPercent(String),

    #[error("Duplicate node name: {0}")]
    DuplicateNode(String),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Invalid link #{index}: {reason}")]
    InvalidLink { index: usize, reason: String },

    #[error("Invalid impairment target: {0}")]
    InvalidTarget(String),

    #[error("Invalid protocol test: {0}")]
    InvalidTest(String),

    #[error("Invalid scenario file: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

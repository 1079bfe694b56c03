//! Typed failure boundaries.
//!
//! Fatal conditions end the run and are carried by [`RunError`]. Per-item
//! failures never show up here: they are recorded as
//! [`crate::pipeline::ItemOutcome`] values and folded into the run stats.

use thiserror::Error;

/// Problems with the mode-selecting settings, detected before any I/O.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{key} is not set")]
    Missing { key: &'static str },

    #[error("invalid storage URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("invalid output prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },
}

/// Why a run ended in the `Failed` state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RunError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("validation failed for {target}: {reason}")]
    Validation { target: String, reason: String },

    #[error("no markdown files were successfully uploaded ({discovered} discovered)")]
    NoUploads { discovered: u64 },

    #[error("run timeout exceeded: {seconds}s")]
    TimedOut { seconds: u64 },

    #[error("run interrupted")]
    Interrupted,
}

impl RunError {
    /// Process exit code for this failure. 130 is the conventional SIGINT code.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Interrupted => 130,
            _ => 1,
        }
    }
}

impl From<ConfigError> for RunError {
    fn from(err: ConfigError) -> Self {
        RunError::Configuration(err.to_string())
    }
}

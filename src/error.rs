//! Setup-level failures that abort a whole run.
//!
//! Per-task problems (a binary exiting non-zero, a missing artifact) are never
//! errors: they become verdicts in the report.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("Required data is unavailable: {path} ({reason})")]
    DataUnavailable { path: PathBuf, reason: String },

    #[error("Failed to write report to {path}: {source}")]
    ReportWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Run interrupted, no report written")]
    Cancelled,
}

impl HarnessError {
    pub fn data_unavailable(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::DataUnavailable {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

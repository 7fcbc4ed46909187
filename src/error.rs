//! Failures a caller of the pipeline may want to tell apart.
//!
//! Everything else travels as `anyhow::Error` with context attached; these
//! variants are what the orchestrator returns (wrapped in `anyhow`) for
//! run-level outcomes. Use `err.downcast_ref::<PipelineError>()` to match.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// The run was cancelled. `stragglers` threads were still alive when the
    /// join timeout ran out and have been detached.
    #[error("interrupted ({stragglers} thread(s) did not stop within the join timeout)")]
    Interrupted { stragglers: usize },

    #[error("no accelerator units found")]
    NoAccelerators,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Every worker exited before the readers finished, so nothing could
    /// consume the queue.
    #[error("all {workers} workers of dataset '{dataset}' failed")]
    AllWorkersFailed { dataset: String, workers: usize },
}

impl PipelineError {
    /// True if this error came from a cancelled run.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}

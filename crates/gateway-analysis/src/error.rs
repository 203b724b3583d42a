//! Errors surfaced by the analysis engine.

use thiserror::Error;

/// Launching a background window task is the only fallible operation.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("no tokio runtime available to launch task {task}")]
    NoRuntime { task: String },

    #[error("task runner has been stopped, refusing to launch task {task}")]
    RunnerStopped { task: String },

    #[error("recurring task {task} requires a non-zero period")]
    ZeroPeriod { task: String },
}

//! Fatal pipeline conditions.
//!
//! Recoverable outcomes (command timeouts, spawn failures, remote generation
//! misses, unparsable sources) are values, not errors. Everything here aborts
//! the run once it reaches the orchestrator's top-level handler.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Clone failed (exit code {exit_code})")]
    CloneFailed { exit_code: i32 },

    #[error("Failed to create the test environment")]
    EnvironmentUnavailable,

    #[error("Refusing to write outside the workspace: {path}")]
    UnsafePath { path: String },
}

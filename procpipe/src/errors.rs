//! Error types for pipeline construction, lifecycle and execution.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Everything that can go wrong while building, running or finishing a pipeline.
///
/// Configuration and state errors are raised synchronously, before any
/// side effect. Execution errors are only produced on request, by
/// [`Pipeline::check`](crate::Pipeline::check) and the blocking helpers.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Invalid or contradictory setup (empty pipeline, a stream directive
    /// that makes no sense for its role, conflicting text-mode flags).
    #[error("configuration error: {0}")]
    Config(String),

    /// Operation invoked in the wrong lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// `wait` exceeded its deadline. The pipeline keeps running.
    #[error("pipeline did not finish within {timeout:?}")]
    Timeout { timeout: Duration },

    /// Aggregate return code is not in the allowed set.
    #[error(
        "command '{command}' returned non-zero exit status {returncode}{}",
        stderr_suffix(.stderr)
    )]
    Execution {
        returncode: i32,
        command: String,
        stderr: String,
    },

    /// A stage could not be started.
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Aggregate return code carried by an execution error.
    pub fn returncode(&self) -> Option<i32> {
        match self {
            PipelineError::Execution { returncode, .. } => Some(*returncode),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::Timeout { .. })
    }

    /// The underlying OS error kind, for spawn and I/O failures.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            PipelineError::Spawn { source, .. } => Some(source.kind()),
            PipelineError::Io(e) => Some(e.kind()),
            _ => None,
        }
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.is_empty() {
        String::new()
    } else {
        format!("; stderr:\n{}", stderr)
    }
}

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("component was cancelled")]
    Cancelled,

    #[error("component panicked: {0}")]
    Panic(String),

    #[error("component did not stop within {0:?}")]
    Timeout(Duration),
}

/// Outcome of a full shutdown pass.
#[derive(Clone, Debug)]
pub enum ShutdownResult {
    Graceful {
        duration: Duration,
        components_completed: usize,
    },
    ForcedTermination {
        duration: Duration,
        components_completed: usize,
        components_aborted: usize,
        aborted_names: Vec<String>,
    },
}

impl ShutdownResult {
    pub fn is_graceful(&self) -> bool {
        matches!(self, ShutdownResult::Graceful { .. })
    }
}

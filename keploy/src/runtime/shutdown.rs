use std::time::Duration;

/// Configuration for the ordered shutdown sequence.
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Total budget for the graceful phase across all components.
    pub timeout: Duration,
    /// Grace given to a component after it is aborted, so writes in flight
    /// can complete.
    pub write_grace: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            write_grace: Duration::from_secs(5),
        }
    }
}

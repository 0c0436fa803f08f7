use thiserror::Error;

/// Main application error type for the agent.
///
/// The variants mirror the recovery policy: `Command`/`Internal`/`StoreWrite`
/// abort the session, `ProtocolMalformed`/`MockMiss` are per-exchange and the
/// session continues, `ContextCancelled` is a propagated shutdown and never
/// reported as a failure to the caller.
#[derive(Debug, Error)]
pub enum KeployError {
    /// The user command failed to start.
    #[error("failed to start the user command: {0}")]
    Command(String),

    /// The user command exited unexpectedly during recording.
    #[error("user application stopped unexpectedly: {0}")]
    AppStopped(String),

    /// Propagated shutdown; not an error from the caller's point of view.
    #[error("context cancelled")]
    ContextCancelled,

    /// Bug-class error: hook load failed, proxy failed to bind, and the like.
    #[error("internal error: {0}")]
    Internal(String),

    /// A single exchange could not be framed; the connection is demoted to
    /// pass-through.
    #[error("malformed {kind} exchange: {reason}")]
    ProtocolMalformed { kind: &'static str, reason: String },

    /// No recorded mock matched an observed outgoing request.
    #[error("no recorded mock matched request to {host}")]
    MockMiss { host: String },

    /// Persisting a captured record failed; the session aborts to avoid
    /// silent data loss.
    #[error("failed to persist captured record: {0}")]
    StoreWrite(String),

    /// Configuration could not be assembled.
    #[error("configuration error: {0}")]
    Conf(#[from] crate::runtime::conf::ConfError),

    /// Socket-level failure while proxying.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl KeployError {
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn malformed(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::ProtocolMalformed {
            kind,
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with KeployError.
pub type Result<T> = std::result::Result<T, KeployError>;

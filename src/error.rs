//! Error types for scout-core.

use thiserror::Error;

/// Result type alias using scout-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during agent orchestration.
#[derive(Error, Debug)]
pub enum Error {
    /// Caller supplied invalid input (empty query, wrong state for operation)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Run was called on a session that is already acquired
    #[error("Session {session_id} already has a run in progress")]
    SessionInProgress { session_id: String },

    /// Attempted state transition not in the legal table
    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// Concurrency cap reached and the cap policy rejects new runs
    #[error("Session capacity reached ({limit} concurrent sessions)")]
    Capacity { limit: usize },

    /// Cooperative cancellation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Timeout during operation
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Retryable backend failure (network error, 5xx)
    #[error("Transient backend failure: {backend} - {message}")]
    TransientBackend { backend: String, message: String },

    /// Non-retryable backend failure (4xx misuse, unknown model)
    #[error("Permanent backend failure: {backend} - {message}")]
    PermanentBackend { backend: String, message: String },

    /// Unreadable router JSON or malformed stream payload
    #[error("Parse failure in {what}: {detail}")]
    Parse { what: String, detail: String },

    /// A stream callback returned an error
    #[error("Stream callback aborted: {0}")]
    CallbackAbort(String),

    /// Post-synthesis grounding could not be satisfied
    #[error("Grounding failure: {0}")]
    Grounding(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid-input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create a session-in-progress error.
    pub fn session_in_progress(session_id: impl Into<String>) -> Self {
        Self::SessionInProgress {
            session_id: session_id.into(),
        }
    }

    /// Create an invalid-transition error.
    pub fn invalid_transition(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a cancellation error.
    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled(context.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a transient backend error.
    pub fn transient(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransientBackend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a permanent backend error.
    pub fn permanent(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PermanentBackend {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// Create a parse error.
    pub fn parse(what: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            detail: detail.into(),
        }
    }

    /// Machine-readable error code, stable across wrapping.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidInput(_) => "invalid_input",
            Self::SessionInProgress { .. } => "session_in_progress",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Capacity { .. } => "capacity",
            Self::Cancelled(_) => "cancelled",
            Self::Timeout { .. } => "timeout",
            Self::TransientBackend { .. } => "transient_backend",
            Self::PermanentBackend { .. } => "permanent_backend",
            Self::Parse { .. } => "parse",
            Self::CallbackAbort(_) => "callback_abort",
            Self::Grounding(_) => "grounding",
            Self::Serialization(_) => "serialization",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the operation may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientBackend { .. } | Self::Timeout { .. })
    }

    /// Whether this error represents cancellation or timeout.
    ///
    /// At the contract level the two are indistinguishable to callers.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_) | Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(Error::invalid_input("x").code(), "invalid_input");
        assert_eq!(
            Error::session_in_progress("s1").code(),
            "session_in_progress"
        );
        assert_eq!(
            Error::invalid_transition("idle", "complete").code(),
            "invalid_transition"
        );
        assert_eq!(Error::cancelled("ctx").code(), "cancelled");
        assert_eq!(Error::timeout(5).code(), "timeout");
    }

    #[test]
    fn test_transience() {
        assert!(Error::transient("ollama", "connection reset").is_transient());
        assert!(Error::timeout(100).is_transient());
        assert!(!Error::permanent("ollama", "unknown model").is_transient());
        assert!(!Error::invalid_input("empty").is_transient());
    }

    #[test]
    fn test_cancellation_and_timeout_share_flavour() {
        assert!(Error::cancelled("parent dropped").is_cancellation());
        assert!(Error::timeout(1).is_cancellation());
        assert!(!Error::transient("x", "y").is_cancellation());
    }
}

//! Error types for the relay.
//!
//! `RelayError` covers the failure classes the relay distinguishes at
//! runtime. Application edges (CLI, startup) use `anyhow` and attach context;
//! provider and engine code returns `RelayError` so callers can branch on the
//! class (retry transport, surface auth, swallow cancellation).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Invalid or missing configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication failure (expired session, bad code, bad password).
    #[error("authentication error: {0}")]
    Auth(String),

    /// Network / backend transport failure. Retried with backoff inside
    /// providers; fatal only after bounded attempts.
    #[error("transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The backend accepted the request but refused the message.
    /// Shaped into a failed `SendResult`, never propagated as a panic.
    #[error("rejected by backend: {0}")]
    RemoteRejected(String),

    /// An entity, mapping, or file could not be resolved. The affected
    /// message is dropped with a log line.
    #[error("not found: {0}")]
    NotFound(String),

    /// Cancellation was observed. Graceful unwind, not a failure.
    #[error("cancelled")]
    Cancelled,

    /// A precondition was violated. Bugs, not environment.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    pub fn transport_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Whether a retry inside the provider is worthwhile.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_is_retryable() {
        assert!(RelayError::transport("connection reset").is_retryable());
        assert!(!RelayError::Auth("code expired".into()).is_retryable());
        assert!(!RelayError::RemoteRejected("blocked".into()).is_retryable());
    }

    #[test]
    fn cancelled_is_not_an_error_class() {
        let err = RelayError::Cancelled;
        assert!(err.is_cancelled());
        assert_eq!(err.to_string(), "cancelled");
    }

    #[test]
    fn transport_with_source_displays_message() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "peer reset");
        let err = RelayError::transport_with("socket closed", io);
        assert_eq!(err.to_string(), "transport error: socket closed");
    }
}

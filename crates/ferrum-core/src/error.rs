//! Unified error types for the Ferrum core.
//!
//! Connection-level and request-level failures live here so that every crate
//! in the workspace reports them the same way. Command pipeline errors are
//! defined in `ferrum-commands`.

use thiserror::Error;

/// Boxed error used for listener and handler faults.
///
/// Identical to `tower::BoxError`, so services and listeners can share it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

// =============================================================================
// Gateway Errors
// =============================================================================

/// Errors raised by the connection manager.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// The transport could not be opened or failed mid-session.
    #[error("connection failed: {reason}")]
    Connection {
        /// Reason for failure.
        reason: String,
    },

    /// The remote rejected the credentials. Never retried.
    #[error("authentication failed: {reason}")]
    Auth {
        /// Reason for failure.
        reason: String,
    },

    /// The remote refused to resume the current session.
    #[error("session invalidated by remote (resumable: {resumable})")]
    InvalidSession {
        /// Whether the remote allowed a resume.
        resumable: bool,
    },

    /// Resume and re-identify both failed. Fatal to the session.
    #[error("session lost after {attempts} recovery attempts: {reason}")]
    SessionLost {
        /// Number of recovery attempts made.
        attempts: u32,
        /// The last failure observed.
        reason: String,
    },

    /// An inbound frame could not be decoded.
    #[error("failed to decode frame: {0}")]
    Decode(String),

    /// The session is closed and no longer accepts outbound frames.
    #[error("gateway session is closed")]
    Closed,
}

impl GatewayError {
    /// Creates a connection error.
    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }

    /// Creates an authentication error.
    pub fn auth(reason: impl Into<String>) -> Self {
        Self::Auth {
            reason: reason.into(),
        }
    }

    /// Returns `true` for failures that must not be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth { .. } | Self::SessionLost { .. })
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

// =============================================================================
// Request Errors
// =============================================================================

/// Error returned by a [`RequestExecutor`](crate::RequestExecutor).
#[derive(Debug, Clone, Error)]
#[error("request failed{}: {message}", .status.map(|s| format!(" ({s})")).unwrap_or_default())]
pub struct RequestError {
    /// HTTP-like status, when the remote answered at all.
    pub status: Option<u16>,
    /// Whether repeating the same operation may succeed.
    pub retryable: bool,
    /// Human readable description.
    pub message: String,
}

impl RequestError {
    /// Creates an error from a remote status code.
    ///
    /// `429` and every `5xx` are considered retryable.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            retryable: status == 429 || status >= 500,
            message: message.into(),
        }
    }

    /// Creates an error for a failure that never reached the remote.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            status: None,
            retryable: true,
            message: message.into(),
        }
    }

    /// Creates an error for a response body that could not be decoded.
    pub fn decode(message: impl Into<String>) -> Self {
        Self {
            status: None,
            retryable: false,
            message: message.into(),
        }
    }

    /// Returns `true` when the remote answered `404`.
    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }

    /// Returns `true` when the remote rejected the credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.status, Some(401) | Some(403))
    }
}

impl From<serde_json::Error> for RequestError {
    fn from(err: serde_json::Error) -> Self {
        Self::decode(err.to_string())
    }
}

// =============================================================================
// Waiter Errors
// =============================================================================

/// Why a one-shot waiter resolved without an event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The deadline elapsed before a matching event arrived.
    #[error("timed out waiting for event")]
    Timeout,

    /// The predicate panicked while inspecting an event.
    #[error("waiter predicate panicked")]
    PredicatePanicked,

    /// The router was dropped.
    #[error("event router closed")]
    Closed,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type for request executor operations.
pub type RequestResult<T> = Result<T, RequestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(RequestError::from_status(429, "slow down").retryable);
        assert!(RequestError::from_status(502, "bad gateway").retryable);
        assert!(!RequestError::from_status(404, "missing").retryable);
        assert!(RequestError::from_status(404, "missing").is_not_found());
        assert!(RequestError::from_status(401, "nope").is_unauthorized());
    }

    #[test]
    fn test_request_error_display() {
        let err = RequestError::from_status(500, "boom");
        assert_eq!(err.to_string(), "request failed (500): boom");
        let err = RequestError::transport("reset");
        assert_eq!(err.to_string(), "request failed: reset");
    }

    #[test]
    fn test_fatal_gateway_errors() {
        assert!(GatewayError::auth("bad token").is_fatal());
        assert!(!GatewayError::connection("reset").is_fatal());
    }
}

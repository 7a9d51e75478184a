//! Error types shared by every component of the client.

use std::time::Duration;

use crate::kernel_connection::ConnectionState;

/// Error type for server and kernel operations.
///
/// `Clone` because a single failure (a dead kernel, a lost socket) is
/// delivered to every caller waiting on that kernel.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The server could not be reached. Retried by callers that own a
    /// backoff policy.
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server rejected credentials (HTTP {status})")]
    Auth { status: u16 },

    /// A malformed or unexpected message or response body.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Kernel {kernel_id} is dead (connection {state})")]
    KernelDead {
        kernel_id: String,
        state: ConnectionState,
    },

    #[error("Lost connection to kernel {kernel_id} (connection {state})")]
    ConnectionLost {
        kernel_id: String,
        state: ConnectionState,
    },

    #[error("Revision conflict on {path}: expected {expected}, server has {actual}")]
    Conflict {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Request {msg_id} to kernel {kernel_id} timed out after {after:?}")]
    Timeout {
        kernel_id: String,
        msg_id: String,
        after: Duration,
    },

    #[error("Server returned HTTP {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The request was withdrawn from the execution queue before dispatch.
    #[error("Request withdrawn before dispatch")]
    Withdrawn,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the same operation may succeed if tried again later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::ConnectionLost { .. } | Error::Timeout { .. }
        )
    }

    /// Errors that must stop reconnect loops and pollers.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Auth { .. } | Error::KernelDead { .. })
    }

    /// The kernel this error is about, when there is one.
    pub fn kernel_id(&self) -> Option<&str> {
        match self {
            Error::KernelDead { kernel_id, .. }
            | Error::ConnectionLost { kernel_id, .. }
            | Error::Timeout { kernel_id, .. } => Some(kernel_id),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            let status = status.as_u16();
            if status == 401 || status == 403 {
                return Error::Auth { status };
            }
            return Error::Server {
                status,
                message: err.to_string(),
            };
        }
        if err.is_decode() {
            return Error::Protocol(err.to_string());
        }
        Error::Network(err.to_string())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::Config(format!("invalid URL: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_errors() {
        assert!(Error::Network("refused".into()).is_retryable());
        assert!(Error::ConnectionLost {
            kernel_id: "k".into(),
            state: ConnectionState::Reconnecting,
        }
        .is_retryable());
        assert!(!Error::Auth { status: 403 }.is_retryable());
        assert!(!Error::Conflict {
            path: "a.ipynb".into(),
            expected: "1".into(),
            actual: "2".into(),
        }
        .is_retryable());
    }

    #[test]
    fn test_kernel_errors_name_kernel_and_state() {
        let err = Error::KernelDead {
            kernel_id: "abc-123".into(),
            state: ConnectionState::Reconnecting,
        };
        assert_eq!(err.kernel_id(), Some("abc-123"));
        let text = err.to_string();
        assert!(text.contains("abc-123"));
        assert!(text.contains("reconnecting"));
    }
}

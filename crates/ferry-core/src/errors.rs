//! Error categorization for backend calls and checkpoint lookups.
//!
//! Backend errors carry a category so the retry helper can decide whether a
//! call is worth repeating:
//! - Retryable: transient failures (throttling, timeouts, 5xx responses)
//! - Fatal: permanent failures (bad request, missing endpoint, auth rejected)

use std::io;

/// Category of backend error for retry decision-making.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Transient error - retry may succeed (throttled, timed out, server busy).
    Retryable,
    /// Permanent error - retry will never succeed.
    Fatal,
}

/// An error returned by a [`TransferBackend`](crate::backend::TransferBackend) call.
#[derive(Debug, Clone)]
pub struct BackendError {
    /// The underlying error message.
    pub message: String,
    /// HTTP-like status code reported by the backend, if any.
    pub status_code: Option<u16>,
    /// The error category for retry decisions.
    pub category: ErrorCategory,
}

impl BackendError {
    /// Create a new retryable backend error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            category: ErrorCategory::Retryable,
        }
    }

    /// Create a new fatal backend error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: None,
            category: ErrorCategory::Fatal,
        }
    }

    /// Build an error from a status code, deriving the category from it.
    pub fn from_status(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: Some(status_code),
            category: classify_status_code(status_code),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category == ErrorCategory::Retryable
    }
}

impl std::fmt::Display for BackendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.status_code {
            Some(code) => write!(f, "backend error {}: {}", code, self.message),
            None => write!(f, "backend error: {}", self.message),
        }
    }
}

impl std::error::Error for BackendError {}

/// Returned (inside an `eyre::Report`) when a checkpoint id is unknown to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointNotFound {
    pub checkpoint_id: String,
}

impl std::fmt::Display for CheckpointNotFound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "checkpoint not found: {}", self.checkpoint_id)
    }
}

impl std::error::Error for CheckpointNotFound {}

/// True when `err` (or anything in its chain) is a [`CheckpointNotFound`].
pub fn is_not_found(err: &eyre::Report) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<CheckpointNotFound>().is_some())
}

/// Categorize a backend status code for retry decisions.
pub fn classify_status_code(code: u16) -> ErrorCategory {
    match code {
        // Throttling and request timeouts
        408 | 409 | 429 => ErrorCategory::Retryable,
        // Server side trouble is usually transient
        500..=599 => ErrorCategory::Retryable,
        _ => ErrorCategory::Fatal,
    }
}

/// Categorize an IO error raised while talking to a backend.
pub fn categorize_io_error(err: &io::Error) -> ErrorCategory {
    match err.kind() {
        io::ErrorKind::TimedOut
        | io::ErrorKind::Interrupted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::WouldBlock => ErrorCategory::Retryable,

        // Unknown errors - default to fatal to avoid retrying forever
        _ => ErrorCategory::Fatal,
    }
}

impl From<io::Error> for BackendError {
    fn from(err: io::Error) -> Self {
        Self {
            category: categorize_io_error(&err),
            message: err.to_string(),
            status_code: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_is_retryable() {
        let err = BackendError::from_status(429, "slow down");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "backend error 429: slow down");
    }

    #[test]
    fn client_errors_are_fatal() {
        assert_eq!(classify_status_code(400), ErrorCategory::Fatal);
        assert_eq!(classify_status_code(404), ErrorCategory::Fatal);
        assert_eq!(classify_status_code(503), ErrorCategory::Retryable);
    }

    #[test]
    fn io_error_categorization() {
        let timeout: BackendError = io::Error::new(io::ErrorKind::TimedOut, "timeout").into();
        assert!(timeout.is_retryable());

        let perm = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        assert_eq!(categorize_io_error(&perm), ErrorCategory::Fatal);
    }

    #[test]
    fn not_found_survives_context() {
        use eyre::WrapErr;

        let res: eyre::Result<()> = Err(CheckpointNotFound {
            checkpoint_id: "abc".into(),
        })
        .wrap_err("resume abc");
        let err = res.unwrap_err();
        assert!(is_not_found(&err));
        assert!(!is_not_found(&eyre::eyre!("other")));
    }
}

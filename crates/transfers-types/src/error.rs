//! Error types and handling for the transfers engine
//!
//! Every failure the engine can observe is funnelled into [`Error`]. The
//! [`ErrorKind`] classification decides how a failure is handled: validation
//! errors are returned to the caller, transient I/O is retried with backoff,
//! unrecoverable errors are terminal for the owning task and cancellation is
//! never retried nor reported as a failure.

use serde::{Deserialize, Serialize};

/// Error severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    /// Low severity - operation can continue
    Low,
    /// Medium severity - operation should be retried
    Medium,
    /// High severity - operation should be aborted
    High,
    /// Critical severity - entire process should be terminated
    Critical,
}

/// Main error type for transfer operations
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Error {
    /// The request is invalid and no task was created
    #[error("Validation error: {message}")]
    Validation {
        /// Every accumulated validation message
        message: String,
    },

    /// The caller may not perform the operation
    #[error("Forbidden: {message}")]
    Forbidden {
        /// Reason the caller was rejected
        message: String,
    },

    /// A path, task or system could not be found
    #[error("Not found: {what}")]
    NotFound {
        /// Description of the missing entity
        what: String,
    },

    /// Transient I/O failure talking to a backend
    #[error("I/O error: {message}")]
    Io {
        /// Error message from the I/O operation
        message: String,
    },

    /// Terminal failure for the task at whichever level it occurred
    #[error("Unrecoverable error: {message}")]
    Unrecoverable {
        /// Error message describing the failure
        message: String,
    },

    /// Operation cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// A storage system referenced by a task is disabled
    #[error("System {system_id} is disabled")]
    SystemDisabled {
        /// Identifier of the disabled system
        system_id: String,
    },

    /// A backend does not implement an operation
    #[error("Operation {operation} is not supported by {backend}")]
    NotSupported {
        /// Name of the requested operation
        operation: String,
        /// Backend that rejected it
        backend: String,
    },

    /// A path tried to escape the backend's root directory
    #[error("Path {path} resolves outside of the system root")]
    PathTraversal {
        /// The offending path as supplied by the caller
        path: String,
    },

    /// Configuration error
    #[error("Configuration error: {message}")]
    Config {
        /// Error message describing the configuration issue
        message: String,
    },

    /// A message or record could not be (de)serialized
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message from the serializer
        message: String,
    },

    /// The work queue or control channel failed
    #[error("Queue error: {message}")]
    Queue {
        /// Error message describing the queue issue
        message: String,
    },

    /// The task store failed
    #[error("Task store error: {message}")]
    Store {
        /// Error message describing the store issue
        message: String,
    },

    /// Operation timed out
    #[error("Operation timed out after {seconds} seconds")]
    Timeout {
        /// Number of seconds after which the operation timed out
        seconds: u64,
    },

    /// Generic error with custom message
    #[error("{message}")]
    Other {
        /// Custom error message
        message: String,
    },
}

/// Error kind for categorizing errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request, surfaced to the caller before any task exists
    Validation,
    /// Missing path or task
    NotFound,
    /// Network or backend hiccup worth retrying
    TransientIo,
    /// Terminal for the owning task
    Unrecoverable,
    /// Cancellation, terminal as CANCELLED
    Cancellation,
}

impl Error {
    /// Get the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } | Self::Forbidden { .. } | Self::Config { .. } => {
                ErrorKind::Validation
            }
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Io { .. }
            | Self::Queue { .. }
            | Self::Store { .. }
            | Self::Timeout { .. } => ErrorKind::TransientIo,
            Self::Cancelled => ErrorKind::Cancellation,
            Self::Unrecoverable { .. }
            | Self::SystemDisabled { .. }
            | Self::NotSupported { .. }
            | Self::PathTraversal { .. }
            | Self::Serialization { .. }
            | Self::Other { .. } => ErrorKind::Unrecoverable,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self.kind() {
            ErrorKind::Cancellation => ErrorSeverity::Low,
            ErrorKind::TransientIo => ErrorSeverity::Medium,
            ErrorKind::Validation | ErrorKind::NotFound | ErrorKind::Unrecoverable => {
                ErrorSeverity::High
            }
        }
    }

    /// Check if this error should trigger a retry
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }

    /// Check if this error is a cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Check if this error reports a missing entity
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a new forbidden error
    pub fn forbidden<S: Into<String>>(message: S) -> Self {
        Self::Forbidden {
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a new transient I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new unrecoverable error
    pub fn unrecoverable<S: Into<String>>(message: S) -> Self {
        Self::Unrecoverable {
            message: message.into(),
        }
    }

    /// Create a new not-supported error
    pub fn not_supported<S: Into<String>, B: Into<String>>(operation: S, backend: B) -> Self {
        Self::NotSupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Create a new configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a new queue error
    pub fn queue<S: Into<String>>(message: S) -> Self {
        Self::Queue {
            message: message.into(),
        }
    }

    /// Create a new task store error
    pub fn store<S: Into<String>>(message: S) -> Self {
        Self::Store {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other<S: Into<String>>(message: S) -> Self {
        Self::Other {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound {
                what: error.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => Self::Forbidden {
                message: error.to_string(),
            },
            _ => Self::Io {
                message: error.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    proptest! {
        #[test]
        fn test_retryable_implies_medium_severity(message in ".*") {
            let errors = vec![
                Error::io(message.clone()),
                Error::unrecoverable(message.clone()),
                Error::validation(message.clone()),
                Error::queue(message.clone()),
                Error::store(message.clone()),
                Error::other(message.clone()),
                Error::not_found(message),
            ];

            for error in errors {
                if error.is_retryable() {
                    prop_assert_eq!(error.severity(), ErrorSeverity::Medium);
                }
            }
        }
    }

    #[rstest]
    #[case(Error::io("reset by peer"), ErrorKind::TransientIo, true)]
    #[case(Error::Timeout { seconds: 15 }, ErrorKind::TransientIo, true)]
    #[case(Error::not_found("/data/in"), ErrorKind::NotFound, false)]
    #[case(Error::validation("no elements"), ErrorKind::Validation, false)]
    #[case(Error::forbidden("shared ctx"), ErrorKind::Validation, false)]
    #[case(Error::SystemDisabled { system_id: "sysB".into() }, ErrorKind::Unrecoverable, false)]
    #[case(Error::Cancelled, ErrorKind::Cancellation, false)]
    fn test_error_classification(
        #[case] error: Error,
        #[case] kind: ErrorKind,
        #[case] retryable: bool,
    ) {
        assert_eq!(error.kind(), kind);
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn test_io_error_conversion() {
        let missing = Error::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(missing.is_not_found());

        let denied =
            Error::from(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope"));
        assert_eq!(denied.kind(), ErrorKind::Validation);

        let reset =
            Error::from(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(reset.is_retryable());
        assert!(reset.to_string().contains("reset"));
    }

    #[test]
    fn test_cancelled_error() {
        let error = Error::Cancelled;
        assert!(error.is_cancelled());
        assert_eq!(error.severity(), ErrorSeverity::Low);
        assert!(!error.is_retryable());
    }
}

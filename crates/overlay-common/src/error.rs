//! Error types for overlay data-plane operations.
//!
//! All errors implement `std::error::Error` via `thiserror`. Lease store
//! failures keep their own type so cancellation can be told apart from a
//! real failure after it has travelled through the backend layers.

use std::io;
use thiserror::Error;

use crate::lease::LeaseError;

/// Result type alias for overlay operations.
pub type OverlayResult<T> = Result<T, OverlayError>;

/// Errors that can occur while building or reconciling the overlay.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// Failed to execute a shell command (spawn error).
    #[error("Failed to execute shell command '{command}': {source}")]
    ShellExec {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Shell command returned non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    ShellCommandFailed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Backend-specific JSON configuration could not be decoded.
    #[error("Error decoding {backend} backend config: {source}")]
    ConfigDecode {
        /// Backend type name (e.g. "vxlan").
        backend: String,
        /// The underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// Lease store returned cancellation or deadline; carried unchanged.
    #[error(transparent)]
    Lease(LeaseError),

    /// Lease acquisition failed for a reason other than shutdown.
    #[error("Failed to acquire lease: {source}")]
    LeaseAcquisition {
        /// The store error.
        #[source]
        source: LeaseError,
    },

    /// A route, neighbor, FDB or address mutation failed.
    #[error("Kernel operation failed: {operation}: {message}")]
    KernelMutation {
        /// The operation that failed (e.g. "neigh add").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Requested backend type has no registered constructor.
    #[error("unknown backend type: {name}")]
    UnknownBackendType {
        /// Normalized (lowercase) backend name.
        name: String,
    },

    /// Querying the firewall for a rule failed.
    #[error("Failed to check rule existence: {message}")]
    RuleExistenceCheck {
        /// Error message.
        message: String,
    },

    /// Network link not found.
    #[error("Link '{name}' not found")]
    LinkNotFound {
        /// Link name or index.
        name: String,
    },

    /// Configuration validation error.
    #[error("Invalid configuration for {field}: {message}")]
    InvalidConfig {
        /// The field that failed validation.
        field: String,
        /// Error message.
        message: String,
    },

    /// Output of a host tool could not be parsed.
    #[error("Failed to parse {what}: {message}")]
    Parse {
        /// What was being parsed.
        what: String,
        /// Error message.
        message: String,
    },

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl OverlayError {
    /// Creates a config decode error for the named backend.
    pub fn config_decode(backend: impl Into<String>, source: serde_json::Error) -> Self {
        Self::ConfigDecode {
            backend: backend.into(),
            source,
        }
    }

    /// Creates a kernel mutation error.
    pub fn kernel(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::KernelMutation {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an unknown backend type error.
    pub fn unknown_backend(name: impl Into<String>) -> Self {
        Self::UnknownBackendType { name: name.into() }
    }

    /// Creates a link not found error.
    pub fn link_not_found(name: impl Into<String>) -> Self {
        Self::LinkNotFound { name: name.into() }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates a parse error.
    pub fn parse(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            what: what.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Maps a lease acquisition failure: cancellation and deadline pass
    /// through unchanged, anything else is wrapped.
    pub fn from_acquire(err: LeaseError) -> Self {
        if err.is_shutdown() {
            Self::Lease(err)
        } else {
            Self::LeaseAcquisition { source: err }
        }
    }

    /// Returns true if this error means shutdown is in progress rather
    /// than a failure.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, OverlayError::Lease(e) if e.is_shutdown())
    }

    /// Returns true if this error indicates a transient condition
    /// that may succeed on retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OverlayError::ShellCommandFailed { .. }
                | OverlayError::KernelMutation { .. }
                | OverlayError::RuleExistenceCheck { .. }
                | OverlayError::LeaseAcquisition { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OverlayError::unknown_backend("bogus");
        assert_eq!(err.to_string(), "unknown backend type: bogus");
    }

    #[test]
    fn test_kernel_error() {
        let err = OverlayError::kernel("fdb add", "RTNETLINK answers: File exists");
        assert_eq!(
            err.to_string(),
            "Kernel operation failed: fdb add: RTNETLINK answers: File exists"
        );
    }

    #[test]
    fn test_shell_command_failed() {
        let err = OverlayError::ShellCommandFailed {
            command: "/sbin/ip route replace 10.1.15.0/24".to_string(),
            exit_code: 2,
            output: "Nexthop has invalid gateway".to_string(),
        };
        assert!(err.to_string().contains("ip route replace"));
        assert!(err.to_string().contains("exit code 2"));
    }

    #[test]
    fn test_lease_errors_keep_shutdown_identity() {
        let canceled = OverlayError::from_acquire(LeaseError::Canceled);
        assert!(canceled.is_shutdown());
        assert!(matches!(canceled, OverlayError::Lease(LeaseError::Canceled)));

        let deadline = OverlayError::from_acquire(LeaseError::DeadlineExceeded);
        assert!(deadline.is_shutdown());

        let other = OverlayError::from_acquire(LeaseError::other("etcd unavailable"));
        assert!(!other.is_shutdown());
        assert!(other.to_string().starts_with("Failed to acquire lease"));
    }

    #[test]
    fn test_config_decode_error() {
        let source = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let err = OverlayError::config_decode("vxlan", source);
        assert!(err
            .to_string()
            .starts_with("Error decoding vxlan backend config"));
    }

    #[test]
    fn test_is_retryable() {
        assert!(OverlayError::kernel("route add", "busy").is_retryable());
        assert!(!OverlayError::unknown_backend("x").is_retryable());
        assert!(!OverlayError::internal("bug").is_retryable());
    }
}

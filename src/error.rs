//! Error types for the sandbox manager.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The pool already holds the configured maximum of live sandboxes.
    #[error("Maximum number of sandboxes ({max}) reached")]
    CapacityExceeded { max: usize },

    /// No live sandbox is tracked under this identifier.
    #[error("Sandbox {0} not found")]
    NotFound(String),

    /// The backend failed to provision a sandbox.
    #[error("failed to provision sandbox: {0}")]
    Provisioning(String),

    /// The backend failed to tear down a sandbox.
    #[error("failed to destroy sandbox {id}: {reason}")]
    Destroy { id: String, reason: String },

    /// A command could not be run inside a sandbox.
    #[error("command execution failed: {0}")]
    Execution(String),

    /// A command ran longer than the sandbox allows.
    #[error("command timed out after {0:?}")]
    Timeout(Duration),

    /// The manager has been cleaned up.
    #[error("sandbox manager is closed")]
    Closed,

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true for [`Error::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_message_names_the_limit() {
        let err = Error::CapacityExceeded { max: 2 };
        assert_eq!(err.to_string(), "Maximum number of sandboxes (2) reached");
    }

    #[test]
    fn not_found_message_names_the_id() {
        let err = Error::NotFound("nonexistent-id".to_string());
        assert_eq!(err.to_string(), "Sandbox nonexistent-id not found");
        assert!(err.is_not_found());
        assert!(!Error::Closed.is_not_found());
    }
}

// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

//! Error type shared between the host and its nodes.
//!
//! Nodes report failures as [`NodeError`]; the host presents the `Display`
//! form to the end user. Conversions from `String`/`&str` exist so node code
//! can bubble up plain messages with `?`.

use thiserror::Error;

/// Main error type for node registration and invocation.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Node instance parameters are invalid.
    ///
    /// Examples:
    /// - Unknown device name
    /// - Missing required configuration fields
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// An invocation input failed host-side schema validation.
    ///
    /// Examples:
    /// - Required input missing
    /// - Float outside its declared bounds
    /// - Enum value not among the declared options
    #[error("Invalid input '{name}': {reason}")]
    InvalidInput { name: String, reason: String },

    /// The node kind is not registered.
    #[error("Unknown node kind: {0}")]
    UnknownNode(String),

    /// Runtime failure while the node was running.
    ///
    /// Examples:
    /// - Model loading failed after every fallback
    /// - Inference error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// I/O error (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Shorthand for an [`NodeError::InvalidInput`].
    pub fn invalid_input(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput { name: name.into(), reason: reason.into() }
    }
}

/// Convenience type alias for Results using `NodeError`.
pub type Result<T> = std::result::Result<T, NodeError>;

impl From<NodeError> for String {
    fn from(err: NodeError) -> Self {
        err.to_string()
    }
}

// Plain string errors are runtime failures.
impl From<String> for NodeError {
    fn from(s: String) -> Self {
        Self::Runtime(s)
    }
}

impl From<&str> for NodeError {
    fn from(s: &str) -> Self {
        Self::Runtime(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = NodeError::Configuration("Invalid device".to_string());
        assert_eq!(err.to_string(), "Configuration error: Invalid device");

        let err = NodeError::invalid_input("cfg_scale", "12 is above the maximum 10");
        assert_eq!(err.to_string(), "Invalid input 'cfg_scale': 12 is above the maximum 10");
    }

    #[test]
    fn test_string_conversions() {
        let err: NodeError = "Something went wrong".into();
        assert_eq!(err.to_string(), "Runtime error: Something went wrong");

        let s: String = NodeError::UnknownNode("Nope".to_string()).into();
        assert_eq!(s, "Unknown node kind: Nope");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "File not found");
        let err: NodeError = io_err.into();
        assert!(err.to_string().contains("I/O error"));
        assert!(err.to_string().contains("File not found"));
    }
}

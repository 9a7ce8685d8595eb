//! Error types and result aliases for codegate.
//!
//! Shared error definitions used across all codegate components. Errors are
//! structured for programmatic handling and include context for debugging.

/// The result type used throughout codegate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in codegate core operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {message}")]
    InvalidId {
        /// Description of what made the ID invalid.
        message: String,
    },

    /// A key-value store operation failed.
    #[error("key-value store error: {message}")]
    KeyValue {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A configuration value was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An internal error occurred that should not happen in normal operation.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl Error {
    /// Creates a new key-value store error with the given message.
    #[must_use]
    pub fn key_value(message: impl Into<String>) -> Self {
        Self::KeyValue {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new key-value store error with a source.
    #[must_use]
    pub fn key_value_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::KeyValue {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as StdError;

    #[test]
    fn key_value_error_display() {
        let err = Error::key_value("connection refused");
        assert!(err.to_string().contains("key-value store error"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn key_value_error_with_source() {
        let source = std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out");
        let err = Error::key_value_with_source("GET failed", source);
        assert!(StdError::source(&err).is_some());
    }

    #[test]
    fn configuration_error_display() {
        let err = Error::configuration("missing CODEGATE_KV_URL");
        assert!(err.to_string().contains("configuration error"));
    }
}

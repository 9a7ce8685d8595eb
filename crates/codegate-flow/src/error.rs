//! Error types for the reconciliation engine.

use codegate_core::id::{EventId, TaskId};

/// The result type used throughout codegate-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in reconciliation operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An aggregate event record was missing when it was required.
    ///
    /// This is a data inconsistency, not a transient failure: the event is
    /// skipped this cycle and the anomaly is logged.
    #[error("aggregate event not found: {event_id}")]
    AggregateNotFound {
        /// The event whose aggregate was missing.
        event_id: EventId,
    },

    /// A check task was not found.
    #[error("check task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// The event mutex could not be acquired within the wait budget.
    #[error("lock busy for key {key} after {waited_ms}ms")]
    LockBusy {
        /// The contended lock key.
        key: String,
        /// How long acquisition waited before giving up.
        waited_ms: u64,
    },

    /// A fetch from the upstream check backend failed.
    ///
    /// Transient by taxonomy: the task is retried on the next poll cycle.
    #[error("upstream fetch failed: {message}")]
    Fetch {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A configuration value was missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from codegate-core.
    #[error("core error: {0}")]
    Core(#[from] codegate_core::error::Error),
}

impl Error {
    /// Creates a new fetch error.
    #[must_use]
    pub fn fetch(message: impl Into<String>) -> Self {
        Self::Fetch {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new fetch error with a source.
    #[must_use]
    pub fn fetch_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Fetch {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true when retrying on the next poll cycle is the right
    /// response to this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Fetch { .. } | Self::LockBusy { .. })
    }
}

//! Strongly-typed identifiers for codegate entities.
//!
//! Merge events and check tasks are both identified by strings minted
//! upstream (the portal assigns event UUIDs, the check backend assigns task
//! IDs). Wrapping them in newtypes prevents mixing the two up at compile
//! time while staying transparent on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a merge event.
///
/// One merge event groups one or more pull requests that are gated together.
/// The ID is minted by the upstream portal when the event is first observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Creates an event ID from its upstream string form.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A unique identifier for a check task on the upstream backend.
///
/// One task corresponds to one PR's incremental check run. The backend mints
/// the ID when the check is requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Creates a task ID from its upstream string form.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_roundtrips_through_display() {
        let id = EventId::new("e4f1c6a2");
        assert_eq!(id.to_string(), "e4f1c6a2");
        assert_eq!(id.as_str(), "e4f1c6a2");
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = TaskId::new("task-1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"task-1\"");
    }

    #[test]
    fn ids_are_ordered_by_string_value() {
        let a = EventId::new("a");
        let b = EventId::new("b");
        assert!(a < b);
    }
}

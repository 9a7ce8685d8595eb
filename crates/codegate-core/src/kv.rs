//! Key-value store abstraction for locks and small shared state.
//!
//! The reconciliation engine serializes access to aggregate event records by
//! way of a keyed mutex built on three primitives:
//!
//! - `set_if_absent(key, value, ttl)` — atomic, the acquisition primitive
//! - `remove_if_value(key, expected)` — atomic compare-and-delete, the
//!   release primitive
//! - `get_and_set(key, value)` — atomic read-and-replace
//!
//! Atomicity of the first two is required for mutex correctness. Anything
//! else about the backing store (replication, persistence, eviction of
//! unrelated cache entries) is out of scope here.
//!
//! ## Implementations
//!
//! - [`memory::InMemoryKv`] for unit tests and development
//! - A Redis-shaped backend in production deployments (wired outside this
//!   crate; the trait is the boundary)

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// Outcome of a conditional set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetOutcome {
    /// The key was absent and the value was written.
    Written,
    /// The key already held a live value; nothing was written.
    AlreadyPresent,
}

impl SetOutcome {
    /// Returns true if the value was written.
    #[must_use]
    pub const fn is_written(&self) -> bool {
        matches!(self, Self::Written)
    }
}

/// Key-value store abstraction used for distributed coordination.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from async
/// tasks.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Atomically writes `value` under `key` only if the key is absent
    /// (or its previous value has expired).
    ///
    /// The entry expires after `ttl`; expiry is how a crashed holder's lock
    /// eventually frees itself.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<SetOutcome>;

    /// Atomically replaces the value under `key` and returns the previous
    /// value, or `None` if the key was absent or expired.
    async fn get_and_set(&self, key: &str, value: &str) -> Result<Option<String>>;

    /// Unconditionally writes `value` under `key` with no expiry.
    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Returns the live value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Removes the key. Returns true when a live value was removed.
    async fn remove(&self, key: &str) -> Result<bool>;

    /// Atomically removes the key only while it still holds `expected` as a
    /// live value. Returns true when the entry was removed.
    ///
    /// An expired entry, an absent key, or a different stored value all
    /// leave the store untouched and return false.
    async fn remove_if_value(&self, key: &str, expected: &str) -> Result<bool>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_outcome_is_written() {
        assert!(SetOutcome::Written.is_written());
        assert!(!SetOutcome::AlreadyPresent.is_written());
    }
}

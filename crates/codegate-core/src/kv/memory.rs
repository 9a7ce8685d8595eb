//! In-memory key-value store implementation for testing.
//!
//! ## Limitations
//!
//! - **NOT suitable for production**: no cross-process coordination
//! - **No persistence**: all state is lost when the process exits
//!
//! Expiry is honored on read: an entry past its deadline behaves exactly as
//! an absent key, which is what the mutex acquisition path relies on.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{KeyValueStore, SetOutcome};
use crate::error::{Error, Result};

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|deadline| deadline > now)
    }
}

/// Converts a lock poison error to a key-value error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::key_value("lock poisoned")
}

fn deadline(ttl: Duration) -> Option<DateTime<Utc>> {
    Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(10)))
}

/// In-memory [`KeyValueStore`] for tests.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    entries: RwLock<HashMap<String, Entry>>,
}

impl InMemoryKv {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKv {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<SetOutcome> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let now = Utc::now();

        if entries.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(SetOutcome::AlreadyPresent);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: deadline(ttl),
            },
        );
        Ok(SetOutcome::Written)
    }

    async fn get_and_set(&self, key: &str, value: &str) -> Result<Option<String>> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let now = Utc::now();

        let previous = entries
            .insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: None,
                },
            )
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value);
        Ok(previous)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.read().map_err(poison_err)?;
        let now = Utc::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.write().map_err(poison_err)?;
        let now = Utc::now();
        Ok(entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn remove_if_value(&self, key: &str, expected: &str) -> Result<bool> {
        // Check and remove under one write lock; a successor's entry written
        // after an expiry is never deleted by the previous holder.
        let mut entries = self.entries.write().map_err(poison_err)?;
        let now = Utc::now();
        let matches = entries
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_writes_once() -> Result<()> {
        let kv = InMemoryKv::new();

        let first = kv
            .set_if_absent("lock:a", "t1", Duration::from_secs(10))
            .await?;
        assert!(first.is_written());

        let second = kv
            .set_if_absent("lock:a", "t2", Duration::from_secs(10))
            .await?;
        assert_eq!(second, SetOutcome::AlreadyPresent);

        assert_eq!(kv.get("lock:a").await?, Some("t1".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn expired_entry_behaves_as_absent() -> Result<()> {
        let kv = InMemoryKv::new();

        kv.set_if_absent("lock:a", "t1", Duration::from_millis(1))
            .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(kv.get("lock:a").await?, None);
        let retry = kv
            .set_if_absent("lock:a", "t2", Duration::from_secs(10))
            .await?;
        assert!(retry.is_written());
        Ok(())
    }

    #[tokio::test]
    async fn get_and_set_returns_previous_value() -> Result<()> {
        let kv = InMemoryKv::new();

        kv.set("k", "old").await?;
        let previous = kv.get_and_set("k", "new").await?;
        assert_eq!(previous, Some("old".to_string()));
        assert_eq!(kv.get("k").await?, Some("new".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn get_and_set_on_absent_key_returns_none() -> Result<()> {
        let kv = InMemoryKv::new();

        let previous = kv.get_and_set("k", "new").await?;
        assert_eq!(previous, None);
        assert_eq!(kv.get("k").await?, Some("new".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn remove_if_value_requires_a_live_match() -> Result<()> {
        let kv = InMemoryKv::new();

        kv.set_if_absent("lock:a", "t1", Duration::from_secs(10))
            .await?;
        assert!(!kv.remove_if_value("lock:a", "t2").await?);
        assert_eq!(kv.get("lock:a").await?, Some("t1".to_string()));

        assert!(kv.remove_if_value("lock:a", "t1").await?);
        assert_eq!(kv.get("lock:a").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn remove_if_value_ignores_expired_entries() -> Result<()> {
        let kv = InMemoryKv::new();

        kv.set_if_absent("lock:a", "t1", Duration::from_millis(1))
            .await?;
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!kv.remove_if_value("lock:a", "t1").await?);
        Ok(())
    }

    #[tokio::test]
    async fn remove_reports_liveness() -> Result<()> {
        let kv = InMemoryKv::new();

        kv.set("k", "v").await?;
        assert!(kv.remove("k").await?);
        assert!(!kv.remove("k").await?);
        Ok(())
    }
}

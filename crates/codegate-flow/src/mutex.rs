//! Keyed mutual exclusion for per-event reconciliation.
//!
//! Every read-modify-write of an aggregate event runs under a lease held in
//! the shared key-value store. Leases are fenced and time-bounded:
//!
//! - **Fencing tokens**: each acquisition writes a fresh ulid; release only
//!   deletes the entry when the stored token still matches, so a holder that
//!   lost its lease to TTL expiry cannot delete a successor's lease.
//! - **TTL, not indefinite locks**: a crashed holder's lease expires on its
//!   own; no operator intervention is needed to unwedge an event.
//! - **Bounded waiting**: contenders back off exponentially and give up
//!   after a wait budget, surfacing [`Error::LockBusy`] so the poll cycle
//!   simply retries the event next round.

use std::sync::Arc;
use std::time::Duration;

use ulid::Ulid;

use codegate_core::id::EventId;
use codegate_core::kv::KeyValueStore;

use crate::error::{Error, Result};

/// Namespace prefix for lease keys in the shared store.
const LOCK_KEY_PREFIX: &str = "codegate:event-lock:";

/// Initial retry delay when the lease is held by someone else.
const BACKOFF_BASE: Duration = Duration::from_millis(50);

/// Upper bound on a single retry delay.
const BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Lease-based mutual exclusion keyed by event ID.
///
/// Cloning is cheap; all clones share the same backing store.
#[derive(Clone)]
pub struct EventMutex {
    kv: Arc<dyn KeyValueStore>,
    ttl: Duration,
    wait_budget: Duration,
}

impl EventMutex {
    /// Creates a mutex over the given store.
    ///
    /// `ttl` bounds how long a crashed holder can block an event;
    /// `wait_budget` bounds how long an acquisition attempt blocks its
    /// caller.
    #[must_use]
    pub fn new(kv: Arc<dyn KeyValueStore>, ttl: Duration, wait_budget: Duration) -> Self {
        Self {
            kv,
            ttl,
            wait_budget,
        }
    }

    /// Acquires the lease for an event, waiting with exponential backoff.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LockBusy`] when the wait budget elapses without the
    /// lease becoming free, or a storage error from the backing store.
    pub async fn acquire(&self, event_id: &EventId) -> Result<MutexGuard> {
        let key = lock_key(event_id);
        let token = Ulid::new().to_string();
        let started = tokio::time::Instant::now();
        let mut delay = BACKOFF_BASE;

        loop {
            let outcome = self.kv.set_if_absent(&key, &token, self.ttl).await?;
            if outcome.is_written() {
                tracing::debug!(event_id = event_id.as_str(), token, "event lease acquired");
                return Ok(MutexGuard {
                    kv: Arc::clone(&self.kv),
                    key,
                    token,
                    released: false,
                });
            }

            let waited = started.elapsed();
            if waited >= self.wait_budget {
                return Err(Error::LockBusy {
                    key,
                    waited_ms: u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                });
            }

            let remaining = self.wait_budget.saturating_sub(waited);
            tokio::time::sleep(delay.min(remaining)).await;
            delay = (delay * 2).min(BACKOFF_CAP);
        }
    }

    /// Attempts a single acquisition without waiting.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the backing store.
    pub async fn try_acquire(&self, event_id: &EventId) -> Result<Option<MutexGuard>> {
        let key = lock_key(event_id);
        let token = Ulid::new().to_string();
        let outcome = self.kv.set_if_absent(&key, &token, self.ttl).await?;
        if outcome.is_written() {
            Ok(Some(MutexGuard {
                kv: Arc::clone(&self.kv),
                key,
                token,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }
}

impl std::fmt::Debug for EventMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventMutex")
            .field("ttl", &self.ttl)
            .field("wait_budget", &self.wait_budget)
            .finish_non_exhaustive()
    }
}

/// A held event lease.
///
/// Must be released with [`MutexGuard::release`] on every exit path. A
/// guard dropped without release relies on TTL expiry and logs a warning.
pub struct MutexGuard {
    kv: Arc<dyn KeyValueStore>,
    key: String,
    token: String,
    released: bool,
}

impl MutexGuard {
    /// Releases the lease if this guard still holds it.
    ///
    /// The delete is a single atomic compare-and-delete on the fencing
    /// token: when the stored token no longer matches (the lease expired
    /// and another holder took over), the store is left untouched and a
    /// warning is logged. A separate get-then-remove would leave a window
    /// in which a successor's fresh lease could be deleted.
    ///
    /// # Errors
    ///
    /// Returns a storage error from the backing store.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if self.kv.remove_if_value(&self.key, &self.token).await? {
            tracing::debug!(key = self.key, "event lease released");
        } else {
            tracing::warn!(
                key = self.key,
                "event lease expired or was taken over before release; leaving it in place"
            );
        }
        Ok(())
    }
}

impl Drop for MutexGuard {
    fn drop(&mut self) {
        if !self.released {
            // TTL expiry will clear the entry; the event stays blocked until
            // then.
            tracing::warn!(key = self.key, "event lease guard dropped without release");
        }
    }
}

impl std::fmt::Debug for MutexGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutexGuard")
            .field("key", &self.key)
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

fn lock_key(event_id: &EventId) -> String {
    format!("{LOCK_KEY_PREFIX}{event_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    use codegate_core::kv::memory::InMemoryKv;

    fn mutex(wait_budget: Duration) -> EventMutex {
        EventMutex::new(
            Arc::new(InMemoryKv::new()),
            Duration::from_secs(60),
            wait_budget,
        )
    }

    #[tokio::test]
    async fn acquire_and_release() {
        let mutex = mutex(Duration::from_millis(100));
        let event = EventId::new("evt-1");

        let guard = mutex.acquire(&event).await.unwrap();
        assert!(mutex.try_acquire(&event).await.unwrap().is_none());

        guard.release().await.unwrap();
        assert!(mutex.try_acquire(&event).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn distinct_events_do_not_contend() {
        let mutex = mutex(Duration::from_millis(100));
        let _a = mutex.acquire(&EventId::new("evt-a")).await.unwrap();
        let b = mutex.try_acquire(&EventId::new("evt-b")).await.unwrap();
        assert!(b.is_some());
    }

    #[tokio::test]
    async fn contended_acquire_times_out() {
        let mutex = mutex(Duration::from_millis(120));
        let event = EventId::new("evt-1");
        let _held = mutex.acquire(&event).await.unwrap();

        let error = mutex.acquire(&event).await.unwrap_err();
        match error {
            Error::LockBusy { waited_ms, .. } => assert!(waited_ms >= 120),
            other => panic!("expected LockBusy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn contender_acquires_after_release() {
        let mutex = mutex(Duration::from_secs(5));
        let event = EventId::new("evt-1");
        let guard = mutex.acquire(&event).await.unwrap();

        let contender = {
            let mutex = mutex.clone();
            let event = event.clone();
            tokio::spawn(async move { mutex.acquire(&event).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        guard.release().await.unwrap();

        let guard = contender.await.unwrap().unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn expired_lease_is_not_deleted_by_stale_holder() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let short_ttl = EventMutex::new(
            Arc::clone(&kv),
            Duration::from_millis(1),
            Duration::from_secs(1),
        );
        let long_ttl = EventMutex::new(
            Arc::clone(&kv),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let event = EventId::new("evt-1");

        let stale = short_ttl.acquire(&event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Lease expired; a successor takes over with a new token.
        let successor = long_ttl.acquire(&event).await.unwrap();

        // The stale holder's release must not remove the successor's lease.
        stale.release().await.unwrap();
        assert!(long_ttl.try_acquire(&event).await.unwrap().is_none());

        successor.release().await.unwrap();
        assert!(long_ttl.try_acquire(&event).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn release_after_expiry_without_successor_is_a_no_op() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKv::new());
        let short_ttl = EventMutex::new(
            Arc::clone(&kv),
            Duration::from_millis(1),
            Duration::from_secs(1),
        );
        let event = EventId::new("evt-1");

        let guard = short_ttl.acquire(&event).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        guard.release().await.unwrap();
        assert!(short_ttl.try_acquire(&event).await.unwrap().is_some());
    }
}

//! # codegate-flow
//!
//! Reconciliation engine for dual-track code-review verdicts.
//!
//! Two independently operated check pipelines — the *inner* track and the
//! *outside* track — report partial, out-of-order results for the pull
//! requests of a merge event. This crate merges them into one authoritative
//! verdict per event and persists the underlying per-issue defect records:
//!
//! - **Event Mutex**: keyed, fenced mutual exclusion over the aggregate record
//! - **Merge Engine**: recombines both tracks' per-PR verdicts each poll
//! - **Completion Detector**: finalizes the aggregate exactly once
//! - **Detail Sync Pipeline**: paginated, idempotent defect ingestion
//! - **Poll Dispatcher**: periodic fan-out over bounded worker pools
//!
//! ## Guarantees
//!
//! - **Idempotent**: re-running a merge on unchanged inputs produces an
//!   identical aggregate and no additional side effects
//! - **Finalize-once**: `Running -> Done` happens exactly once per event
//! - **No duplication**: defect writes are keyed upserts; repeated page
//!   delivery never duplicates rows
//! - **Isolated failure**: an error in one event never aborts the batch
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use codegate_core::kv::memory::InMemoryKv;
//! use codegate_flow::client::memory::MockCheckBackend;
//! use codegate_flow::config::ReconcilerConfig;
//! use codegate_flow::dispatch::PollDispatcher;
//! use codegate_flow::error::Result;
//! use codegate_flow::store::memory::InMemoryStores;
//!
//! # async fn run() -> Result<()> {
//! let stores = Arc::new(InMemoryStores::new());
//! let dispatcher = PollDispatcher::new(
//!     ReconcilerConfig::default(),
//!     Arc::new(InMemoryKv::new()),
//!     Arc::new(MockCheckBackend::new()),
//!     stores.clone(),
//!     stores.clone(),
//!     stores.clone(),
//!     stores.clone(),
//!     stores,
//! );
//! let summary = dispatcher.reconcile_recent_events().await?;
//! println!("merged {} events", summary.merged);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod merge;
pub mod metrics;
pub mod model;
pub mod mutex;
pub mod store;
pub mod sync;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::{CheckBackend, DetailPage, SeverityFilter, SummaryPayload, TaskProgress};
    pub use crate::config::ReconcilerConfig;
    pub use crate::dispatch::{DrainSummary, PollDispatcher, ReconcileSummary};
    pub use crate::error::{Error, Result};
    pub use crate::merge::completion::{CompletionDetector, FinalizeOutcome, FinalizeStatus};
    pub use crate::merge::{MergeEngine, MergeOutcome};
    pub use crate::metrics::FlowMetrics;
    pub use crate::model::{
        AggregateEvent, AggregateStatus, CheckResult, CheckStatus, CheckSummary, CheckTask,
        DefectRecord, FossFragment, InnerSnapshot, ProcessingState,
    };
    pub use crate::mutex::{EventMutex, MutexGuard};
    pub use crate::sync::{DetailSyncPipeline, SyncOutcome};
}

//! # codegate-core
//!
//! Core abstractions for the codegate verdict reconciliation service.
//!
//! This crate provides the foundational types and traits used across all
//! codegate components:
//!
//! - **Identifiers**: Strongly-typed IDs for merge events and check tasks
//! - **Key-Value Store**: The atomic primitives the event mutex is built on
//! - **Error Types**: Shared error definitions and result types
//! - **Observability**: Structured logging initialization
//!
//! ## Crate Boundary
//!
//! `codegate-core` is the only crate allowed to define shared primitives.
//! The reconciliation engine (`codegate-flow`) builds on these contracts and
//! never reaches around them.
//!
//! ## Example
//!
//! ```rust
//! use codegate_core::prelude::*;
//!
//! let event = EventId::new("e4f1c6a2");
//! let task = TaskId::new("task-20117");
//! assert_ne!(event.as_str(), task.as_str());
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod id;
pub mod kv;
pub mod observability;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::error::{Error, Result};
    pub use crate::id::{EventId, TaskId};
    pub use crate::kv::{KeyValueStore, SetOutcome};
    pub use crate::observability::{init_logging, LogFormat};
}

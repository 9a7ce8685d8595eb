//! Observability infrastructure for codegate.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every component logs the
//! same fields for the same operations.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `codegate_flow=debug`)
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for per-event reconciliation work.
#[must_use]
pub fn reconcile_span(operation: &str, event_id: &str) -> Span {
    tracing::info_span!("reconcile", op = operation, event = event_id)
}

/// Creates a span for per-task sync work.
#[must_use]
pub fn sync_span(operation: &str, task_id: &str) -> Span {
    tracing::info_span!("sync", op = operation, task = task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        init_logging(LogFormat::Pretty);
        init_logging(LogFormat::Json);
    }

    #[test]
    fn span_constructors_do_not_panic() {
        let _ = reconcile_span("merge", "e1");
        let _ = sync_span("details", "task-1");
    }
}

//! Codegate reconciliation service.
//!
//! Exposes the two poll triggers over HTTP so an external scheduler (cron,
//! Cloud Scheduler, a sidecar timer) drives the cadence:
//!
//! - `GET /health` liveness probe
//! - `POST /reconcile` one recent-event reconciliation cycle
//! - `POST /drain` one pending-task sync drain

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;

use codegate_core::kv::memory::InMemoryKv;
use codegate_core::observability::{init_logging, LogFormat};
use codegate_flow::client::http::HttpCheckBackend;
use codegate_flow::config::ReconcilerConfig;
use codegate_flow::dispatch::PollDispatcher;
use codegate_flow::error::{Error, Result};
use codegate_flow::store::memory::InMemoryStores;

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<PollDispatcher>,
}

#[derive(Debug, Serialize)]
struct CycleResponse {
    code: u16,
    message: String,
    examined: usize,
    completed: usize,
    retried: usize,
    failed: usize,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: u16,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    message: String,
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        Self {
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::INTERNAL_SERVER_ERROR;
        (
            status,
            Json(ErrorResponse {
                code: status.as_u16(),
                message: self.message,
            }),
        )
            .into_response()
    }
}

async fn health_handler() -> StatusCode {
    StatusCode::OK
}

async fn reconcile_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<CycleResponse>, ApiError> {
    let summary = state.dispatcher.reconcile_recent_events().await?;
    Ok(Json(CycleResponse {
        code: 200,
        message: "reconcile cycle finished".to_string(),
        examined: summary.examined,
        completed: summary.finalized + summary.timed_out,
        retried: summary.busy + (summary.merged - summary.finalized - summary.timed_out),
        failed: summary.failed,
    }))
}

async fn drain_handler(
    State(state): State<AppState>,
) -> std::result::Result<Json<CycleResponse>, ApiError> {
    let summary = state.dispatcher.drain_pending_tasks().await?;
    Ok(Json(CycleResponse {
        code: 200,
        message: "drain cycle finished".to_string(),
        examined: summary.examined,
        completed: summary.synced + summary.feedback + summary.stale,
        retried: summary.retried,
        failed: summary.failed,
    }))
}

fn resolve_port() -> Result<u16> {
    if let Ok(port) = std::env::var("PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid PORT"));
    }

    if let Ok(port) = std::env::var("CODEGATE_PORT") {
        return port
            .parse::<u16>()
            .map_err(|_| Error::configuration("invalid CODEGATE_PORT"));
    }

    Ok(8080)
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn log_format_from_env() -> LogFormat {
    match std::env::var("CODEGATE_LOG_FORMAT") {
        Ok(value) if value.eq_ignore_ascii_case("json") => LogFormat::Json,
        _ => LogFormat::Pretty,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(log_format_from_env());

    let config = ReconcilerConfig::from_env()?;
    let backend_url = required_env("CODEGATE_BACKEND_URL")?;
    let backend = Arc::new(HttpCheckBackend::new(&backend_url)?);
    let port = resolve_port()?;

    let stores = Arc::new(InMemoryStores::new());
    let dispatcher = PollDispatcher::new(
        config,
        Arc::new(InMemoryKv::new()),
        backend,
        stores.clone(),
        stores.clone(),
        stores.clone(),
        stores.clone(),
        stores,
    );

    let state = AppState {
        dispatcher: Arc::new(dispatcher),
    };

    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/reconcile", post(reconcile_handler))
        .route("/drain", post(drain_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind: {e}")))?;
    tracing::info!(%addr, "codegate reconciler listening");

    axum::serve(listener, app)
        .await
        .map_err(|e| Error::configuration(format!("server error: {e}")))
}

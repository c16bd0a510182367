// Server mode - HTTP front end for the debounced pageview queues
//
// Runs anywhere tokio does:
// - Docker containers
// - Local development
// - VM instances
//
// Features:
// - Axum HTTP server (HTTP/1.1, HTTP/2)
// - One actor task per named queue, serialized through its mailbox
// - Durable queue state on the filesystem (or in memory for tests)
// - Pending flush deadlines recovered after a restart
// - Graceful shutdown

use anyhow::{Context, Result};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use opendal::Operator;
use pageview_config::RuntimeConfig;
use serde_json::json;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

mod alarm;
mod directory;
mod handlers;
mod init;
mod storage;

pub use directory::{QueueDirectory, QueueHandle};
pub use init::{init_operator, init_tracing};
pub use storage::{OpendalQueueStorage, QUEUES_PREFIX};

use handlers::{health_check, queue_status, ready_check, track_pageview};

/// Wall-clock milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// Application state shared across all requests
#[derive(Clone)]
pub struct AppState {
    pub(crate) directory: Arc<QueueDirectory>,
    pub(crate) queue_name: Arc<str>,
    pub(crate) operator: Operator,
}

impl AppState {
    /// `queue_name` is the queue tracked requests land in when none is given.
    pub fn new(directory: Arc<QueueDirectory>, queue_name: impl Into<Arc<str>>, operator: Operator) -> Self {
        Self {
            directory,
            queue_name: queue_name.into(),
            operator,
        }
    }
}

/// Error type that implements IntoResponse
pub(crate) struct AppError {
    status: StatusCode,
    error: anyhow::Error,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        error!("Request error: {:?}", self.error);
        (
            self.status,
            Json(json!({
                "error": self.error.to_string(),
            })),
        )
            .into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            error: err.into(),
        }
    }
}

impl AppError {
    pub fn with_status(status: StatusCode, error: anyhow::Error) -> Self {
        Self { status, error }
    }
}

/// Routes: `/health`, `/ready`, `GET /status`, and every other request is
/// tracked as a pageview.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/status", get(queue_status))
        .fallback(track_pageview)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Graceful shutdown handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        },
    }
}

/// Entry point for server mode
pub async fn run(config: RuntimeConfig) -> Result<()> {
    init_tracing(&config);

    info!("Server mode - debounced pageview batching");

    let server = config.server.clone().unwrap_or_default();
    let addr = server.listen_addr;

    let operator = init_operator(&config)?;
    let window = config.queue.window();
    info!(
        "Flush window {} ms, default queue '{}'",
        window.as_millis(),
        config.queue.name
    );

    let directory = Arc::new(QueueDirectory::new(operator.clone(), window));
    directory
        .recover()
        .await
        .context("Failed to recover persisted queues")?;

    let state = AppState::new(directory, config.queue.name.as_str(), operator);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context(format!("Failed to bind to {}", addr))?;

    info!("Pageview endpoint listening on http://{}", addr);
    info!("Routes:");
    info!("  GET  http://{}/status  - Queue status", addr);
    info!("  GET  http://{}/health  - Health check", addr);
    info!("  GET  http://{}/ready   - Readiness check", addr);
    info!("  *    http://{}/*       - Track pageview", addr);
    info!("Press Ctrl+C or send SIGTERM to stop");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server shutdown complete");

    Ok(())
}

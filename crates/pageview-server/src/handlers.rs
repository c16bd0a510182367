// HTTP handlers for server mode
//
// Every request that is not a status or health route is recorded as a pageview
// and answered with the queue's status message.

use crate::{now_ms, AppError, AppState};
use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use pageview_config::validate_queue_name;
use pageview_queue::PendingItem;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, error, warn};

const ERROR_BODY: &str = "Error processing pageview";

#[derive(Debug, Deserialize)]
pub(crate) struct StatusQuery {
    queue: Option<String>,
}

/// GET /health - Basic health check
pub(crate) async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "healthy"})))
}

/// GET /ready - Readiness check (includes storage connectivity)
pub(crate) async fn ready_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.operator.check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"status": "ready", "storage": "connected"})),
        ),
        Err(e) => {
            warn!("Storage readiness check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(
                    json!({"status": "not ready", "storage": "disconnected", "error": e.to_string()}),
                ),
            )
        }
    }
}

/// GET /status - Current queue depth as JSON
pub(crate) async fn queue_status(
    State(state): State<AppState>,
    Query(query): Query<StatusQuery>,
) -> Result<Response, AppError> {
    let name = query.queue.as_deref().unwrap_or(&state.queue_name);
    validate_queue_name(name).map_err(|e| AppError::with_status(StatusCode::BAD_REQUEST, e))?;

    let status = state.directory.status(name).await?;
    Ok((StatusCode::OK, Json(status)).into_response())
}

/// Fallback - track the request as a pageview
pub(crate) async fn track_pageview(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
) -> Result<Response, AppError> {
    let url = request_url(&headers, &uri)
        .map_err(|e| AppError::with_status(StatusCode::BAD_REQUEST, e))?;

    let mut item = PendingItem::new(url, now_ms());
    if let Some(user_agent) = header_str(&headers, header::USER_AGENT) {
        item = item.with_user_agent(user_agent);
    }
    if let Some(referer) = header_str(&headers, header::REFERER) {
        item = item.with_referer(referer);
    }
    debug!(url = %item.url, "Tracking pageview");

    let result = match state.directory.resolve(&state.queue_name) {
        Ok(queue) => queue.enqueue(item).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(status) => {
            counter!("pageview.tracked", 1);
            Ok((StatusCode::OK, status.message).into_response())
        }
        Err(e) => {
            counter!("pageview.failed", 1);
            error!(error = %e, "Failed to enqueue pageview");
            Ok((StatusCode::INTERNAL_SERVER_ERROR, ERROR_BODY).into_response())
        }
    }
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

/// Reconstruct the absolute URL the client requested.
fn request_url(headers: &HeaderMap, uri: &Uri) -> anyhow::Result<String> {
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Ok(uri.to_string());
    }

    let host = header_str(headers, header::HOST)
        .ok_or_else(|| anyhow::anyhow!("request has no Host header"))?;
    let scheme = header_str(headers, header::HeaderName::from_static("x-forwarded-proto"))
        .unwrap_or("http");
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    let url = format!("{}://{}{}", scheme, host, path);
    url.parse::<Uri>()
        .map_err(|e| anyhow::anyhow!("invalid request url {}: {}", url, e))?;
    Ok(url)
}

//! HTTP request handling for the Cloudflare Worker.
//!
//! Routes `GET /status` to the queue's status endpoint and records every other
//! request as a pageview on the queue's Durable Object.

use crate::config::runtime_config;
use crate::errors::{ErrorResponse, PageviewErrorKind, TRACK_ERROR_BODY};
use crate::QUEUE_BINDING;
use pageview_config::validate_queue_name;
use pageview_queue::{PendingItem, QueueStatus};
use worker::*;

/// Build the pageview record for an inbound request.
pub(crate) fn pageview_from_parts(
    url: &Url,
    user_agent: Option<String>,
    referer: Option<String>,
    now_ms: i64,
) -> PendingItem {
    let mut item = PendingItem::new(url.as_str(), now_ms);
    if let Some(ua) = user_agent.filter(|v| !v.is_empty()) {
        item = item.with_user_agent(ua);
    }
    if let Some(referer) = referer.filter(|v| !v.is_empty()) {
        item = item.with_referer(referer);
    }
    item
}

/// Queue targeted by a status read: `?queue=` when present, else the default.
pub(crate) fn requested_queue<'a>(url: &'a Url, default: &'a str) -> std::borrow::Cow<'a, str> {
    url.query_pairs()
        .find(|(k, _)| k == "queue")
        .map(|(_, v)| v)
        .unwrap_or(std::borrow::Cow::Borrowed(default))
}

/// Main request handler called by the Worker fetch event.
#[tracing::instrument(
    name = "pageview.request",
    skip(req, env),
    fields(
        path = %req.path(),
        queue = tracing::field::Empty,
        error = tracing::field::Empty,
    )
)]
pub(crate) async fn handle(req: Request, env: Env) -> Result<Response> {
    let config = match runtime_config(&env) {
        Ok(config) => config,
        Err(e) => {
            let err = PageviewErrorKind::ConfigError(e.to_string());
            return ErrorResponse::from_error(&err).into_response(err.status_code());
        }
    };

    let url = req.url()?;
    if req.method() == Method::Get && url.path() == "/status" {
        let name = requested_queue(&url, &config.queue.name);
        if let Err(e) = validate_queue_name(&name) {
            let err = PageviewErrorKind::InvalidRequest(e.to_string());
            return ErrorResponse::from_error(&err).into_response(err.status_code());
        }
        tracing::Span::current().record("queue", name.as_ref());
        return match queue_status(&env, &name).await {
            Ok(status) => Response::from_json(&status),
            Err(e) => {
                tracing::error!(error = %e, "Status read failed");
                let err = PageviewErrorKind::StorageError(e.to_string());
                ErrorResponse::from_error(&err).into_response(err.status_code())
            }
        };
    }

    tracing::Span::current().record("queue", config.queue.name.as_str());
    let item = pageview_from_parts(
        &url,
        req.headers().get("user-agent").ok().flatten(),
        req.headers().get("referer").ok().flatten(),
        Date::now().as_millis() as i64,
    );

    match enqueue(&env, &config.queue.name, &item).await {
        Ok(status) => Response::ok(status.message),
        Err(e) => {
            tracing::Span::current().record("error", tracing::field::display(&e));
            tracing::error!(error = %e, url = %item.url, "Failed to enqueue pageview");
            Response::error(TRACK_ERROR_BODY, 500)
        }
    }
}

fn queue_stub(env: &Env, name: &str) -> Result<Stub> {
    let namespace = env.durable_object(QUEUE_BINDING)?;
    let id = namespace.id_from_name(name)?;
    id.get_stub()
}

async fn enqueue(env: &Env, name: &str, item: &PendingItem) -> Result<QueueStatus> {
    let stub = queue_stub(env, name)?;

    let headers = Headers::new();
    headers.set("Content-Type", "application/json")?;

    let mut init = RequestInit::new();
    init.with_method(Method::Post);
    init.with_headers(headers);
    init.with_body(Some(
        serde_json::to_string(item)
            .map_err(|e| Error::RustError(format!("pageview serialize failed: {}", e)))?
            .into(),
    ));

    let request = Request::new_with_init("http://do/enqueue", &init)?;
    let mut response = stub.fetch_with_request(request).await?;
    read_status(&mut response).await
}

async fn queue_status(env: &Env, name: &str) -> Result<QueueStatus> {
    let stub = queue_stub(env, name)?;
    let mut response = stub.fetch_with_str("http://do/status").await?;
    read_status(&mut response).await
}

async fn read_status(response: &mut Response) -> Result<QueueStatus> {
    if response.status_code() != 200 {
        let body = response.text().await.unwrap_or_default();
        return Err(Error::RustError(format!(
            "queue object returned {}: {}",
            response.status_code(),
            body
        )));
    }
    response.json::<QueueStatus>().await
}

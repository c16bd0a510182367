// End-to-end tests for pageview-batcher
//
// Drive the HTTP router the way a browser would and check what reaches the
// downstream sink once the flush window elapses.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use opendal::{services, Operator};
use pageview_queue::{PageviewSink, PendingItem, QueueStatus, SinkError};
use pageview_server::{build_router, AppState, QueueDirectory};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

#[derive(Default)]
struct RecordingSink {
    batches: Mutex<Vec<Vec<PendingItem>>>,
}

#[async_trait]
impl PageviewSink for RecordingSink {
    async fn deliver(&self, items: &[PendingItem]) -> Result<(), SinkError> {
        self.batches.lock().push(items.to_vec());
        Ok(())
    }
}

fn memory_operator() -> Operator {
    Operator::new(services::Memory::default())
        .expect("Failed to create memory operator")
        .finish()
}

fn app(op: Operator) -> (Router, Arc<RecordingSink>) {
    app_with_window(op, Duration::from_secs(10))
}

fn app_with_window(op: Operator, window: Duration) -> (Router, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let directory = Arc::new(QueueDirectory::with_sink(op.clone(), window, sink.clone()));
    (build_router(AppState::new(directory, "default", op)), sink)
}

fn pageview(path: &str) -> Request<Body> {
    Request::builder()
        .uri(path)
        .header("host", "example.com")
        .header("user-agent", "e2e/1.0")
        .body(Body::empty())
        .unwrap()
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, String) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, String::from_utf8(bytes.to_vec()).unwrap())
}

async fn queue_status(app: &Router, path: &str) -> QueueStatus {
    let req = Request::builder().uri(path).body(Body::empty()).unwrap();
    let (status, body) = send(app, req).await;
    assert_eq!(status, StatusCode::OK, "status body: {}", body);
    serde_json::from_str(&body).unwrap()
}

#[tokio::test]
async fn test_pageview_is_acknowledged_with_queue_count() {
    let (app, _sink) = app(memory_operator());

    let (status, body) = send(&app, pageview("/")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, "Pageview queued. 1 pageview(s) waiting for flush.");

    let (_, body) = send(&app, pageview("/about")).await;
    assert_eq!(body, "Pageview queued. 2 pageview(s) waiting for flush.");

    let status = queue_status(&app, "/status").await;
    assert_eq!(status.count, 2);
    assert_eq!(status.message, "2 pageview(s) pending flush.");
}

#[tokio::test(start_paused = true)]
async fn test_burst_is_flushed_once_after_window() {
    let (app, sink) = app(memory_operator());

    for path in ["/", "/pricing", "/docs?page=2"] {
        send(&app, pageview(path)).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    assert!(sink.batches.lock().is_empty());

    tokio::time::sleep(Duration::from_secs(5)).await;

    let batches = sink.batches.lock().clone();
    assert_eq!(batches.len(), 1);
    let urls: Vec<&str> = batches[0].iter().map(|i| i.url.as_str()).collect();
    assert_eq!(
        urls,
        vec![
            "http://example.com/",
            "http://example.com/pricing",
            "http://example.com/docs?page=2"
        ]
    );
    assert_eq!(batches[0][0].user_agent.as_deref(), Some("e2e/1.0"));

    assert_eq!(queue_status(&app, "/status").await.count, 0);
}

#[tokio::test]
async fn test_referer_is_recorded() {
    let op = memory_operator();
    let (app, _sink) = app(op.clone());

    let req = Request::builder()
        .uri("/landing")
        .header("host", "example.com")
        .header("referer", "https://search.example/?q=pageviews")
        .body(Body::empty())
        .unwrap();
    send(&app, req).await;

    let raw = op
        .read("queues/default/pageviewQueue.json")
        .await
        .unwrap()
        .to_vec();
    let items: Vec<serde_json::Value> = serde_json::from_slice(&raw).unwrap();
    assert_eq!(items[0]["url"], "http://example.com/landing");
    assert_eq!(items[0]["referer"], "https://search.example/?q=pageviews");
    assert!(items[0].get("userAgent").is_none());
}

#[tokio::test]
async fn test_request_without_host_is_rejected() {
    let (app, _sink) = app(memory_operator());

    let req = Request::builder().uri("/").body(Body::empty()).unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert_eq!(queue_status(&app, "/status").await.count, 0);
}

#[tokio::test]
async fn test_status_for_named_queue() {
    let (app, _sink) = app(memory_operator());
    send(&app, pageview("/")).await;

    assert_eq!(queue_status(&app, "/status?queue=default").await.count, 1);
    assert_eq!(queue_status(&app, "/status?queue=other").await.count, 0);

    let req = Request::builder()
        .uri("/status?queue=..%2Fetc")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_health_and_ready() {
    let (app, _sink) = app(memory_operator());

    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("healthy"));

    let req = Request::builder().uri("/ready").body(Body::empty()).unwrap();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("ready"));
}

#[tokio::test]
async fn test_filesystem_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let fs_operator = || {
        Operator::new(services::Fs::default().root(&dir.path().to_string_lossy()))
            .unwrap()
            .finish()
    };

    {
        let (app, sink) = app_with_window(fs_operator(), Duration::from_millis(500));
        let (_, body) = send(&app, pageview("/before-restart")).await;
        assert_eq!(body, "Pageview queued. 1 pageview(s) waiting for flush.");
        assert!(sink.batches.lock().is_empty());
    }
    assert!(dir
        .path()
        .join("queues/default/pageviewQueue.json")
        .exists());
    assert!(dir.path().join("queues/default/alarm.json").exists());

    // The old deadline passes while nothing is running.
    tokio::time::sleep(Duration::from_millis(600)).await;

    let op = fs_operator();
    let sink = Arc::new(RecordingSink::default());
    let directory = Arc::new(QueueDirectory::with_sink(
        op.clone(),
        Duration::from_millis(500),
        sink.clone(),
    ));
    directory.recover().await.unwrap();
    let app = build_router(AppState::new(directory, "default", op));

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let urls: Vec<Vec<String>> = sink
        .batches
        .lock()
        .iter()
        .map(|batch| batch.iter().map(|i| i.url.clone()).collect())
        .collect();
    assert_eq!(urls, vec![vec!["http://example.com/before-restart".to_string()]]);
    assert_eq!(queue_status(&app, "/status").await.count, 0);
    assert!(!dir.path().join("queues/default/alarm.json").exists());
}

//! Durable Object hosting one debounced pageview queue.
//!
//! The object's single-threaded execution serializes enqueue, status and
//! alarm-driven flushes. State lives in Durable Object storage under
//! `pageviewQueue`; the deadline is the object's storage alarm.

use crate::config::runtime_config;
use crate::errors::queue_error;
use async_trait::async_trait;
use pageview_queue::{
    DebouncedQueue, LogSink, PendingItem, QueueError, QueueStorage, DEFAULT_WINDOW, ITEMS_KEY,
};
use std::time::Duration;
use worker::{durable_object, Date, DurableObject, Env, Method, Request, Response, Result, State, Storage};

fn now_ms() -> i64 {
    Date::now().as_millis() as i64
}

/// [`QueueStorage`] over Durable Object storage.
pub(crate) struct DoQueueStorage {
    storage: Storage,
}

#[async_trait(?Send)]
impl QueueStorage for DoQueueStorage {
    async fn load_items(&self) -> pageview_queue::Result<Vec<PendingItem>> {
        let items: Option<Vec<PendingItem>> =
            self.storage.get(ITEMS_KEY).await.map_err(QueueError::storage)?;
        Ok(items.unwrap_or_default())
    }

    async fn store_items(&self, items: &[PendingItem]) -> pageview_queue::Result<()> {
        self.storage
            .put(ITEMS_KEY, items)
            .await
            .map_err(QueueError::storage)
    }

    async fn delete_items(&self) -> pageview_queue::Result<()> {
        self.storage
            .delete(ITEMS_KEY)
            .await
            .map(|_| ())
            .map_err(QueueError::storage)
    }

    async fn get_alarm(&self) -> pageview_queue::Result<Option<i64>> {
        self.storage.get_alarm().await.map_err(QueueError::storage)
    }

    async fn set_alarm(&self, deadline_ms: i64) -> pageview_queue::Result<()> {
        // The runtime takes an offset from now, not an absolute time.
        let offset_ms = deadline_ms.saturating_sub(now_ms()).max(0);
        self.storage
            .set_alarm(offset_ms)
            .await
            .map_err(QueueError::storage)?;
        tracing::debug!(deadline_ms, offset_ms, "Set alarm for flush (offset-based)");
        Ok(())
    }

    async fn delete_alarm(&self) -> pageview_queue::Result<()> {
        self.storage.delete_alarm().await.map_err(QueueError::storage)
    }
}

/// Durable Object owning one named pageview queue.
#[durable_object]
pub struct PageviewQueue {
    state: State,
    window: Duration,
}

impl PageviewQueue {
    fn queue(&self) -> DebouncedQueue<DoQueueStorage, LogSink> {
        let storage = DoQueueStorage {
            storage: self.state.storage(),
        };
        DebouncedQueue::new(storage, LogSink).with_window(self.window)
    }

    async fn handle_enqueue(&self, mut req: Request) -> Result<Response> {
        let item: PendingItem = match req.json().await {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, "Rejecting malformed pageview");
                return Response::error(format!("Invalid pageview payload: {}", e), 400);
            }
        };

        let status = self
            .queue()
            .enqueue(item, now_ms())
            .await
            .map_err(queue_error)?;
        Response::from_json(&status)
    }

    async fn handle_status(&self) -> Result<Response> {
        let status = self.queue().status().await.map_err(queue_error)?;
        Response::from_json(&status)
    }
}

impl DurableObject for PageviewQueue {
    fn new(state: State, env: Env) -> Self {
        let window = match runtime_config(&env) {
            Ok(config) => config.queue.window(),
            Err(e) => {
                tracing::warn!(error = %e, "Falling back to default flush window");
                DEFAULT_WINDOW
            }
        };

        Self { state, window }
    }

    async fn fetch(&self, req: Request) -> Result<Response> {
        let path = req.path();
        match (req.method(), path.as_str()) {
            (Method::Post, "/enqueue") => self.handle_enqueue(req).await,
            (Method::Get, "/status") => self.handle_status().await,
            _ => Response::error("Not found", 404),
        }
    }

    async fn alarm(&self) -> Result<Response> {
        tracing::debug!("Alarm triggered, flushing");
        let queue = self.queue();

        match queue.flush(now_ms()).await {
            Ok(flushed) => Response::ok(format!("flushed {}", flushed)),
            Err(e) => {
                tracing::error!(error = %e, "Alarm flush failed");

                // Sink failures already re-armed; a storage failure did not.
                let pending = queue.status().await.map(|s| s.count).unwrap_or(0);
                let armed = queue.storage().get_alarm().await.ok().flatten();
                if pending > 0 && armed.is_none() {
                    let window_ms = queue.window().as_millis() as i64;
                    if let Err(alarm_err) = queue.storage().set_alarm(now_ms() + window_ms).await {
                        tracing::warn!(
                            error = %alarm_err,
                            "Failed to reschedule alarm after flush failure"
                        );
                    }
                }

                Response::error(format!("Flush failed: {}", e), 500)
            }
        }
    }
}

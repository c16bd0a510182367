//! The debounced queue actor.
//!
//! ```text
//!            enqueue                 enqueue (deadline untouched)
//!   Empty ───────────► Accumulating ◄──────┐
//!     ▲                     │  └───────────┘
//!     │       flush         │ deadline elapses
//!     └──────────────── Flushing
//! ```
//!
//! The queue itself holds no volatile state: every decision is re-derived from
//! storage, so an instance can be dropped and recreated at any point (process
//! restart, Durable Object hibernation) without losing items.
//!
//! # Serialization
//!
//! Operations on one queue identity must not interleave. The host provides
//! this: the native server drives each queue from a single mailbox task, and
//! Durable Objects run one event at a time.

use crate::error::Result;
use crate::sink::PageviewSink;
use crate::storage::QueueStorage;
use crate::types::{PendingItem, QueueStatus};
use std::time::Duration;

/// Quiescence window between the first unprocessed pageview and the flush.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(10);

pub struct DebouncedQueue<S, K> {
    storage: S,
    sink: K,
    window: Duration,
}

impl<S, K> DebouncedQueue<S, K>
where
    S: QueueStorage,
    K: PageviewSink,
{
    pub fn new(storage: S, sink: K) -> Self {
        Self {
            storage,
            sink,
            window: DEFAULT_WINDOW,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.window.as_millis()).unwrap_or(i64::MAX)
    }

    /// Append `item` and arm the flush deadline if none is armed.
    ///
    /// The item is persisted before the alarm is inspected, so a crash between
    /// the two writes keeps the item and the next enqueue (or
    /// [`resume`](Self::resume)) arms the missing alarm.
    #[tracing::instrument(
        name = "queue.enqueue",
        skip(self, item),
        fields(
            url = %item.url,
            count = tracing::field::Empty,
            deadline = tracing::field::Empty,
        )
    )]
    pub async fn enqueue(&self, item: PendingItem, now_ms: i64) -> Result<QueueStatus> {
        let mut items = self.storage.load_items().await?;
        items.push(item);
        self.storage.store_items(&items).await?;

        let deadline = self.ensure_alarm(now_ms).await?;

        let count = items.len();
        tracing::Span::current().record("count", count);
        tracing::Span::current().record("deadline", deadline);
        tracing::debug!(count, deadline, "Pageview queued");

        Ok(QueueStatus::queued(count))
    }

    /// Current pending count. Never touches the deadline.
    pub async fn status(&self) -> Result<QueueStatus> {
        let items = self.storage.load_items().await?;
        Ok(QueueStatus::pending(items.len()))
    }

    /// Deliver every pending item to the sink in arrival order, then clear the
    /// queue and its deadline. Returns the number of items delivered.
    ///
    /// Items are only cleared after the sink accepts the batch. On sink
    /// failure the batch stays queued, a retry deadline is armed and the error
    /// is returned.
    #[tracing::instrument(
        name = "queue.flush",
        skip(self),
        fields(
            count = tracing::field::Empty,
            error = tracing::field::Empty,
        )
    )]
    pub async fn flush(&self, now_ms: i64) -> Result<usize> {
        let items = self.storage.load_items().await?;
        tracing::Span::current().record("count", items.len());

        if items.is_empty() {
            tracing::debug!("Flush with empty queue, nothing to deliver");
            self.storage.delete_alarm().await?;
            return Ok(0);
        }

        if let Err(e) = self.sink.deliver(&items).await {
            tracing::error!(error = %e, pending = items.len(), "Sink delivery failed, keeping batch");
            tracing::Span::current().record("error", tracing::field::display(&e));
            let retry_at = now_ms.saturating_add(self.window_ms());
            if let Err(alarm_err) = self.storage.set_alarm(retry_at).await {
                tracing::warn!(error = %alarm_err, "Failed to arm retry alarm after sink failure");
            }
            return Err(e.into());
        }

        self.storage.delete_items().await?;
        self.storage.delete_alarm().await?;

        tracing::info!(flushed = items.len(), "Pageview batch flushed");
        Ok(items.len())
    }

    /// Re-derive the timer after a restart. Returns the deadline the host
    /// must schedule, if any.
    ///
    /// A persisted deadline is returned as-is (it may already be overdue). If
    /// items survived but their alarm write did not, a fresh deadline is armed.
    pub async fn resume(&self, now_ms: i64) -> Result<Option<i64>> {
        if let Some(deadline) = self.storage.get_alarm().await? {
            return Ok(Some(deadline));
        }

        let items = self.storage.load_items().await?;
        if items.is_empty() {
            return Ok(None);
        }

        tracing::warn!(
            pending = items.len(),
            "Found pending pageviews without a deadline, arming one"
        );
        self.ensure_alarm(now_ms).await.map(Some)
    }

    /// Arm the alarm only when none is set. Returns the effective deadline.
    async fn ensure_alarm(&self, now_ms: i64) -> Result<i64> {
        match self.storage.get_alarm().await? {
            Some(existing) => {
                tracing::trace!(deadline = existing, "Alarm already set, keeping existing");
                Ok(existing)
            }
            None => {
                let deadline = now_ms.saturating_add(self.window_ms());
                self.storage.set_alarm(deadline).await?;
                tracing::debug!(
                    deadline,
                    window_ms = self.window_ms(),
                    "Set alarm for flush"
                );
                Ok(deadline)
            }
        }
    }
}

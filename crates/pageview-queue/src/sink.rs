//! Downstream consumers of flushed batches.

use crate::error::SinkError;
use crate::types::PendingItem;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

const BANNER: &str = "========== PAGEVIEW BATCH FLUSH ==========";
const CLOSING_BANNER: &str = "==========================================";

/// Receives every flushed batch, in arrival order.
///
/// Delivery is at-least-once: if `deliver` fails the queue keeps the batch and
/// retries it on the next deadline, so a sink may see items it partially
/// emitted before.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait PageviewSink {
    async fn deliver(&self, items: &[PendingItem]) -> Result<(), SinkError>;
}

/// Render a batch in the operational log format:
///
/// ```text
/// ========== PAGEVIEW BATCH FLUSH ==========
/// Flushing 2 pageview(s)
/// [1] 2023-11-14T22:13:20.000Z - https://example.com/
///     User-Agent: curl/8.0
/// [2] 2023-11-14T22:13:23.000Z - https://example.com/about
///     Referer: https://example.com/
/// ==========================================
/// ```
pub fn render_batch(items: &[PendingItem]) -> Vec<String> {
    let mut lines = Vec::with_capacity(items.len() + 3);
    lines.push(BANNER.to_string());
    lines.push(format!("Flushing {} pageview(s)", items.len()));

    for (idx, item) in items.iter().enumerate() {
        lines.push(format!(
            "[{}] {} - {}",
            idx + 1,
            iso_timestamp(item.timestamp),
            item.url
        ));
        if let Some(user_agent) = &item.user_agent {
            lines.push(format!("    User-Agent: {}", user_agent));
        }
        if let Some(referer) = &item.referer {
            lines.push(format!("    Referer: {}", referer));
        }
    }

    lines.push(CLOSING_BANNER.to_string());
    lines
}

/// ISO-8601 with millisecond precision and a `Z` suffix. Out-of-range values
/// fall back to the raw millisecond count.
fn iso_timestamp(millis: i64) -> String {
    match DateTime::<Utc>::from_timestamp_millis(millis) {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

// Shared sinks: lets a runtime hand one sink to many queues.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl<T> PageviewSink for std::sync::Arc<T>
where
    T: PageviewSink + ?Sized + Send + Sync,
{
    async fn deliver(&self, items: &[PendingItem]) -> Result<(), SinkError> {
        (**self).deliver(items).await
    }
}

/// Writes each flushed batch to the operational log. Stands in for an
/// analytics API.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl PageviewSink for LogSink {
    async fn deliver(&self, items: &[PendingItem]) -> Result<(), SinkError> {
        for line in render_batch(items) {
            tracing::info!(target: "pageview_queue::sink", "{}", line);
        }
        Ok(())
    }
}

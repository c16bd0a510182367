//! Durable storage abstraction for queue state.
//!
//! Mirrors the Durable Object storage surface: one keyed value holding the
//! pending items plus a single-slot, one-shot alarm.
//!
//! Implementations:
//! - `DoQueueStorage` (Cloudflare Durable Object storage)
//! - `OpendalQueueStorage` (native server, filesystem or memory)
//! - [`MemoryStorage`] (tests)

use crate::error::Result;
use crate::types::PendingItem;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Storage key holding the ordered sequence of pending items.
pub const ITEMS_KEY: &str = "pageviewQueue";

// Native: futures must be Send so actors can run on a multi-threaded runtime.
// WASM: Durable Object storage handles are !Send.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
pub trait QueueStorage {
    /// Load the pending items in insertion order. Missing state reads as empty.
    async fn load_items(&self) -> Result<Vec<PendingItem>>;

    /// Replace the persisted sequence with `items`.
    async fn store_items(&self, items: &[PendingItem]) -> Result<()>;

    /// Remove the persisted sequence entirely.
    async fn delete_items(&self) -> Result<()>;

    /// Absolute deadline (ms since epoch) of the armed alarm, if any.
    async fn get_alarm(&self) -> Result<Option<i64>>;

    /// Arm the alarm for `deadline_ms`, replacing any previous one.
    async fn set_alarm(&self, deadline_ms: i64) -> Result<()>;

    /// Disarm the alarm. A no-op when none is set.
    async fn delete_alarm(&self) -> Result<()>;
}

/// In-process storage. State lives as long as the value does, so tests model
/// a restart by handing the same `MemoryStorage` to a fresh queue.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    items: Mutex<Vec<PendingItem>>,
    alarm: Mutex<Option<i64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl QueueStorage for MemoryStorage {
    async fn load_items(&self) -> Result<Vec<PendingItem>> {
        Ok(self.items.lock().clone())
    }

    async fn store_items(&self, items: &[PendingItem]) -> Result<()> {
        *self.items.lock() = items.to_vec();
        Ok(())
    }

    async fn delete_items(&self) -> Result<()> {
        self.items.lock().clear();
        Ok(())
    }

    async fn get_alarm(&self) -> Result<Option<i64>> {
        Ok(*self.alarm.lock())
    }

    async fn set_alarm(&self, deadline_ms: i64) -> Result<()> {
        *self.alarm.lock() = Some(deadline_ms);
        Ok(())
    }

    async fn delete_alarm(&self) -> Result<()> {
        *self.alarm.lock() = None;
        Ok(())
    }
}

// Shared storage: lets a host keep a handle to the backend it gave the queue.
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
impl<T> QueueStorage for std::sync::Arc<T>
where
    T: QueueStorage + ?Sized + Send + Sync,
{
    async fn load_items(&self) -> Result<Vec<PendingItem>> {
        (**self).load_items().await
    }

    async fn store_items(&self, items: &[PendingItem]) -> Result<()> {
        (**self).store_items(items).await
    }

    async fn delete_items(&self) -> Result<()> {
        (**self).delete_items().await
    }

    async fn get_alarm(&self) -> Result<Option<i64>> {
        (**self).get_alarm().await
    }

    async fn set_alarm(&self, deadline_ms: i64) -> Result<()> {
        (**self).set_alarm(deadline_ms).await
    }

    async fn delete_alarm(&self) -> Result<()> {
        (**self).delete_alarm().await
    }
}

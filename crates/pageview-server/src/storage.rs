//! OpenDAL-backed queue storage for the native server.
//!
//! Layout per queue:
//! - `queues/{name}/pageviewQueue.json`: JSON array of pending items
//! - `queues/{name}/alarm.json`: armed deadline, absent when disarmed

use crate::alarm::AlarmTimer;
use async_trait::async_trait;
use opendal::{ErrorKind, Operator};
use pageview_queue::{PendingItem, QueueError, QueueStorage, Result, ITEMS_KEY};
use serde::{Deserialize, Serialize};

/// Prefix under which every queue keeps its state.
pub const QUEUES_PREFIX: &str = "queues/";

#[derive(Debug, Serialize, Deserialize)]
struct PersistedAlarm {
    deadline_ms: i64,
}

pub struct OpendalQueueStorage {
    operator: Operator,
    items_path: String,
    alarm_path: String,
    timer: AlarmTimer,
}

fn items_path(queue_name: &str) -> String {
    format!("{}{}/{}.json", QUEUES_PREFIX, queue_name, ITEMS_KEY)
}

fn alarm_path(queue_name: &str) -> String {
    format!("{}{}/alarm.json", QUEUES_PREFIX, queue_name)
}

/// Read a queue's persisted items without an actor. Missing state reads as
/// empty.
pub(crate) async fn peek_items(operator: &Operator, queue_name: &str) -> Result<Vec<PendingItem>> {
    let path = items_path(queue_name);
    match operator.read(&path).await {
        Ok(buf) => Ok(serde_json::from_slice(&buf.to_vec())?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(QueueError::storage(format!("read {} failed: {}", path, e))),
    }
}

impl OpendalQueueStorage {
    pub(crate) fn new(operator: Operator, queue_name: &str, timer: AlarmTimer) -> Self {
        Self {
            operator,
            items_path: items_path(queue_name),
            alarm_path: alarm_path(queue_name),
            timer,
        }
    }

    pub(crate) fn timer(&self) -> &AlarmTimer {
        &self.timer
    }

    /// Read a JSON document, treating a missing object as `None`.
    async fn read_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.operator.read(path).await {
            Ok(buf) => Ok(Some(serde_json::from_slice(&buf.to_vec())?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(QueueError::storage(format!("read {} failed: {}", path, e))),
        }
    }

    async fn write_json<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<()> {
        let body = serde_json::to_vec(value)?;
        self.operator
            .write(path, body)
            .await
            .map(|_| ())
            .map_err(|e| QueueError::storage(format!("write {} failed: {}", path, e)))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.operator
            .delete(path)
            .await
            .map_err(|e| QueueError::storage(format!("delete {} failed: {}", path, e)))
    }
}

#[async_trait]
impl QueueStorage for OpendalQueueStorage {
    async fn load_items(&self) -> Result<Vec<PendingItem>> {
        Ok(self
            .read_json::<Vec<PendingItem>>(&self.items_path)
            .await?
            .unwrap_or_default())
    }

    async fn store_items(&self, items: &[PendingItem]) -> Result<()> {
        self.write_json(&self.items_path, items).await
    }

    async fn delete_items(&self) -> Result<()> {
        self.delete(&self.items_path).await
    }

    async fn get_alarm(&self) -> Result<Option<i64>> {
        let deadline = self
            .read_json::<PersistedAlarm>(&self.alarm_path)
            .await?
            .map(|alarm| alarm.deadline_ms);

        // A persisted deadline must always have a timer behind it, otherwise
        // enqueue keeps seeing an alarm that will never fire.
        if let Some(deadline_ms) = deadline {
            if self.timer.deadline().is_none() {
                tracing::warn!(deadline_ms, "Persisted alarm had no timer, re-arming");
                self.timer.schedule(deadline_ms);
            }
        }
        Ok(deadline)
    }

    async fn set_alarm(&self, deadline_ms: i64) -> Result<()> {
        // Persist first so a crash right after still leaves a recoverable deadline.
        self.write_json(&self.alarm_path, &PersistedAlarm { deadline_ms })
            .await?;
        self.timer.schedule(deadline_ms);
        Ok(())
    }

    async fn delete_alarm(&self) -> Result<()> {
        // Keep the timer armed until the persisted alarm is really gone.
        self.delete(&self.alarm_path).await?;
        self.timer.cancel();
        Ok(())
    }
}

//! Keyed-singleton directory of queue actors.
//!
//! Each queue name maps to exactly one tokio task that owns a
//! [`DebouncedQueue`] and drains a bounded mailbox. Enqueues, status reads and
//! alarm-triggered flushes all travel through that mailbox, so operations on
//! one queue never interleave even though every step awaits storage.

use crate::alarm::AlarmTimer;
use crate::now_ms;
use crate::storage::{peek_items, OpendalQueueStorage, QUEUES_PREFIX};
use anyhow::{anyhow, Context, Result};
use opendal::{ErrorKind, Operator};
use pageview_config::validate_queue_name;
use pageview_queue::{
    DebouncedQueue, LogSink, PageviewSink, PendingItem, QueueError, QueueStatus, QueueStorage,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Pending commands per queue before `enqueue` callers start waiting.
const MAILBOX_CAPACITY: usize = 1024;

pub(crate) type SharedSink = Arc<dyn PageviewSink + Send + Sync>;
type Queue = DebouncedQueue<OpendalQueueStorage, SharedSink>;
type Reply = oneshot::Sender<std::result::Result<QueueStatus, QueueError>>;

pub(crate) enum Command {
    Enqueue { item: PendingItem, reply: Reply },
    Status { reply: Reply },
    Alarm { deadline_ms: i64 },
}

/// Handle to one named queue. Cheap to clone.
#[derive(Clone)]
pub struct QueueHandle {
    name: Arc<str>,
    tx: mpsc::Sender<Command>,
}

impl QueueHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn enqueue(&self, item: PendingItem) -> Result<QueueStatus> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Enqueue { item, reply }, rx).await
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let (reply, rx) = oneshot::channel();
        self.call(Command::Status { reply }, rx).await
    }

    async fn call(
        &self,
        command: Command,
        rx: oneshot::Receiver<std::result::Result<QueueStatus, QueueError>>,
    ) -> Result<QueueStatus> {
        self.tx
            .send(command)
            .await
            .map_err(|_| anyhow!("queue '{}' is no longer running", self.name))?;
        let status = rx
            .await
            .map_err(|_| anyhow!("queue '{}' dropped the request", self.name))??;
        Ok(status)
    }
}

/// Resolves queue names to running actors, spawning them on first use.
pub struct QueueDirectory {
    operator: Operator,
    window: Duration,
    sink: SharedSink,
    queues: Mutex<HashMap<String, QueueHandle>>,
}

impl QueueDirectory {
    pub fn new(operator: Operator, window: Duration) -> Self {
        Self::with_sink(operator, window, Arc::new(LogSink))
    }

    pub fn with_sink(operator: Operator, window: Duration, sink: SharedSink) -> Self {
        Self {
            operator,
            window,
            sink,
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Same name, same actor. Must be called from within a tokio runtime.
    pub fn resolve(&self, name: &str) -> Result<QueueHandle> {
        validate_queue_name(name)?;

        let mut queues = self.queues.lock();
        if let Some(handle) = queues.get(name) {
            return Ok(handle.clone());
        }

        let handle = self.spawn(name);
        queues.insert(name.to_string(), handle.clone());
        Ok(handle)
    }

    /// Status of `name` without starting an actor for it. Queues that are
    /// not running are read straight from storage.
    pub async fn status(&self, name: &str) -> Result<QueueStatus> {
        validate_queue_name(name)?;

        let running = self.queues.lock().get(name).cloned();
        match running {
            Some(handle) => handle.status().await,
            None => {
                let items = peek_items(&self.operator, name)
                    .await
                    .with_context(|| format!("Failed to read queue '{}'", name))?;
                Ok(QueueStatus::pending(items.len()))
            }
        }
    }

    /// Start an actor for every queue with persisted state so deadlines armed
    /// before a restart still fire. Returns the number of queues started.
    pub async fn recover(&self) -> Result<usize> {
        let entries = match self.operator.list(QUEUES_PREFIX).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context("Failed to list persisted queues"),
        };

        let mut recovered = 0;
        for entry in entries {
            if !entry.metadata().is_dir() || entry.path() == QUEUES_PREFIX {
                continue;
            }
            let name = entry.name().trim_end_matches('/');
            match self.resolve(name) {
                Ok(_) => recovered += 1,
                Err(e) => warn!(name = %name, error = %e, "Skipping unrecognised queue directory"),
            }
        }

        info!(recovered, "Recovered persisted queues");
        Ok(recovered)
    }

    fn spawn(&self, name: &str) -> QueueHandle {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let timer = AlarmTimer::new(tx.downgrade());
        let storage = OpendalQueueStorage::new(self.operator.clone(), name, timer);
        let queue = DebouncedQueue::new(storage, self.sink.clone()).with_window(self.window);

        debug!(name = %name, "Starting queue actor");
        tokio::spawn(run_queue(name.to_string(), queue, rx));

        QueueHandle {
            name: Arc::from(name),
            tx,
        }
    }
}

async fn run_queue(name: String, queue: Queue, mut rx: mpsc::Receiver<Command>) {
    // Re-derive the timer before serving anything queued in the mailbox.
    match queue.resume(now_ms()).await {
        Ok(Some(deadline_ms)) => {
            if queue.storage().timer().deadline() != Some(deadline_ms) {
                queue.storage().timer().schedule(deadline_ms);
            }
            info!(queue = %name, deadline_ms, "Resumed pending flush deadline");
        }
        Ok(None) => {}
        Err(e) => error!(queue = %name, error = %e, "Failed to resume queue state"),
    }

    while let Some(command) = rx.recv().await {
        match command {
            Command::Enqueue { item, reply } => {
                let result = queue.enqueue(item, now_ms()).await;
                if let Err(e) = &result {
                    error!(queue = %name, error = %e, "Enqueue failed");
                }
                let _ = reply.send(result);
            }
            Command::Status { reply } => {
                let _ = reply.send(queue.status().await);
            }
            Command::Alarm { deadline_ms } => handle_alarm(&name, &queue, deadline_ms).await,
        }
    }

    debug!(queue = %name, "Queue mailbox closed, actor exiting");
}

async fn handle_alarm(name: &str, queue: &Queue, deadline_ms: i64) {
    let timer = queue.storage().timer();
    if timer.deadline() != Some(deadline_ms) {
        debug!(queue = %name, deadline_ms, "Ignoring superseded alarm");
        return;
    }

    debug!(queue = %name, deadline_ms, "Alarm triggered, flushing");
    match queue.flush(now_ms()).await {
        Ok(flushed) => debug!(queue = %name, flushed, "Alarm flush complete"),
        Err(e) => {
            error!(queue = %name, error = %e, "Alarm flush failed");
            rearm_after_failed_flush(name, queue, deadline_ms).await;
        }
    }
}

/// Make sure a failed flush is retried. Sink failures already armed a newer
/// deadline; storage failures may leave a persisted alarm or pending items
/// with no timer behind them.
async fn rearm_after_failed_flush(name: &str, queue: &Queue, fired_ms: i64) {
    let storage = queue.storage();
    let timer = storage.timer();
    if matches!(timer.deadline(), Some(armed) if armed != fired_ms) {
        return;
    }

    let window_ms = i64::try_from(queue.window().as_millis()).unwrap_or(i64::MAX);
    let retry_at = now_ms().saturating_add(window_ms);

    let persisted = storage.get_alarm().await;
    let pending = storage.load_items().await.map(|items| items.len());
    match (persisted, pending) {
        (Ok(None), Ok(0)) => timer.cancel(),
        (Ok(None), Ok(_)) => {
            if let Err(e) = storage.set_alarm(retry_at).await {
                warn!(queue = %name, error = %e, "Failed to persist retry alarm");
                timer.schedule(retry_at);
            }
        }
        // Persisted alarm without a live timer, or storage still failing.
        _ => timer.schedule(retry_at),
    }
    debug!(queue = %name, deadline_ms = ?timer.deadline(), "Flush retry armed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pageview_queue::SinkError;

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl PageviewSink for RecordingSink {
        async fn deliver(&self, items: &[PendingItem]) -> std::result::Result<(), SinkError> {
            self.batches
                .lock()
                .push(items.iter().map(|i| i.url.clone()).collect());
            Ok(())
        }
    }

    /// Rejects the first `failures` deliveries, then records batches.
    struct FlakySink {
        failures: Mutex<usize>,
        attempts: Mutex<usize>,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl FlakySink {
        fn failing(failures: usize) -> Self {
            Self {
                failures: Mutex::new(failures),
                attempts: Mutex::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl PageviewSink for FlakySink {
        async fn deliver(&self, items: &[PendingItem]) -> std::result::Result<(), SinkError> {
            *self.attempts.lock() += 1;
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SinkError::new("analytics endpoint unavailable"));
            }
            self.batches
                .lock()
                .push(items.iter().map(|i| i.url.clone()).collect());
            Ok(())
        }
    }

    fn memory_operator() -> Operator {
        Operator::new(opendal::services::Memory::default())
            .expect("memory operator")
            .finish()
    }

    fn directory(op: Operator) -> (QueueDirectory, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let dir = QueueDirectory::with_sink(op, Duration::from_secs(10), sink.clone());
        (dir, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_flushed_together_after_window() {
        let (dir, sink) = directory(memory_operator());
        let queue = dir.resolve("default").unwrap();

        for url in ["/a", "/b", "/c"] {
            queue.enqueue(PendingItem::new(url, now_ms())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(3)).await;
        }
        assert_eq!(queue.status().await.unwrap().count, 3);
        assert!(sink.batches.lock().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(queue.status().await.unwrap().count, 0);
        assert_eq!(
            *sink.batches.lock(),
            vec![vec!["/a".to_string(), "/b".to_string(), "/c".to_string()]]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_items_after_flush_start_new_cycle() {
        let (dir, sink) = directory(memory_operator());
        let queue = dir.resolve("default").unwrap();

        queue.enqueue(PendingItem::new("/a", now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        queue.enqueue(PendingItem::new("/b", now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(sink.batches.lock().len(), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(
            *sink.batches.lock(),
            vec![vec!["/a".to_string()], vec!["/b".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_resolve_is_deterministic() {
        let (dir, _sink) = directory(memory_operator());

        let first = dir.resolve("site").unwrap();
        first.enqueue(PendingItem::new("/a", now_ms())).await.unwrap();

        let again = dir.resolve("site").unwrap();
        assert_eq!(again.status().await.unwrap().count, 1);

        let other = dir.resolve("other").unwrap();
        assert_eq!(other.status().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_resolve_rejects_path_like_names() {
        let (dir, _sink) = directory(memory_operator());
        assert!(dir.resolve("../escape").is_err());
        assert!(dir.resolve("").is_err());
    }

    #[tokio::test]
    async fn test_concurrent_enqueues_are_all_retained() {
        let (dir, _sink) = directory(memory_operator());
        let queue = dir.resolve("default").unwrap();

        let ts = now_ms();
        let mut tasks = Vec::new();
        for i in 0..20 {
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                queue
                    .enqueue(PendingItem::new(format!("/p/{}", i), ts))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(queue.status().await.unwrap().count, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_recovers_pending_flush() {
        let op = memory_operator();

        {
            let (before, _sink) = directory(op.clone());
            let queue = before.resolve("default").unwrap();
            queue
                .enqueue(PendingItem::new("/survivor", now_ms()))
                .await
                .unwrap();
        }

        let (after, sink) = directory(op);
        assert_eq!(after.recover().await.unwrap(), 1);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(*sink.batches.lock(), vec![vec!["/survivor".to_string()]]);
        let queue = after.resolve("default").unwrap();
        assert_eq!(queue.status().await.unwrap().count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_failure_is_retried_next_window() {
        let sink = Arc::new(FlakySink::failing(1));
        let dir = QueueDirectory::with_sink(memory_operator(), Duration::from_secs(10), sink.clone());
        let queue = dir.resolve("default").unwrap();

        queue.enqueue(PendingItem::new("/a", now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(*sink.attempts.lock(), 1);
        assert!(sink.batches.lock().is_empty());
        assert_eq!(queue.status().await.unwrap().count, 1);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(*sink.attempts.lock(), 2);
        assert_eq!(*sink.batches.lock(), vec![vec!["/a".to_string()]]);
        assert_eq!(queue.status().await.unwrap().count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leftover_alarm_after_flush_does_not_strand_queue() {
        let op = memory_operator();
        let (dir, sink) = directory(op.clone());
        let queue = dir.resolve("default").unwrap();

        queue.enqueue(PendingItem::new("/a", now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(sink.batches.lock().len(), 1);

        // Alarm file survives the flush, as when its delete failed.
        op.write(
            "queues/default/alarm.json",
            serde_json::to_vec(&serde_json::json!({ "deadline_ms": now_ms() - 1_000 })).unwrap(),
        )
        .await
        .unwrap();

        queue.enqueue(PendingItem::new("/b", now_ms())).await.unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        assert_eq!(
            *sink.batches.lock(),
            vec![vec!["/a".to_string()], vec!["/b".to_string()]]
        );
        assert_eq!(queue.status().await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_failed_flush_rearms_when_alarm_is_still_persisted() {
        let op = memory_operator();
        let (tx, _rx) = mpsc::channel(4);
        let storage = OpendalQueueStorage::new(op, "default", AlarmTimer::new(tx.downgrade()));
        let sink: SharedSink = Arc::new(RecordingSink::default());
        let queue = DebouncedQueue::new(storage, sink).with_window(Duration::from_secs(10));

        // Deadline fired, items were delivered and cleared, alarm file left behind.
        let fired = now_ms() - 1;
        queue.storage().set_alarm(fired).await.unwrap();

        let before = now_ms();
        rearm_after_failed_flush("default", &queue, fired).await;

        let armed = queue.storage().timer().deadline().unwrap();
        assert!(armed >= before + 10_000);
    }

    #[tokio::test]
    async fn test_failed_flush_with_nothing_left_disarms() {
        let (tx, _rx) = mpsc::channel(4);
        let storage =
            OpendalQueueStorage::new(memory_operator(), "default", AlarmTimer::new(tx.downgrade()));
        let sink: SharedSink = Arc::new(RecordingSink::default());
        let queue = DebouncedQueue::new(storage, sink);

        let fired = now_ms() - 1;
        queue.storage().timer().schedule(fired);
        rearm_after_failed_flush("default", &queue, fired).await;

        assert_eq!(queue.storage().timer().deadline(), None);
    }

    #[tokio::test]
    async fn test_status_does_not_start_actors() {
        let op = memory_operator();
        let (dir, _sink) = directory(op.clone());

        let status = dir.status("never-used").await.unwrap();
        assert_eq!(status.count, 0);
        assert!(dir.queues.lock().is_empty());

        // Persisted but not running: read from storage.
        op.write(
            "queues/parked/pageviewQueue.json",
            serde_json::to_vec(&vec![PendingItem::new("/p", 1)]).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(dir.status("parked").await.unwrap().count, 1);
        assert!(dir.queues.lock().is_empty());

        // Running queues answer through their actor.
        let queue = dir.resolve("default").unwrap();
        queue.enqueue(PendingItem::new("/a", now_ms())).await.unwrap();
        assert_eq!(dir.status("default").await.unwrap().count, 1);
        assert_eq!(dir.queues.lock().len(), 1);

        assert!(dir.status("../escape").await.is_err());
    }

    #[tokio::test]
    async fn test_recover_with_no_state() {
        let (dir, _sink) = directory(memory_operator());
        assert_eq!(dir.recover().await.unwrap(), 0);
    }
}

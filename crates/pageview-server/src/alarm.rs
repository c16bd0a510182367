//! Single-slot, one-shot alarm for native queues.
//!
//! Mirrors the Durable Object alarm: arming replaces any previous alarm, and
//! when the deadline passes the owning queue receives exactly one
//! `Command::Alarm` through its mailbox. The persisted deadline lives in
//! storage; this timer is the volatile half and is re-derived on restart.

use crate::directory::Command;
use crate::now_ms;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

struct ArmedAlarm {
    deadline_ms: i64,
    task: JoinHandle<()>,
}

pub(crate) struct AlarmTimer {
    // Weak so the timer never keeps its own queue's mailbox open.
    mailbox: mpsc::WeakSender<Command>,
    slot: Mutex<Option<ArmedAlarm>>,
}

impl AlarmTimer {
    pub(crate) fn new(mailbox: mpsc::WeakSender<Command>) -> Self {
        Self {
            mailbox,
            slot: Mutex::new(None),
        }
    }

    /// Arm for `deadline_ms`, replacing any armed alarm. Overdue deadlines
    /// fire immediately.
    pub(crate) fn schedule(&self, deadline_ms: i64) {
        let delay_ms = deadline_ms.saturating_sub(now_ms()).max(0) as u64;
        let mailbox = self.mailbox.clone();

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if let Some(tx) = mailbox.upgrade() {
                if tx.send(Command::Alarm { deadline_ms }).await.is_err() {
                    tracing::debug!(deadline_ms, "Queue mailbox closed before alarm fired");
                }
            }
        });

        let previous = self.slot.lock().replace(ArmedAlarm { deadline_ms, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
        tracing::trace!(deadline_ms, delay_ms, "Alarm timer armed");
    }

    pub(crate) fn cancel(&self) {
        if let Some(previous) = self.slot.lock().take() {
            previous.task.abort();
        }
    }

    /// Deadline of the most recently armed alarm, fired or not, until it is
    /// cancelled or replaced.
    pub(crate) fn deadline(&self) -> Option<i64> {
        self.slot.lock().as_ref().map(|armed| armed.deadline_ms)
    }
}

impl Drop for AlarmTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

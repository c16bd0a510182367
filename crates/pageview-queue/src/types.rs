//! Pure data structures shared by every runtime.

use serde::{Deserialize, Serialize};

/// One captured pageview. Immutable once created.
///
/// Serialized with camelCase keys so the persisted `pageviewQueue` value is
/// readable by any consumer of the same storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingItem {
    pub url: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
}

impl PendingItem {
    pub fn new(url: impl Into<String>, timestamp: i64) -> Self {
        Self {
            url: url.into(),
            timestamp,
            user_agent: None,
            referer: None,
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_referer(mut self, referer: impl Into<String>) -> Self {
        self.referer = Some(referer.into());
        self
    }
}

/// Response returned by `enqueue` and `status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub count: usize,
    pub message: String,
}

impl QueueStatus {
    pub(crate) fn queued(count: usize) -> Self {
        Self {
            count,
            message: format!("Pageview queued. {} pageview(s) waiting for flush.", count),
        }
    }

    /// Status for a queue holding `count` items.
    pub fn pending(count: usize) -> Self {
        let message = if count == 0 {
            "Queue is empty.".to_string()
        } else {
            format!("{} pageview(s) pending flush.", count)
        };
        Self { count, message }
    }
}

//! Debounced pageview batching queue.
//!
//! Pageviews are appended to a durable, ordered sequence. The first item of an
//! accumulation cycle arms a single one-shot deadline; when it elapses the host
//! runtime calls [`DebouncedQueue::flush`], which hands the whole batch to a
//! [`PageviewSink`] and resets the queue to empty.
//!
//! The crate is runtime-agnostic. Hosts supply a [`QueueStorage`] (Durable
//! Object storage on Cloudflare, an OpenDAL operator on the native server) and
//! serialize operations per queue identity.

pub mod error;
pub mod queue;
pub mod sink;
pub mod storage;
pub mod types;

pub use error::{QueueError, Result, SinkError};
pub use queue::{DebouncedQueue, DEFAULT_WINDOW};
pub use sink::{render_batch, LogSink, PageviewSink};
pub use storage::{MemoryStorage, QueueStorage, ITEMS_KEY};
pub use types::{PendingItem, QueueStatus};

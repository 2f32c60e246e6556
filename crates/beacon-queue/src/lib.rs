//! Event queues for the delivery pipeline.
//!
//! - [`DurableQueue`]: persistent store of not-yet-acknowledged events,
//!   keyed by `event_id`, with a JSON-lines file backend and an in-memory
//!   backend.
//! - [`RetryQueue`]: events that failed delivery and still have budget.
//! - [`PendingQueue`]: freshly logged events waiting for the next flush.

mod file;
mod memory;
mod pending;
mod retry;

use anyhow::Result;
use async_trait::async_trait;
use beacon_protocol::{Event, EventId};

pub use file::FileDurableQueue;
pub use memory::MemoryDurableQueue;
pub use pending::PendingQueue;
pub use retry::{RetryOutcome, RetryQueue};

/// Entries evicted at once when a full durable store takes a new id.
pub const EVICTION_BATCH: usize = 100;

/// Persistent store of undelivered events. Each call is one transaction.
#[async_trait]
pub trait DurableQueue: Send + Sync {
    /// Insert or replace the record for `event.event_id`. A replaced record
    /// keeps its original position.
    async fn push(&self, event: &Event) -> Result<()>;
    /// Up to `limit` records in insertion order, without removing them.
    async fn peek_batch(&self, limit: usize) -> Result<Vec<Event>>;
    /// Delete the given ids; unknown ids are ignored.
    async fn remove_keys(&self, ids: &[EventId]) -> Result<()>;
    async fn count(&self) -> Result<usize>;
    async fn clear(&self) -> Result<()>;
}

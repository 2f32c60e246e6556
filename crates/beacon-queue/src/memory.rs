use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Result, bail};
use async_trait::async_trait;
use beacon_protocol::{Event, EventId, StorageError};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::warn;

use crate::{DurableQueue, EVICTION_BATCH};

/// In-process durable queue. Clones share the same backing map, so a clone
/// stands in for "a new handle to the same store" across a simulated reload.
#[derive(Debug, Clone)]
pub struct MemoryDurableQueue {
    entries: Arc<Mutex<IndexMap<EventId, Event>>>,
    capacity: usize,
    available: Arc<AtomicBool>,
}

impl Default for MemoryDurableQueue {
    fn default() -> Self {
        Self::new(beacon_protocol::config::DEFAULT_DURABLE_CAPACITY)
    }
}

impl MemoryDurableQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(IndexMap::new())),
            capacity: capacity.max(1),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Toggle availability; an unavailable store fails every operation.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if !self.available.load(Ordering::SeqCst) {
            bail!(StorageError::Unavailable(
                "in-memory store switched off".to_owned()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableQueue for MemoryDurableQueue {
    async fn push(&self, event: &Event) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        if !entries.contains_key(&event.event_id) && entries.len() >= self.capacity {
            let evict = EVICTION_BATCH.min(entries.len());
            entries.drain(..evict);
            warn!(evicted = evict, capacity = self.capacity, "durable queue full, evicted oldest events");
        }
        entries.insert(event.event_id.clone(), event.clone());
        Ok(())
    }

    async fn peek_batch(&self, limit: usize) -> Result<Vec<Event>> {
        self.check_available()?;
        Ok(self.entries.lock().values().take(limit).cloned().collect())
    }

    async fn remove_keys(&self, ids: &[EventId]) -> Result<()> {
        self.check_available()?;
        let mut entries = self.entries.lock();
        for id in ids {
            entries.shift_remove(id);
        }
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        self.check_available()?;
        Ok(self.entries.lock().len())
    }

    async fn clear(&self) -> Result<()> {
        self.check_available()?;
        self.entries.lock().clear();
        Ok(())
    }
}

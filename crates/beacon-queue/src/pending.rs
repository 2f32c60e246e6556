use std::collections::{HashSet, VecDeque};

use beacon_protocol::{Event, EventId};
use parking_lot::Mutex;
use tracing::warn;

/// Freshly logged events waiting for the next flush. Bounded: once full the
/// oldest entry is evicted to make room.
#[derive(Debug)]
pub struct PendingQueue {
    entries: Mutex<VecDeque<Event>>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append an event and return the new queue length. Returns the evicted
    /// event, if any, alongside.
    pub fn push(&self, event: Event) -> (usize, Option<Event>) {
        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front()
        } else {
            None
        };
        if let Some(evicted) = &evicted {
            warn!(
                event_id = %evicted.event_id,
                capacity = self.capacity,
                "pending queue full, evicted oldest event"
            );
        }
        entries.push_back(event);
        (entries.len(), evicted)
    }

    pub fn take_front(&self, limit: usize) -> Vec<Event> {
        let mut entries = self.entries.lock();
        let count = limit.min(entries.len());
        entries.drain(..count).collect()
    }

    pub fn remove_ids(&self, ids: &HashSet<EventId>) -> Vec<Event> {
        if ids.is_empty() {
            return Vec::new();
        }
        let mut entries = self.entries.lock();
        let mut removed = Vec::new();
        entries.retain(|event| {
            if ids.contains(&event.event_id) {
                removed.push(event.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn restore_front(&self, events: Vec<Event>) {
        let mut entries = self.entries.lock();
        for event in events.into_iter().rev() {
            entries.push_front(event);
        }
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

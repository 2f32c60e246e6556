use std::collections::{HashSet, VecDeque};

use beacon_protocol::{Event, EventId};
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Requeued,
    /// The event hit the retry cap and is gone for good.
    Exhausted,
}

/// FIFO of events that failed delivery and still have retry budget.
#[derive(Debug)]
pub struct RetryQueue {
    entries: Mutex<VecDeque<Event>>,
    max_retries: u32,
}

impl RetryQueue {
    pub fn new(max_retries: u32) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Queue an event whose `retry_count` already reflects the failed
    /// attempt. A copy already waiting under the same id is replaced and
    /// the higher retry count is kept.
    pub fn requeue(&self, mut event: Event) -> RetryOutcome {
        if event.retry_count >= self.max_retries {
            debug!(
                event_id = %event.event_id,
                retry_count = event.retry_count,
                "retry budget exhausted"
            );
            return RetryOutcome::Exhausted;
        }

        let mut entries = self.entries.lock();
        if let Some(position) = entries
            .iter()
            .position(|queued| queued.event_id == event.event_id)
        {
            if let Some(previous) = entries.remove(position) {
                event.retry_count = event.retry_count.max(previous.retry_count);
            }
        }
        entries.push_back(event);
        RetryOutcome::Requeued
    }

    /// Pop up to `limit` events from the front.
    pub fn take_front(&self, limit: usize) -> Vec<Event> {
        let mut entries = self.entries.lock();
        let count = limit.min(entries.len());
        entries.drain(..count).collect()
    }

    /// Remove and return every queued copy of the given ids.
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

    /// Put events back at the front, preserving their order.
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{event, ids};

    fn failed(id: &str, retry_count: u32) -> Event {
        let mut event = event(id);
        event.retry_count = retry_count;
        event
    }

    #[test]
    fn events_under_the_cap_are_requeued_in_order() {
        let queue = RetryQueue::new(5);
        assert_eq!(queue.requeue(failed("a", 1)), RetryOutcome::Requeued);
        assert_eq!(queue.requeue(failed("b", 4)), RetryOutcome::Requeued);
        assert_eq!(ids(&queue.take_front(10)), vec!["a", "b"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn events_at_the_cap_are_exhausted() {
        let queue = RetryQueue::new(5);
        assert_eq!(queue.max_retries(), 5);
        assert_eq!(queue.requeue(failed("a", 4)), RetryOutcome::Requeued);
        queue.take_front(1);
        assert_eq!(
            queue.requeue(failed("a", queue.max_retries())),
            RetryOutcome::Exhausted
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn duplicate_ids_collapse_to_one_copy() {
        let queue = RetryQueue::new(5);
        queue.requeue(failed("a", 2));
        queue.requeue(failed("b", 1));
        queue.requeue(failed("a", 1));

        let entries = queue.snapshot();
        assert_eq!(ids(&entries), vec!["b", "a"]);
        assert_eq!(entries[1].retry_count, 2);
    }

    #[test]
    fn take_front_respects_the_limit() {
        let queue = RetryQueue::new(5);
        for id in ["a", "b", "c"] {
            queue.requeue(failed(id, 1));
        }
        assert_eq!(ids(&queue.take_front(2)), vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn remove_ids_pulls_matching_entries() {
        let queue = RetryQueue::new(5);
        for id in ["a", "b", "c"] {
            queue.requeue(failed(id, 1));
        }
        let wanted = HashSet::from([EventId::from_string("b")]);
        assert_eq!(ids(&queue.remove_ids(&wanted)), vec!["b"]);
        assert_eq!(ids(&queue.snapshot()), vec!["a", "c"]);
    }

    #[test]
    fn restore_front_keeps_order() {
        let queue = RetryQueue::new(5);
        queue.requeue(failed("c", 1));
        queue.restore_front(vec![failed("a", 1), failed("b", 1)]);
        assert_eq!(ids(&queue.snapshot()), vec!["a", "b", "c"]);
    }
}

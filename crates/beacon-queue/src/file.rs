use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use beacon_protocol::{Event, EventId, StorageError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::{DurableQueue, EVICTION_BATCH};

/// Dead journal records tolerated before a compaction is considered.
const COMPACT_MIN_DEAD_RECORDS: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum JournalRecord {
    Put { event: Event },
    Remove { ids: Vec<EventId> },
}

#[derive(Debug, Default)]
struct JournalState {
    entries: IndexMap<EventId, Event>,
    /// Journal lines that no longer describe a live entry.
    dead_records: usize,
    /// The journal ends without a newline; the next append must start one.
    torn_tail: bool,
}

/// Durable queue kept as an append-only JSON-lines journal of put/remove
/// records. The journal is replayed on first access and rewritten once dead
/// records outnumber live entries.
#[derive(Debug)]
pub struct FileDurableQueue {
    path: PathBuf,
    capacity: usize,
    state: Mutex<Option<JournalState>>,
}

impl FileDurableQueue {
    pub const FILE_NAME: &'static str = "events.jsonl";

    /// Queue rooted at `root`; the journal lives at `root/queue/events.jsonl`.
    pub fn new(root: impl AsRef<Path>, capacity: usize) -> Self {
        Self {
            path: root.as_ref().join("queue").join(Self::FILE_NAME),
            capacity: capacity.max(1),
            state: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(|error| {
                StorageError::Io(format!("failed to create queue dir {parent:?}: {error}"))
            })?;
        }
        Ok(())
    }

    async fn replay(path: &Path) -> Result<JournalState> {
        let mut state = JournalState::default();
        if !fs::try_exists(path).await.unwrap_or(false) {
            return Ok(state);
        }

        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .map_err(|error| StorageError::Io(format!("failed opening queue journal {path:?}: {error}")))?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut line_number = 0_usize;
        let mut records = 0_usize;

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .await
                .map_err(|error| StorageError::Io(format!("failed reading queue journal {path:?}: {error}")))?;
            if read == 0 {
                break;
            }
            line_number += 1;
            // A crash mid-append leaves a last line with no terminator.
            state.torn_tail = line.last() != Some(&b'\n');

            let body = line.trim_ascii();
            if body.is_empty() {
                continue;
            }
            records += 1;
            match serde_json::from_slice::<JournalRecord>(body) {
                Ok(JournalRecord::Put { event }) => {
                    state.entries.insert(event.event_id.clone(), event);
                }
                Ok(JournalRecord::Remove { ids }) => {
                    for id in &ids {
                        state.entries.shift_remove(id);
                    }
                }
                Err(error) => {
                    let error = StorageError::Corrupt(format!("line {line_number}: {error}"));
                    warn!(path = ?path, %error, "skipping unreadable queue journal line");
                }
            }
        }

        state.dead_records = records.saturating_sub(state.entries.len());
        debug!(
            live = state.entries.len(),
            dead = state.dead_records,
            torn_tail = state.torn_tail,
            "queue journal replayed"
        );
        Ok(state)
    }

    async fn append(&self, state: &mut JournalState, records: &[JournalRecord]) -> Result<()> {
        Self::ensure_parent(&self.path).await?;
        let mut buffer = String::new();
        if state.torn_tail {
            buffer.push('\n');
        }
        for record in records {
            buffer.push_str(&serde_json::to_string(record).context("failed serializing journal record")?);
            buffer.push('\n');
        }

        let io_error = |error: std::io::Error| {
            StorageError::Io(format!("failed appending to queue journal {:?}: {error}", self.path))
        };
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(io_error)?;
        file.write_all(buffer.as_bytes()).await.map_err(io_error)?;
        file.flush().await.map_err(io_error)?;
        state.torn_tail = false;
        Ok(())
    }

    /// Rewrite the journal with one put record per live entry.
    async fn compact(&self, state: &mut JournalState) -> Result<()> {
        Self::ensure_parent(&self.path).await?;
        let mut buffer = String::new();
        for event in state.entries.values() {
            let record = JournalRecord::Put {
                event: event.clone(),
            };
            buffer.push_str(&serde_json::to_string(&record)?);
            buffer.push('\n');
        }

        let staging = self.path.with_extension("jsonl.tmp");
        fs::write(&staging, buffer)
            .await
            .with_context(|| format!("failed writing compacted journal {staging:?}"))?;
        fs::rename(&staging, &self.path)
            .await
            .with_context(|| format!("failed replacing queue journal {:?}", self.path))?;

        debug!(
            live = state.entries.len(),
            reclaimed = state.dead_records,
            "queue journal compacted"
        );
        state.dead_records = 0;
        state.torn_tail = false;
        Ok(())
    }

    async fn maybe_compact(&self, state: &mut JournalState) {
        if state.dead_records < COMPACT_MIN_DEAD_RECORDS
            || state.dead_records <= state.entries.len()
        {
            return;
        }
        if let Err(error) = self.compact(state).await {
            warn!(error = %format!("{error:#}"), "queue journal compaction failed");
        }
    }

    async fn loaded<'a>(
        &self,
        guard: &'a mut Option<JournalState>,
    ) -> Result<&'a mut JournalState> {
        if guard.is_none() {
            *guard = Some(Self::replay(&self.path).await?);
        }
        guard
            .as_mut()
            .context("queue journal state missing after replay")
    }
}

#[async_trait]
impl DurableQueue for FileDurableQueue {
    #[instrument(skip(self, event), fields(event_id = %event.event_id))]
    async fn push(&self, event: &Event) -> Result<()> {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await?;

        let mut records = Vec::with_capacity(2);
        let mut evicted = Vec::new();
        let replacing = state.entries.contains_key(&event.event_id);
        if !replacing && state.entries.len() >= self.capacity {
            evicted = state
                .entries
                .keys()
                .take(EVICTION_BATCH.min(state.entries.len()))
                .cloned()
                .collect::<Vec<_>>();
            records.push(JournalRecord::Remove {
                ids: evicted.clone(),
            });
        }
        records.push(JournalRecord::Put {
            event: event.clone(),
        });

        self.append(state, &records).await?;

        if !evicted.is_empty() {
            warn!(
                evicted = evicted.len(),
                capacity = self.capacity,
                "durable queue full, evicted oldest events"
            );
            for id in &evicted {
                state.entries.shift_remove(id);
            }
            state.dead_records += evicted.len() * 2;
        }
        if replacing {
            state.dead_records += 1;
        }
        state.entries.insert(event.event_id.clone(), event.clone());
        self.maybe_compact(state).await;
        Ok(())
    }

    async fn peek_batch(&self, limit: usize) -> Result<Vec<Event>> {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await?;
        Ok(state.entries.values().take(limit).cloned().collect())
    }

    #[instrument(skip(self, ids), fields(requested = ids.len()))]
    async fn remove_keys(&self, ids: &[EventId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await?;

        let present = ids
            .iter()
            .filter(|id| state.entries.contains_key(*id))
            .cloned()
            .collect::<Vec<_>>();
        if present.is_empty() {
            return Ok(());
        }

        let record = JournalRecord::Remove {
            ids: present.clone(),
        };
        self.append(state, &[record]).await?;
        for id in &present {
            state.entries.shift_remove(id);
        }
        // The put records of removed entries plus the remove record itself.
        state.dead_records += present.len() + 1;
        debug!(removed = present.len(), "events removed from durable queue");
        self.maybe_compact(state).await;
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        let mut guard = self.state.lock().await;
        let state = self.loaded(&mut guard).await?;
        Ok(state.entries.len())
    }

    async fn clear(&self) -> Result<()> {
        let mut guard = self.state.lock().await;
        Self::ensure_parent(&self.path).await?;
        fs::write(&self.path, b"")
            .await
            .with_context(|| format!("failed truncating queue journal {:?}", self.path))?;
        *guard = Some(JournalState::default());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use beacon_protocol::EventId;
    use tokio::fs;

    use super::*;
    use crate::test_support::{event, ids};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    #[tokio::test]
    async fn pushed_event_survives_reload() -> Result<()> {
        let root = unique_test_root("beacon-queue-reload");
        let queue = FileDurableQueue::new(&root, 100);
        queue.push(&event("ev-1")).await?;
        drop(queue);

        let reopened = FileDurableQueue::new(&root, 100);
        let batch = reopened.peek_batch(10).await?;
        assert_eq!(ids(&batch), vec!["ev-1"]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn push_is_an_idempotent_upsert() -> Result<()> {
        let root = unique_test_root("beacon-queue-upsert");
        let queue = FileDurableQueue::new(&root, 100);
        queue.push(&event("ev-1")).await?;
        queue.push(&event("ev-2")).await?;

        let mut retried = event("ev-1");
        retried.retry_count = 3;
        queue.push(&retried).await?;

        let batch = queue.peek_batch(10).await?;
        assert_eq!(ids(&batch), vec!["ev-1", "ev-2"]);
        assert_eq!(batch[0].retry_count, 3);

        let reopened = FileDurableQueue::new(&root, 100);
        let batch = reopened.peek_batch(10).await?;
        assert_eq!(batch[0].retry_count, 3);
        assert_eq!(reopened.count().await?, 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn peek_is_stable_and_non_destructive() -> Result<()> {
        let root = unique_test_root("beacon-queue-peek");
        let queue = FileDurableQueue::new(&root, 100);
        for i in 0..5 {
            queue.push(&event(&format!("ev-{i}"))).await?;
        }

        let first = queue.peek_batch(3).await?;
        let second = queue.peek_batch(3).await?;
        assert_eq!(ids(&first), vec!["ev-0", "ev-1", "ev-2"]);
        assert_eq!(ids(&first), ids(&second));
        assert_eq!(queue.count().await?, 5);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn remove_keys_ignores_unknown_ids() -> Result<()> {
        let root = unique_test_root("beacon-queue-remove");
        let queue = FileDurableQueue::new(&root, 100);
        queue.push(&event("ev-1")).await?;
        queue.push(&event("ev-2")).await?;

        queue
            .remove_keys(&[EventId::from_string("ev-1"), EventId::from_string("missing")])
            .await?;
        assert_eq!(ids(&queue.peek_batch(10).await?), vec!["ev-2"]);

        let reopened = FileDurableQueue::new(&root, 100);
        assert_eq!(ids(&reopened.peek_batch(10).await?), vec!["ev-2"]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn full_store_evicts_oldest_entries() -> Result<()> {
        let root = unique_test_root("beacon-queue-evict");
        let capacity = EVICTION_BATCH + 10;
        let queue = FileDurableQueue::new(&root, capacity);
        for i in 0..capacity {
            queue.push(&event(&format!("ev-{i}"))).await?;
        }
        queue.push(&event("newest")).await?;

        assert_eq!(queue.count().await?, 11);
        let batch = queue.peek_batch(1).await?;
        assert_eq!(ids(&batch), vec![format!("ev-{EVICTION_BATCH}").as_str()]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unreadable_lines_are_skipped_on_replay() -> Result<()> {
        let root = unique_test_root("beacon-queue-corrupt");
        let queue = FileDurableQueue::new(&root, 100);
        queue.push(&event("ev-1")).await?;
        let path = queue.path().to_path_buf();
        drop(queue);

        let mut raw = fs::read_to_string(&path).await?;
        raw.push_str("{\"op\":\"put\",\"event\":{truncated\n");
        fs::write(&path, raw).await?;

        let reopened = FileDurableQueue::new(&root, 100);
        assert_eq!(ids(&reopened.peek_batch(10).await?), vec!["ev-1"]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    async fn append_raw(path: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new().append(true).open(path).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        Ok(())
    }

    #[tokio::test]
    async fn push_after_a_torn_tail_survives_reload() -> Result<()> {
        let root = unique_test_root("beacon-queue-torn-tail");
        let queue = FileDurableQueue::new(&root, 100);
        queue.push(&event("ev-1")).await?;
        let path = queue.path().to_path_buf();
        drop(queue);

        append_raw(&path, b"{\"op\":\"put\",\"event\":{\"event_id\":\"ev-x\"").await?;

        let reopened = FileDurableQueue::new(&root, 100);
        assert_eq!(ids(&reopened.peek_batch(10).await?), vec!["ev-1"]);
        reopened.push(&event("ev-2")).await?;
        drop(reopened);

        let again = FileDurableQueue::new(&root, 100);
        assert_eq!(ids(&again.peek_batch(10).await?), vec!["ev-1", "ev-2"]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn invalid_utf8_lines_are_skipped_on_replay() -> Result<()> {
        let root = unique_test_root("beacon-queue-bad-bytes");
        let queue = FileDurableQueue::new(&root, 100);
        queue.push(&event("ev-1")).await?;
        let path = queue.path().to_path_buf();
        drop(queue);

        append_raw(&path, b"\xff\xfe garbage\n").await?;

        let reopened = FileDurableQueue::new(&root, 100);
        assert_eq!(ids(&reopened.peek_batch(10).await?), vec!["ev-1"]);
        reopened.push(&event("ev-2")).await?;
        assert_eq!(reopened.count().await?, 2);
        drop(reopened);

        let again = FileDurableQueue::new(&root, 100);
        assert_eq!(ids(&again.peek_batch(10).await?), vec!["ev-1", "ev-2"]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unwritable_root_reports_a_storage_io_error() -> Result<()> {
        let root = unique_test_root("beacon-queue-unwritable");
        // A regular file where the directory should be.
        fs::write(&root, b"not a directory").await?;
        let queue = FileDurableQueue::new(&root, 100);

        let error = queue.push(&event("ev-1")).await.unwrap_err();
        assert!(matches!(
            error.downcast_ref::<StorageError>(),
            Some(StorageError::Io(_))
        ));

        let _ = fs::remove_file(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn compaction_keeps_live_entries() -> Result<()> {
        let root = unique_test_root("beacon-queue-compact");
        let queue = FileDurableQueue::new(&root, 10_000);
        for i in 0..(COMPACT_MIN_DEAD_RECORDS + 20) {
            let id = format!("ev-{i}");
            queue.push(&event(&id)).await?;
            if i % 10 != 0 {
                queue.remove_keys(&[EventId::from_string(id)]).await?;
            }
        }

        let live = queue.count().await?;
        let reopened = FileDurableQueue::new(&root, 10_000);
        assert_eq!(reopened.count().await?, live);
        let raw = fs::read_to_string(reopened.path()).await?;
        assert!(raw.lines().count() < COMPACT_MIN_DEAD_RECORDS * 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn clear_drops_everything() -> Result<()> {
        let root = unique_test_root("beacon-queue-clear");
        let queue = FileDurableQueue::new(&root, 100);
        queue.push(&event("ev-1")).await?;
        queue.clear().await?;
        assert_eq!(queue.count().await?, 0);
        assert_eq!(FileDurableQueue::new(&root, 100).count().await?, 0);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}

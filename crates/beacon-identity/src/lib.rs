use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use beacon_protocol::{AnonymousId, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Issues the correlation ids stamped on every event.
///
/// Ids are created lazily on first read and never change afterwards, except
/// that a missing value is replaced.
pub trait IdentityStore: Send + Sync {
    fn session_id(&self) -> SessionId;
    fn anonymous_id(&self) -> AnonymousId;
    /// Forget the session id so the next read starts a new session. The
    /// anonymous id survives.
    fn clear_session(&self);
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct IdentityRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_id: Option<SessionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    anonymous_id: Option<AnonymousId>,
}

impl IdentityRecord {
    fn fill_from(&mut self, other: IdentityRecord) {
        if self.session_id.is_none() {
            self.session_id = other.session_id;
        }
        if self.anonymous_id.is_none() {
            self.anonymous_id = other.anonymous_id;
        }
    }
}

/// Identity record kept in a small JSON file (`identity.json`).
///
/// When the file cannot be read or written the store runs degraded: every
/// read hands out a fresh, unpersisted id. The file is not touched again
/// until the retry backoff has passed, so degraded reads stay off the disk.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    cached: Mutex<IdentityRecord>,
    degraded: AtomicBool,
    retry_backoff: Duration,
    retry_after: Mutex<Option<Instant>>,
}

impl FileIdentityStore {
    pub const FILE_NAME: &'static str = "identity.json";
    pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(30);

    /// Store rooted at `root`; the record lives at `root/identity.json`.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self::at_path(root.as_ref().join(Self::FILE_NAME))
    }

    pub fn at_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: Mutex::new(IdentityRecord::default()),
            degraded: AtomicBool::new(false),
            retry_backoff: Self::DEFAULT_RETRY_BACKOFF,
            retry_after: Mutex::new(None),
        }
    }

    /// How long a storage failure keeps the store away from the file.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the last storage access failed.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    fn load(&self) -> Result<IdentityRecord> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Ok(IdentityRecord::default());
            }
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed reading identity file {:?}", self.path));
            }
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(record),
            Err(error) => {
                warn!(path = ?self.path, %error, "identity file is corrupt, replacing it");
                Ok(IdentityRecord::default())
            }
        }
    }

    fn persist(&self, record: &IdentityRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create identity dir {parent:?}"))?;
        }
        let payload = serde_json::to_string_pretty(record)?;
        let staging = self.path.with_extension("json.tmp");
        std::fs::write(&staging, payload)
            .with_context(|| format!("failed writing identity file {staging:?}"))?;
        std::fs::rename(&staging, &self.path)
            .with_context(|| format!("failed replacing identity file {:?}", self.path))?;
        Ok(())
    }

    fn backing_off(&self) -> bool {
        matches!(*self.retry_after.lock(), Some(until) if Instant::now() < until)
    }

    fn note_failure(&self, error: &anyhow::Error) {
        *self.retry_after.lock() = Some(Instant::now() + self.retry_backoff);
        if !self.degraded.swap(true, Ordering::Relaxed) {
            warn!(
                path = ?self.path,
                error = %format!("{error:#}"),
                "identity storage unavailable, issuing unpersisted ids"
            );
        }
    }

    fn note_success(&self) {
        *self.retry_after.lock() = None;
        if self.degraded.swap(false, Ordering::Relaxed) {
            debug!(path = ?self.path, "identity storage recovered");
        }
    }

    /// Shared read path: cached value, then the file, then a freshly
    /// generated id that is persisted before it is cached.
    fn get_or_create<T: Clone>(
        &self,
        get: impl Fn(&IdentityRecord) -> Option<T>,
        set: impl Fn(&mut IdentityRecord, T),
        generate: impl Fn() -> T,
    ) -> T {
        let mut cached = self.cached.lock();
        if let Some(value) = get(&*cached) {
            return value;
        }
        if self.backing_off() {
            return generate();
        }

        let mut record = match self.load() {
            Ok(record) => record,
            Err(error) => {
                self.note_failure(&error);
                return generate();
            }
        };
        record.fill_from(cached.clone());
        if let Some(value) = get(&record) {
            *cached = record;
            self.note_success();
            return value;
        }

        let value = generate();
        set(&mut record, value.clone());
        match self.persist(&record) {
            Ok(()) => {
                *cached = record;
                self.note_success();
            }
            Err(error) => self.note_failure(&error),
        }
        value
    }
}

impl IdentityStore for FileIdentityStore {
    fn session_id(&self) -> SessionId {
        self.get_or_create(
            |record| record.session_id.clone(),
            |record, id| record.session_id = Some(id),
            SessionId::generate,
        )
    }

    fn anonymous_id(&self) -> AnonymousId {
        self.get_or_create(
            |record| record.anonymous_id.clone(),
            |record, id| record.anonymous_id = Some(id),
            AnonymousId::generate,
        )
    }

    fn clear_session(&self) {
        let mut cached = self.cached.lock();
        cached.session_id = None;
        if self.backing_off() {
            return;
        }
        let mut record = match self.load() {
            Ok(record) => record,
            Err(error) => {
                self.note_failure(&error);
                return;
            }
        };
        record.session_id = None;
        if let Err(error) = self.persist(&record) {
            self.note_failure(&error);
        }
    }
}

/// Process-local identity, for tests and hosts without writable storage.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    record: Mutex<IdentityRecord>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from known ids.
    pub fn with_ids(session_id: SessionId, anonymous_id: AnonymousId) -> Self {
        Self {
            record: Mutex::new(IdentityRecord {
                session_id: Some(session_id),
                anonymous_id: Some(anonymous_id),
            }),
        }
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn session_id(&self) -> SessionId {
        self.record
            .lock()
            .session_id
            .get_or_insert_with(SessionId::generate)
            .clone()
    }

    fn anonymous_id(&self) -> AnonymousId {
        self.record
            .lock()
            .anonymous_id
            .get_or_insert_with(AnonymousId::generate)
            .clone()
    }

    fn clear_session(&self) {
        self.record.lock().session_id = None;
    }
}

//! Runtime boundary ports for the delivery pipeline.
//!
//! These traits are the seams between the scheduler and the host: how a
//! batch leaves the process, what time it is, and what the host looks like.
//!
//! Object-safety note:
//! - Traits use `async-trait` for async dyn-dispatch.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::TransportError;
use crate::event::{DeviceSnapshot, Event, NetworkSnapshot};

/// Moves a batch to the ingest endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver the whole batch or fail as a whole. Implementations bound the
    /// call with their own deadline.
    async fn send(&self, batch: &[Event]) -> Result<(), TransportError>;

    /// Fire-and-forget handoff used at teardown. Returns whether the
    /// underlying runtime accepted the request; delivery is never confirmed.
    fn send_beacon(&self, batch: &[Event]) -> bool;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Reads the ambient environment at normalization time.
pub trait EnvironmentProvider: Send + Sync {
    fn device(&self) -> DeviceSnapshot;
    fn network(&self) -> NetworkSnapshot;
}

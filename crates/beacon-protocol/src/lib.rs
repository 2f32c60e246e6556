//! # beacon-protocol: shared telemetry contract
//!
//! Types every beacon crate agrees on: the canonical [`Event`], the partial
//! [`RawEvent`] producers hand in, the pipeline configuration, the error
//! taxonomy, and the runtime ports (transport, clock, environment).
//!
//! The crate carries no runtime dependencies (no tokio, no HTTP client) so
//! producers can depend on it without pulling in the delivery machinery.
//!
//! ## Module Overview
//!
//! - [`ids`]: Typed ID wrappers (EventId, SessionId, AnonymousId, UserId)
//! - [`event`]: Event, RawEvent, EventCategory, device/network snapshots
//! - [`config`]: PipelineConfig and its defaults
//! - [`ports`]: Transport, Clock, EnvironmentProvider
//! - [`error`]: StorageError, TransportError, ConfigError

pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod ports;

pub use config::{DEFAULT_MAX_RETRIES, PipelineConfig};
pub use error::{ConfigError, StorageError, TransportError};
pub use event::{
    DeviceSnapshot, EVENT_VERSION, Event, EventCategory, NetworkSnapshot, PROTECTED_FIELDS,
    RawEvent,
};
pub use ids::{AnonymousId, EventId, SessionId, UserId};
pub use ports::{Clock, EnvironmentProvider, SystemClock, Transport};

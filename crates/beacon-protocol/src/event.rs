//! Canonical telemetry event types.
//!
//! [`RawEvent`] is what producers hand to the pipeline: every field optional,
//! plus a free-form field bag. [`Event`] is the normalized, self-describing
//! record that is queued, persisted and sent over the wire. On the wire the
//! free-form payload is flattened into the event object, so an ingest server
//! sees one flat JSON object per event.

use crate::ids::*;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Schema version stamped on events that do not bring their own.
pub const EVENT_VERSION: u32 = 1;

/// Keys a producer may never set through the free-form payload. Identity,
/// timestamp and delivery bookkeeping belong to the pipeline.
pub const PROTECTED_FIELDS: &[&str] = &[
    "event_id",
    "event_version",
    "event_type",
    "category",
    "action",
    "description",
    "session_id",
    "anonymous_id",
    "user_id",
    "timestamp_client",
    "device",
    "network",
    "retry_count",
];

/// Event classification. Unknown categories are kept verbatim in `Custom`
/// so records written by newer producers still round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventCategory {
    /// User behaviour (clicks, scrolls, page views). Subject to sampling.
    Interaction,
    System,
    Infra,
    Security,
    Performance,
    Custom(String),
}

impl EventCategory {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Interaction => "interaction",
            Self::System => "system",
            Self::Infra => "infra",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::Custom(other) => other,
        }
    }
}

impl From<String> for EventCategory {
    fn from(value: String) -> Self {
        match value.as_str() {
            "interaction" => Self::Interaction,
            "system" => Self::System,
            "infra" => Self::Infra,
            "security" => Self::Security,
            "performance" => Self::Performance,
            _ => Self::Custom(value),
        }
    }
}

impl From<&str> for EventCategory {
    fn from(value: &str) -> Self {
        Self::from(value.to_owned())
    }
}

impl From<EventCategory> for String {
    fn from(value: EventCategory) -> Self {
        match value {
            EventCategory::Custom(other) => other,
            known => known.as_str().to_owned(),
        }
    }
}

/// Point-in-time facts about the host the event was captured on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_offset_minutes: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    /// Producer-supplied extras.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl DeviceSnapshot {
    /// Layer `self` (the live snapshot) over `base`: live values win, base
    /// fills the gaps.
    pub fn overlay(self, base: Self) -> Self {
        let mut extra = base.extra;
        extra.extend(self.extra);
        Self {
            platform: self.platform.or(base.platform),
            arch: self.arch.or(base.arch),
            language: self.language.or(base.language),
            timezone_offset_minutes: self.timezone_offset_minutes.or(base.timezone_offset_minutes),
            user_agent: self.user_agent.or(base.user_agent),
            app_name: self.app_name.or(base.app_name),
            app_version: self.app_version.or(base.app_version),
            environment: self.environment.or(base.environment),
            extra,
        }
    }
}

/// Point-in-time facts about connectivity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetworkSnapshot {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub downlink_mbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub save_data: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl NetworkSnapshot {
    pub fn overlay(self, base: Self) -> Self {
        let mut extra = base.extra;
        extra.extend(self.extra);
        Self {
            online: self.online.or(base.online),
            connection_type: self.connection_type.or(base.connection_type),
            effective_type: self.effective_type.or(base.effective_type),
            downlink_mbps: self.downlink_mbps.or(base.downlink_mbps),
            rtt_ms: self.rtt_ms.or(base.rtt_ms),
            save_data: self.save_data.or(base.save_data),
            extra,
        }
    }
}

fn missing_event_id() -> EventId {
    EventId::from_string(String::new())
}

fn default_event_version() -> u32 {
    EVENT_VERSION
}

/// The normalized unit of telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Blank only for malformed records read back from storage; such records
    /// are discarded before transmission.
    #[serde(default = "missing_event_id")]
    pub event_id: EventId,
    #[serde(default = "default_event_version")]
    pub event_version: u32,
    pub event_type: String,
    pub category: EventCategory,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub session_id: SessionId,
    pub anonymous_id: AnonymousId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    pub timestamp_client: DateTime<Utc>,
    #[serde(default)]
    pub device: DeviceSnapshot,
    #[serde(default)]
    pub network: NetworkSnapshot,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Event {
    /// An event can be sent when it carries a usable idempotency key.
    pub fn is_well_formed(&self) -> bool {
        !self.event_id.is_blank()
    }

    /// Record one more failed delivery attempt and return the new count.
    pub fn record_failed_attempt(&mut self) -> u32 {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count
    }
}

/// A partially filled event as handed in by a producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_version: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<EventCategory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkSnapshot>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl RawEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: Some(event_type.into()),
            ..Self::default()
        }
    }

    pub fn with_category(mut self, category: impl Into<EventCategory>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_event_id(mut self, event_id: impl Into<EventId>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }
}

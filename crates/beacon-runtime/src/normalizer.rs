use std::sync::Arc;

use beacon_identity::IdentityStore;
use beacon_protocol::{
    Clock, EVENT_VERSION, EnvironmentProvider, Event, EventCategory, EventId, PROTECTED_FIELDS,
    RawEvent, UserId,
};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tracing::debug;

pub const DEFAULT_EVENT_TYPE: &str = "CUSTOM";
pub const DEFAULT_ACTION: &str = "log";
const TRUNCATION_MARKER: &str = "...";

/// Turns producer input into canonical events.
///
/// Identity and timestamp always come from the pipeline; producer fields
/// under those names are stripped. Everything else the producer supplies
/// wins over the computed defaults.
pub struct Normalizer {
    clock: Arc<dyn Clock>,
    identity: Arc<dyn IdentityStore>,
    environment: Arc<dyn EnvironmentProvider>,
    max_text_length: usize,
    user: RwLock<Option<UserId>>,
}

impl Normalizer {
    pub fn new(
        clock: Arc<dyn Clock>,
        identity: Arc<dyn IdentityStore>,
        environment: Arc<dyn EnvironmentProvider>,
        max_text_length: usize,
    ) -> Self {
        Self {
            clock,
            identity,
            environment,
            max_text_length,
            user: RwLock::new(None),
        }
    }

    /// Attach a user id to every event normalized from now on.
    pub fn set_user(&self, user: Option<UserId>) {
        *self.user.write() = user.filter(|user| !user.is_blank());
    }

    pub fn user(&self) -> Option<UserId> {
        self.user.read().clone()
    }

    pub fn identity(&self) -> &Arc<dyn IdentityStore> {
        &self.identity
    }

    pub fn normalize(&self, raw: RawEvent) -> Event {
        let RawEvent {
            event_id,
            event_version,
            event_type,
            category,
            action,
            description,
            user_id,
            device,
            network,
            fields,
        } = raw;

        let event_id = event_id
            .filter(|id| !id.is_blank())
            .unwrap_or_else(EventId::new_uuid);

        Event {
            event_id,
            event_version: event_version.unwrap_or(EVENT_VERSION),
            event_type: non_blank(event_type).unwrap_or_else(|| DEFAULT_EVENT_TYPE.to_owned()),
            category: category.unwrap_or(EventCategory::System),
            action: non_blank(action).unwrap_or_else(|| DEFAULT_ACTION.to_owned()),
            description,
            session_id: self.identity.session_id(),
            anonymous_id: self.identity.anonymous_id(),
            user_id: user_id.filter(|id| !id.is_blank()).or_else(|| self.user()),
            timestamp_client: self.clock.now(),
            device: self
                .environment
                .device()
                .overlay(device.unwrap_or_default()),
            network: self
                .environment
                .network()
                .overlay(network.unwrap_or_default()),
            retry_count: 0,
            payload: self.clean_payload(fields),
        }
    }

    fn clean_payload(&self, fields: Map<String, Value>) -> Map<String, Value> {
        let mut payload = Map::with_capacity(fields.len());
        for (key, value) in fields {
            if PROTECTED_FIELDS.contains(&key.as_str()) {
                debug!(field = %key, "dropping protected payload field");
                continue;
            }
            let value = match value {
                Value::String(text) => Value::String(truncate(text, self.max_text_length)),
                other => other,
            };
            payload.insert(key, value);
        }
        payload
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn truncate(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => {
            let mut short = text[..cut].to_owned();
            short.push_str(TRUNCATION_MARKER);
            short
        }
        None => text,
    }
}

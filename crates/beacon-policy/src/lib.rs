use beacon_protocol::{Event, EventCategory};
use indexmap::IndexMap;
use tracing::trace;

const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
const FNV_PRIME: u32 = 0x0100_0193;
const UNIT_SCALE: f64 = 4_294_967_296.0;

/// FNV-1a over the UTF-16 code units of `key`, scaled into `[0, 1)`.
///
/// Hashing UTF-16 units keeps decisions identical to browser-side loggers
/// that hash `charCodeAt` values, so one session samples the same way on
/// every client.
pub fn hash_unit(key: &str) -> f64 {
    let hash = key.encode_utf16().fold(FNV_OFFSET_BASIS, |hash, unit| {
        (hash ^ u32::from(unit)).wrapping_mul(FNV_PRIME)
    });
    f64::from(hash) / UNIT_SCALE
}

/// Deterministic keep/drop decision for `key` at `rate`.
///
/// An empty key gets a random stand-in, which makes that one decision
/// non-deterministic.
pub fn should_sample(key: &str, rate: f64) -> bool {
    if rate.is_nan() || rate <= 0.0 {
        return false;
    }
    if rate >= 1.0 {
        return true;
    }
    if key.is_empty() {
        let substitute = uuid::Uuid::new_v4().to_string();
        return hash_unit(&substitute) < rate;
    }
    hash_unit(key) < rate
}

/// Outcome of running an event through a sampling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplingDecision {
    Keep,
    Drop,
    /// The category is not subject to sampling.
    Bypass,
}

impl SamplingDecision {
    pub fn is_kept(self) -> bool {
        !matches!(self, Self::Drop)
    }
}

pub trait SamplingPolicy: Send + Sync {
    fn decide(&self, event: &Event) -> SamplingDecision;
}

/// Per-category rates; categories without a rate always pass.
///
/// The sampling key is the event's session id, falling back to the
/// anonymous id, so a whole session is either in or out.
#[derive(Debug, Clone, Default)]
pub struct CategorySampler {
    rates: IndexMap<EventCategory, f64>,
}

impl CategorySampler {
    /// The default policy: only `interaction` events are sampled.
    pub fn interaction_only(rate: f64) -> Self {
        Self::default().with_rate(EventCategory::Interaction, rate)
    }

    pub fn with_rate(mut self, category: EventCategory, rate: f64) -> Self {
        self.rates.insert(category, rate);
        self
    }

    pub fn rate_for(&self, category: &EventCategory) -> Option<f64> {
        self.rates.get(category).copied()
    }

    fn sampling_key(event: &Event) -> &str {
        if !event.session_id.is_blank() {
            event.session_id.as_str()
        } else if !event.anonymous_id.is_blank() {
            event.anonymous_id.as_str()
        } else {
            ""
        }
    }
}

impl SamplingPolicy for CategorySampler {
    fn decide(&self, event: &Event) -> SamplingDecision {
        let Some(rate) = self.rate_for(&event.category) else {
            return SamplingDecision::Bypass;
        };
        let key = Self::sampling_key(event);
        let decision = if should_sample(key, rate) {
            SamplingDecision::Keep
        } else {
            SamplingDecision::Drop
        };
        trace!(
            event_id = %event.event_id,
            category = event.category.as_str(),
            rate,
            ?decision,
            "sampling decision"
        );
        decision
    }
}

//! Pipeline configuration.
//!
//! Keys are camelCase on the wire so a host can reuse the same JSON document
//! it hands to browser-side loggers. Every key is optional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8080/api/logs/ingest";
pub const DEFAULT_BATCH_SIZE: usize = 25;
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 2_000;
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_INTERACTION_SAMPLE_RATE: f64 = 0.02;
/// Delivery attempts before an event is dropped for good.
pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 500;
pub const DEFAULT_DURABLE_CAPACITY: usize = 5_000;
pub const DEFAULT_MAX_TEXT_LENGTH: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    pub endpoint: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub enable_offline_persist: bool,
    pub interaction_sample_rate: f64,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub max_queue_size: usize,
    pub durable_capacity: usize,
    pub max_text_length: usize,
    pub app_name: String,
    pub app_version: String,
    pub environment: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_owned(),
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            enable_offline_persist: true,
            interaction_sample_rate: DEFAULT_INTERACTION_SAMPLE_RATE,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            max_retries: DEFAULT_MAX_RETRIES,
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            durable_capacity: DEFAULT_DURABLE_CAPACITY,
            max_text_length: DEFAULT_MAX_TEXT_LENGTH,
            app_name: "beacon".to_owned(),
            app_version: env!("CARGO_PKG_VERSION").to_owned(),
            environment: "development".to_owned(),
        }
    }
}

impl PipelineConfig {
    /// Parse a JSON document and validate it.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|error| ConfigError::Parse(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::Invalid("endpoint must not be empty".to_owned()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batchSize must be at least 1".to_owned()));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flushIntervalMs must be at least 1".to_owned(),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeoutMs must be at least 1".to_owned()));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::Invalid("maxRetries must be at least 1".to_owned()));
        }
        if self.interaction_sample_rate.is_nan() {
            return Err(ConfigError::Invalid(
                "interactionSampleRate must be a number".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

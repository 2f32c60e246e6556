//! Error types for the telemetry pipeline.
//!
//! None of these ever reach a producer: `log_event` swallows storage errors
//! and transport errors feed the retry accounting.

use std::time::Duration;

use thiserror::Error;

/// Durable storage failures. The pipeline degrades to memory-only operation.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("storage io error: {0}")]
    Io(String),
    #[error("corrupt storage record: {0}")]
    Corrupt(String),
}

/// Why a batch was not delivered. Every variant is retried.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("ingest request timed out after {0:?}")]
    Timeout(Duration),
    #[error("ingest responded with http status {status}")]
    Http { status: u16 },
    #[error("network error: {0}")]
    Network(String),
    #[error("failed to encode batch: {0}")]
    Encode(String),
}

impl TransportError {
    /// Short stable label for logs and stats.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Http { .. } => "http",
            Self::Network(_) => "network",
            Self::Encode(_) => "encode",
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("failed to parse config: {0}")]
    Parse(String),
}

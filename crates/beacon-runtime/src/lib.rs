//! # beacon-runtime: the delivery pipeline
//!
//! Producers hand [`RawEvent`](beacon_protocol::RawEvent)s to the
//! [`DeliveryScheduler`]. Each one is normalized, sampled, written to the
//! durable queue and parked in memory until a flush cycle picks it up.
//!
//! A flush cycle composes one batch (durable entries, then retries, then
//! fresh events), transmits it and settles the outcome:
//!
//! ```text
//! Idle -> Composing -> Transmitting -> SettlingSuccess | SettlingFailure -> Idle
//! ```
//!
//! Only one cycle runs at a time. Teardown uses the transport's one-shot
//! handoff and never waits for the network.

pub mod environment;
pub mod normalizer;
pub mod producer;
pub mod scheduler;

pub use environment::{Connectivity, HostEnvironment};
pub use normalizer::Normalizer;
pub use producer::{EventSink, HeartbeatProducer, Producer, ProducerGuard, ProducerRegistry};
pub use scheduler::{DeliveryScheduler, DeliveryStats, FlushOutcome, FlushPhase, FlushTrigger};

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use beacon_protocol::{EventCategory, RawEvent};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::scheduler::DeliveryScheduler;

/// Handle producers use to emit events into the pipeline.
#[derive(Clone)]
pub struct EventSink {
    scheduler: Arc<DeliveryScheduler>,
}

impl EventSink {
    pub fn new(scheduler: Arc<DeliveryScheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn log(&self, raw: RawEvent) -> bool {
        self.scheduler.log_event(raw).await
    }
}

/// Undoes whatever a producer set up. Runs once, on [`ProducerGuard::teardown`]
/// or on drop.
pub struct ProducerGuard {
    name: String,
    teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl ProducerGuard {
    pub fn new(name: impl Into<String>, teardown: impl FnOnce() + Send + 'static) -> Self {
        Self {
            name: name.into(),
            teardown: Some(Box::new(teardown)),
        }
    }

    /// Guard that aborts a background task.
    pub fn for_task(name: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self::new(name, move || task.abort())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn teardown(mut self) {
        self.run();
    }

    fn run(&mut self) {
        if let Some(teardown) = self.teardown.take() {
            debug!(producer = %self.name, "producer torn down");
            teardown();
        }
    }
}

impl Drop for ProducerGuard {
    fn drop(&mut self) {
        self.run();
    }
}

impl fmt::Debug for ProducerGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerGuard")
            .field("name", &self.name)
            .field("armed", &self.teardown.is_some())
            .finish()
    }
}

/// A source of events that hooks itself into the host.
pub trait Producer: Send + Sync {
    fn name(&self) -> &str;
    fn install(&self, sink: EventSink) -> Result<ProducerGuard>;
}

#[derive(Default)]
pub struct ProducerRegistry {
    producers: Vec<Arc<dyn Producer>>,
    guards: Mutex<Vec<ProducerGuard>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, producer: Arc<dyn Producer>) {
        self.producers.push(producer);
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }

    /// Install every registered producer. Stops at the first failure; the
    /// producers installed so far stay installed.
    pub fn start_all(&self, sink: &EventSink) -> Result<usize> {
        let mut started = 0;
        for producer in &self.producers {
            let guard = producer
                .install(sink.clone())
                .with_context(|| format!("failed to install producer {}", producer.name()))?;
            self.guards.lock().push(guard);
            started += 1;
        }
        info!(started, "producers installed");
        Ok(started)
    }

    /// Tear down installed producers in reverse install order.
    pub fn shutdown(&self) -> usize {
        let guards: Vec<ProducerGuard> = self.guards.lock().drain(..).collect();
        let count = guards.len();
        for guard in guards.into_iter().rev() {
            guard.teardown();
        }
        count
    }
}

/// Emits a `system` heartbeat event on a fixed interval.
#[derive(Debug, Clone)]
pub struct HeartbeatProducer {
    interval: Duration,
}

impl HeartbeatProducer {
    pub const EVENT_TYPE: &'static str = "HEARTBEAT";

    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
        }
    }
}

impl Producer for HeartbeatProducer {
    fn name(&self) -> &str {
        "heartbeat"
    }

    fn install(&self, sink: EventSink) -> Result<ProducerGuard> {
        let handle = Handle::try_current().context("heartbeat producer needs a tokio runtime")?;
        let period = self.interval;
        let task = handle.spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            let mut beat: u64 = 0;
            loop {
                ticker.tick().await;
                beat += 1;
                let raw = RawEvent::new(Self::EVENT_TYPE)
                    .with_category(EventCategory::System)
                    .with_action("heartbeat")
                    .with_field("beat", beat)
                    .with_field("uptime_ms", started.elapsed().as_millis() as u64);
                sink.log(raw).await;
            }
        });
        Ok(ProducerGuard::for_task(self.name(), task))
    }
}

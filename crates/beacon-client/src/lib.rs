//! # beacon-client: one explicit telemetry pipeline per process
//!
//! [`PipelineBuilder`] wires identity, queues, sampling and transport into a
//! [`TelemetryClient`]. The client is a cheap handle; clone it into every
//! producer instead of reaching for a global.

mod driver;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use beacon_identity::{FileIdentityStore, IdentityStore};
use beacon_policy::{CategorySampler, SamplingPolicy};
use beacon_protocol::{Clock, EnvironmentProvider, SystemClock, Transport};
use beacon_queue::{DurableQueue, FileDurableQueue};
use beacon_runtime::{
    Connectivity, DeliveryScheduler, EventSink, FlushTrigger, HostEnvironment,
    Normalizer, Producer, ProducerRegistry,
};
use beacon_transport::{AuthTokenSlot, HttpTransport, HttpTransportConfig};
use tracing::{info, instrument, warn};

use crate::driver::TriggerDriver;

pub use beacon_protocol::{EventCategory, PipelineConfig, RawEvent};
pub use beacon_runtime::{DeliveryStats, FlushOutcome, HeartbeatProducer};

pub struct PipelineBuilder {
    root: PathBuf,
    config: PipelineConfig,
    transport: Option<Arc<dyn Transport>>,
    durable: Option<Arc<dyn DurableQueue>>,
    identity: Option<Arc<dyn IdentityStore>>,
    environment: Option<Arc<dyn EnvironmentProvider>>,
    sampler: Option<Arc<dyn SamplingPolicy>>,
    clock: Arc<dyn Clock>,
    auth: AuthTokenSlot,
    connectivity: Connectivity,
    producers: ProducerRegistry,
}

impl PipelineBuilder {
    /// `root` holds the durable queue and the identity record.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            config: PipelineConfig::default(),
            transport: None,
            durable: None,
            identity: None,
            environment: None,
            sampler: None,
            clock: Arc::new(SystemClock),
            auth: AuthTokenSlot::new(),
            connectivity: Connectivity::default(),
            producers: ProducerRegistry::new(),
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn durable_queue(mut self, durable: Arc<dyn DurableQueue>) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn identity_store(mut self, identity: Arc<dyn IdentityStore>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn EnvironmentProvider>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn SamplingPolicy>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn auth_token_slot(mut self, auth: AuthTokenSlot) -> Self {
        self.auth = auth;
        self
    }

    pub fn connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn producer(mut self, producer: Arc<dyn Producer>) -> Self {
        self.producers.register(producer);
        self
    }

    pub fn build(self) -> Result<TelemetryClient> {
        let config = self.config;
        config.validate().context("invalid pipeline config")?;

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new(HttpTransportConfig::from_pipeline(&config))?
                    .with_auth(self.auth.clone()),
            ),
        };
        let durable = if config.enable_offline_persist {
            Some(self.durable.unwrap_or_else(|| {
                Arc::new(FileDurableQueue::new(&self.root, config.durable_capacity))
            }))
        } else {
            None
        };
        let identity = self
            .identity
            .unwrap_or_else(|| Arc::new(FileIdentityStore::new(&self.root)));
        let environment = self.environment.unwrap_or_else(|| {
            Arc::new(HostEnvironment::new(&config, self.connectivity.clone()))
        });
        let sampler = self.sampler.unwrap_or_else(|| {
            Arc::new(CategorySampler::interaction_only(
                config.interaction_sample_rate,
            ))
        });

        let normalizer = Normalizer::new(self.clock, identity, environment, config.max_text_length);
        let scheduler = Arc::new(DeliveryScheduler::new(
            config,
            normalizer,
            sampler,
            durable,
            transport,
            self.connectivity,
        ));

        Ok(TelemetryClient {
            inner: Arc::new(ClientInner {
                scheduler,
                producers: self.producers,
                auth: self.auth,
                driver: tokio::sync::Mutex::new(None),
            }),
        })
    }
}

struct ClientInner {
    scheduler: Arc<DeliveryScheduler>,
    producers: ProducerRegistry,
    auth: AuthTokenSlot,
    driver: tokio::sync::Mutex<Option<TriggerDriver>>,
}

#[derive(Clone)]
pub struct TelemetryClient {
    inner: Arc<ClientInner>,
}

impl TelemetryClient {
    /// Start the flush driver and install registered producers. Must run
    /// inside a tokio runtime. Calling it again is a no-op.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let mut driver = self.inner.driver.lock().await;
        if driver.is_some() {
            return Ok(());
        }
        let period = self.inner.scheduler.config().flush_interval();
        *driver = Some(TriggerDriver::spawn(self.inner.scheduler.clone(), period));

        let sink = EventSink::new(self.inner.scheduler.clone());
        self.inner
            .producers
            .start_all(&sink)
            .context("failed to start producers")?;
        info!(
            endpoint = %self.inner.scheduler.config().endpoint,
            "telemetry client started"
        );
        Ok(())
    }

    /// Never fails; returns `false` only when sampling dropped the event.
    pub async fn log_event(&self, raw: RawEvent) -> bool {
        self.inner.scheduler.log_event(raw).await
    }

    pub async fn flush(&self) -> FlushOutcome {
        self.inner.scheduler.flush(FlushTrigger::Manual).await
    }

    pub fn set_user(&self, user: Option<String>) {
        self.inner.scheduler.set_user(user);
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        self.inner.auth.set(token);
    }

    pub fn set_online(&self, online: bool) {
        self.inner.scheduler.set_online(online);
    }

    pub fn set_visible(&self, visible: bool) {
        self.inner.scheduler.set_visible(visible);
    }

    /// Start a new session; the anonymous id is kept.
    pub fn clear_session(&self) {
        self.inner.scheduler.normalizer().identity().clear_session();
    }

    pub fn stats(&self) -> DeliveryStats {
        self.inner.scheduler.stats()
    }

    pub fn scheduler(&self) -> &Arc<DeliveryScheduler> {
        &self.inner.scheduler
    }

    /// Stop the driver, tear down producers and hand the remaining events to
    /// the one-shot transport. Waits up to the transport timeout for an
    /// in-flight cycle to settle first.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> FlushOutcome {
        if let Some(driver) = self.inner.driver.lock().await.take() {
            driver.stop().await;
        }
        let removed = self.inner.producers.shutdown();
        info!(producers = removed, "producers torn down");

        let deadline = self.inner.scheduler.config().timeout();
        let settled = tokio::time::timeout(deadline, async {
            while self.inner.scheduler.is_flushing() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        if settled.is_err() {
            warn!("flush still in progress at shutdown");
        }

        self.inner.scheduler.teardown().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    use async_trait::async_trait;
    use beacon_protocol::{Event, TransportError};
    use parking_lot::Mutex;
    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<Vec<Event>>>,
        beacons: Mutex<Vec<Vec<Event>>>,
        fail: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    impl RecordingTransport {
        fn delivered(&self) -> usize {
            self.sent.lock().iter().map(Vec::len).sum()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, batch: &[Event]) -> Result<(), TransportError> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(TransportError::Network("connection refused".to_owned()));
            }
            self.sent.lock().push(batch.to_vec());
            Ok(())
        }

        fn send_beacon(&self, batch: &[Event]) -> bool {
            self.beacons.lock().push(batch.to_vec());
            true
        }
    }

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn quiet_config() -> PipelineConfig {
        PipelineConfig {
            flush_interval_ms: 60_000,
            ..PipelineConfig::default()
        }
    }

    async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if done() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        done()
    }

    #[tokio::test]
    async fn default_build_persists_under_root() -> anyhow::Result<()> {
        let root = unique_test_root("beacon-client-defaults");
        let transport = Arc::new(RecordingTransport::default());
        let client = PipelineBuilder::new(&root)
            .config(quiet_config())
            .transport(transport.clone())
            .build()?;

        assert!(client.log_event(RawEvent::new("APP_START")).await);
        assert!(root.join("identity.json").exists());
        assert!(root.join("queue").join("events.jsonl").exists());

        assert_eq!(client.flush().await, FlushOutcome::Delivered { count: 1 });
        assert_eq!(client.stats().delivered, 1);
        Ok(())
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let result = PipelineBuilder::new(unique_test_root("beacon-client-invalid"))
            .config(PipelineConfig {
                batch_size: 0,
                ..PipelineConfig::default()
            })
            .build();
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn timer_flushes_logged_events() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let client = PipelineBuilder::new(unique_test_root("beacon-client-timer"))
            .config(PipelineConfig {
                flush_interval_ms: 20,
                ..PipelineConfig::default()
            })
            .transport(transport.clone())
            .build()?;
        client.start().await?;

        client.log_event(RawEvent::new("PAGE_VIEW")).await;
        assert!(wait_for(|| transport.delivered() == 1).await);
        client.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn reaching_batch_size_triggers_a_flush() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let client = PipelineBuilder::new(unique_test_root("beacon-client-threshold"))
            .config(PipelineConfig {
                batch_size: 3,
                ..quiet_config()
            })
            .transport(transport.clone())
            .build()?;
        client.start().await?;

        for _ in 0..3 {
            client.log_event(RawEvent::new("PAGE_VIEW")).await;
        }
        assert!(wait_for(|| transport.delivered() == 3).await);
        Ok(())
    }

    #[tokio::test]
    async fn coming_back_online_flushes() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let client = PipelineBuilder::new(unique_test_root("beacon-client-online"))
            .config(quiet_config())
            .transport(transport.clone())
            .build()?;
        client.start().await?;

        client.set_online(false);
        client.log_event(RawEvent::new("PAGE_VIEW")).await;
        assert_eq!(client.flush().await, FlushOutcome::Offline);

        client.set_online(true);
        assert!(wait_for(|| transport.delivered() == 1).await);
        Ok(())
    }

    #[tokio::test]
    async fn undelivered_events_survive_a_restart() -> anyhow::Result<()> {
        let root = unique_test_root("beacon-client-restart");
        let failing = Arc::new(RecordingTransport::default());
        failing.fail.store(true, Ordering::SeqCst);
        let first = PipelineBuilder::new(&root)
            .config(quiet_config())
            .transport(failing)
            .build()?;
        first.log_event(RawEvent::new("CHECKOUT").with_event_id("ev-keep")).await;
        assert!(matches!(first.flush().await, FlushOutcome::Failed { .. }));
        drop(first);

        let transport = Arc::new(RecordingTransport::default());
        let second = PipelineBuilder::new(&root)
            .config(quiet_config())
            .transport(transport.clone())
            .build()?;
        assert_eq!(second.flush().await, FlushOutcome::Delivered { count: 1 });

        let sent = transport.sent.lock();
        assert_eq!(sent[0][0].event_id.as_str(), "ev-keep");
        assert_eq!(sent[0][0].retry_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_hands_off_and_stops_producers() -> anyhow::Result<()> {
        let transport = Arc::new(RecordingTransport::default());
        let client = PipelineBuilder::new(unique_test_root("beacon-client-shutdown"))
            .config(quiet_config())
            .transport(transport.clone())
            .producer(Arc::new(HeartbeatProducer::new(Duration::from_secs(3600))))
            .build()?;
        client.start().await?;

        for _ in 0..4 {
            client.log_event(RawEvent::new("PAGE_VIEW")).await;
        }
        assert_eq!(client.shutdown().await, FlushOutcome::HandedOff { count: 4 });
        assert_eq!(transport.beacons.lock()[0].len(), 4);
        assert_eq!(transport.delivered(), 0);

        let durable = client.scheduler().durable_queue().map(Arc::clone);
        if let Some(durable) = durable {
            assert_eq!(durable.count().await?, 0);
        }
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_waits_for_an_in_flight_cycle() -> anyhow::Result<()> {
        let gate = Arc::new(Notify::new());
        let transport = Arc::new(RecordingTransport {
            gate: Some(gate.clone()),
            ..RecordingTransport::default()
        });
        let client = PipelineBuilder::new(unique_test_root("beacon-client-shutdown-wait"))
            .config(quiet_config())
            .transport(transport.clone())
            .build()?;

        client.log_event(RawEvent::new("FIRST")).await;
        let flushing = tokio::spawn({
            let client = client.clone();
            async move { client.flush().await }
        });
        assert!(wait_for(|| client.scheduler().is_flushing()).await);

        client.log_event(RawEvent::new("SECOND")).await;
        let stopping = tokio::spawn({
            let client = client.clone();
            async move { client.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopping.is_finished());

        gate.notify_one();
        assert_eq!(flushing.await?, FlushOutcome::Delivered { count: 1 });
        assert_eq!(stopping.await?, FlushOutcome::HandedOff { count: 1 });
        assert_eq!(transport.beacons.lock()[0][0].event_type, "SECOND");
        Ok(())
    }

    #[tokio::test]
    async fn clear_session_rotates_session_only() -> anyhow::Result<()> {
        let client = PipelineBuilder::new(unique_test_root("beacon-client-session"))
            .config(quiet_config())
            .transport(Arc::new(RecordingTransport::default()))
            .build()?;

        client.log_event(RawEvent::new("A")).await;
        client.clear_session();
        client.log_event(RawEvent::new("B")).await;

        let queued = client.scheduler().pending_queue().snapshot();
        assert_ne!(queued[0].session_id, queued[1].session_id);
        assert_eq!(queued[0].anonymous_id, queued[1].anonymous_id);
        Ok(())
    }
}

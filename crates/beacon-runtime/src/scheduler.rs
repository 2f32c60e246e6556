use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use beacon_policy::SamplingPolicy;
use beacon_protocol::{Event, EventId, PipelineConfig, RawEvent, Transport, TransportError, UserId};
use beacon_queue::{DurableQueue, PendingQueue, RetryOutcome, RetryQueue};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::environment::Connectivity;
use crate::normalizer::Normalizer;

/// Why a flush cycle was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushTrigger {
    Timer,
    Threshold,
    Online,
    Visible,
    Manual,
    Teardown,
}

impl FlushTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timer => "timer",
            Self::Threshold => "threshold",
            Self::Online => "online",
            Self::Visible => "visible",
            Self::Manual => "manual",
            Self::Teardown => "teardown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushPhase {
    Idle,
    Composing,
    Transmitting,
    SettlingSuccess,
    SettlingFailure,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Another cycle was active; this trigger was dropped.
    Busy,
    /// Offline; nothing was composed.
    Offline,
    /// Nothing to send.
    Empty,
    Delivered { count: usize },
    Failed {
        count: usize,
        requeued: usize,
        dropped: usize,
        error: TransportError,
    },
    /// Teardown batch accepted by the one-shot handoff. Delivery is unconfirmed.
    HandedOff { count: usize },
    /// Teardown handoff refused; the batch stays queued.
    HandoffRejected { count: usize },
}

/// Counters and queue depths at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub logged: u64,
    pub sampled_out: u64,
    pub delivered: u64,
    pub failed: u64,
    pub requeued: u64,
    pub dropped: u64,
    /// Memory-only events pushed out of a full pending queue.
    pub evicted: u64,
    pub beacon_handoffs: u64,
    pub pending: usize,
    pub retrying: usize,
}

#[derive(Debug, Default)]
struct Counters {
    logged: AtomicU64,
    sampled_out: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    evicted: AtomicU64,
    beacon_handoffs: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, amount: usize) {
        counter.fetch_add(amount as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Durable,
    Retry,
    Pending,
}

#[derive(Debug, Default)]
struct Batch {
    events: Vec<Event>,
    origins: Vec<Origin>,
}

impl Batch {
    fn len(&self) -> usize {
        self.events.len()
    }

    fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    fn ids(&self) -> Vec<EventId> {
        self.events.iter().map(|event| event.event_id.clone()).collect()
    }
}

/// Clears the in-flight flag and resets the phase when a cycle ends,
/// whichever way it ends.
struct FlightGuard<'a> {
    in_flight: &'a AtomicBool,
    phase: &'a Mutex<FlushPhase>,
}

impl<'a> FlightGuard<'a> {
    fn acquire(in_flight: &'a AtomicBool, phase: &'a Mutex<FlushPhase>) -> Option<Self> {
        in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self { in_flight, phase })
    }

    fn enter(&self, next: FlushPhase) {
        let mut phase = self.phase.lock();
        debug!(from = ?*phase, to = ?next, "flush phase");
        *phase = next;
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        *self.phase.lock() = FlushPhase::Idle;
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Owns the queues and runs flush cycles. At most one cycle is active at a
/// time; triggers that arrive meanwhile are dropped.
pub struct DeliveryScheduler {
    config: PipelineConfig,
    normalizer: Normalizer,
    sampler: Arc<dyn SamplingPolicy>,
    durable: Option<Arc<dyn DurableQueue>>,
    retry: RetryQueue,
    pending: PendingQueue,
    transport: Arc<dyn Transport>,
    connectivity: Connectivity,
    visible: AtomicBool,
    in_flight: AtomicBool,
    phase: Mutex<FlushPhase>,
    counters: Counters,
    triggers: Mutex<Option<mpsc::Sender<FlushTrigger>>>,
}

impl DeliveryScheduler {
    pub fn new(
        config: PipelineConfig,
        normalizer: Normalizer,
        sampler: Arc<dyn SamplingPolicy>,
        durable: Option<Arc<dyn DurableQueue>>,
        transport: Arc<dyn Transport>,
        connectivity: Connectivity,
    ) -> Self {
        let durable = durable.filter(|_| config.enable_offline_persist);
        Self {
            retry: RetryQueue::new(config.max_retries),
            pending: PendingQueue::new(config.max_queue_size),
            config,
            normalizer,
            sampler,
            durable,
            transport,
            connectivity,
            visible: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            phase: Mutex::new(FlushPhase::Idle),
            counters: Counters::default(),
            triggers: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn normalizer(&self) -> &Normalizer {
        &self.normalizer
    }

    pub fn connectivity(&self) -> &Connectivity {
        &self.connectivity
    }

    pub fn phase(&self) -> FlushPhase {
        *self.phase.lock()
    }

    /// Whether a cycle holds the in-flight slot. Stays true until the slot is
    /// released, which happens after the phase returns to `Idle`.
    pub fn is_flushing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn retry_queue(&self) -> &RetryQueue {
        &self.retry
    }

    pub fn pending_queue(&self) -> &PendingQueue {
        &self.pending
    }

    pub fn durable_queue(&self) -> Option<&Arc<dyn DurableQueue>> {
        self.durable.as_ref()
    }

    /// Route threshold, connectivity and visibility triggers into a channel.
    /// Replaces any earlier subscriber.
    pub fn subscribe_triggers(&self, capacity: usize) -> mpsc::Receiver<FlushTrigger> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.triggers.lock() = Some(tx);
        rx
    }

    fn signal(&self, trigger: FlushTrigger) {
        let triggers = self.triggers.lock();
        if let Some(tx) = triggers.as_ref()
            && let Err(error) = tx.try_send(trigger)
        {
            debug!(%trigger, %error, "flush trigger not delivered");
        }
    }

    /// Normalize, sample and enqueue one event. Returns `false` only when
    /// sampling dropped it. Storage failures degrade to memory-only.
    #[instrument(skip_all, fields(event_id = tracing::field::Empty))]
    pub async fn log_event(&self, raw: RawEvent) -> bool {
        let event = self.normalizer.normalize(raw);
        tracing::Span::current().record("event_id", event.event_id.as_str());

        if !self.sampler.decide(&event).is_kept() {
            Counters::add(&self.counters.sampled_out, 1);
            return false;
        }
        Counters::add(&self.counters.logged, 1);

        let persisted = match &self.durable {
            Some(durable) => match durable.push(&event).await {
                Ok(()) => true,
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "durable push failed, keeping event in memory only");
                    false
                }
            },
            None => false,
        };

        let (queued, evicted) = self.pending.push(event);
        // Without a working durable store the evicted event has no other copy.
        if let Some(evicted) = evicted
            && !persisted
        {
            warn!(event_id = %evicted.event_id, "evicted event had no durable copy, lost");
            Counters::add(&self.counters.evicted, 1);
        }
        if queued >= self.config.batch_size {
            self.signal(FlushTrigger::Threshold);
        }
        true
    }

    pub fn set_user(&self, user: Option<String>) {
        self.normalizer.set_user(user.map(UserId::from));
    }

    /// Returns true when this call moved the pipeline from offline to online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.connectivity.set(online);
        let regained = online && !was_online;
        if regained {
            info!("connectivity regained");
            self.signal(FlushTrigger::Online);
        }
        regained
    }

    /// Returns true when this call made the host visible again.
    pub fn set_visible(&self, visible: bool) -> bool {
        let was_visible = self.visible.swap(visible, Ordering::SeqCst);
        let regained = visible && !was_visible;
        if regained {
            self.signal(FlushTrigger::Visible);
        }
        regained
    }

    pub fn stats(&self) -> DeliveryStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        DeliveryStats {
            logged: load(&self.counters.logged),
            sampled_out: load(&self.counters.sampled_out),
            delivered: load(&self.counters.delivered),
            failed: load(&self.counters.failed),
            requeued: load(&self.counters.requeued),
            dropped: load(&self.counters.dropped),
            evicted: load(&self.counters.evicted),
            beacon_handoffs: load(&self.counters.beacon_handoffs),
            pending: self.pending.len(),
            retrying: self.retry.len(),
        }
    }

    /// Run one flush cycle.
    #[instrument(skip_all, fields(trigger = %trigger))]
    pub async fn flush(&self, trigger: FlushTrigger) -> FlushOutcome {
        if trigger == FlushTrigger::Teardown {
            return self.teardown().await;
        }
        let Some(guard) = FlightGuard::acquire(&self.in_flight, &self.phase) else {
            debug!("flush already in progress, dropping trigger");
            return FlushOutcome::Busy;
        };
        if !self.connectivity.is_online() {
            debug!("offline, skipping flush");
            return FlushOutcome::Offline;
        }

        guard.enter(FlushPhase::Composing);
        let batch = self.compose().await;
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        guard.enter(FlushPhase::Transmitting);
        debug!(batch_len = batch.len(), "transmitting batch");
        match self.transport.send(&batch.events).await {
            Ok(()) => {
                guard.enter(FlushPhase::SettlingSuccess);
                self.settle_success(&batch).await
            }
            Err(error) => {
                guard.enter(FlushPhase::SettlingFailure);
                self.settle_failure(batch, error).await
            }
        }
    }

    /// Hand whatever is queued to the one-shot transport without waiting for
    /// the network.
    #[instrument(skip(self))]
    pub async fn teardown(&self) -> FlushOutcome {
        let Some(guard) = FlightGuard::acquire(&self.in_flight, &self.phase) else {
            debug!("flush in progress at teardown, leaving queued events in place");
            return FlushOutcome::Busy;
        };

        guard.enter(FlushPhase::Composing);
        let batch = self.compose().await;
        if batch.is_empty() {
            return FlushOutcome::Empty;
        }

        guard.enter(FlushPhase::Transmitting);
        let count = batch.len();
        if self.transport.send_beacon(&batch.events) {
            guard.enter(FlushPhase::SettlingSuccess);
            Counters::add(&self.counters.beacon_handoffs, 1);
            self.remove_durable(&batch.ids()).await;
            info!(batch_len = count, "teardown batch handed off");
            FlushOutcome::HandedOff { count }
        } else {
            guard.enter(FlushPhase::SettlingFailure);
            warn!(batch_len = count, "teardown handoff rejected");
            self.restore(batch);
            FlushOutcome::HandoffRejected { count }
        }
    }

    /// Durable snapshot first, then retries, then fresh events, capped at the
    /// batch size. Copies of an already selected id are folded into it.
    async fn compose(&self) -> Batch {
        let limit = self.config.batch_size;
        let mut selected: IndexMap<EventId, (Event, Origin)> = IndexMap::new();
        let mut malformed = 0usize;

        if let Some(durable) = &self.durable {
            match durable.peek_batch(limit).await {
                Ok(events) => {
                    let mut blank = Vec::new();
                    for event in events {
                        if event.is_well_formed() {
                            merge(&mut selected, event, Origin::Durable);
                        } else {
                            malformed += 1;
                            blank.push(event.event_id);
                        }
                    }
                    self.remove_durable(&blank).await;
                }
                Err(error) => {
                    warn!(error = %format!("{error:#}"), "durable peek failed, composing from memory");
                }
            }
        }

        self.absorb_duplicates(&mut selected);

        let room = limit.saturating_sub(selected.len());
        for event in self.retry.take_front(room) {
            if event.is_well_formed() {
                merge(&mut selected, event, Origin::Retry);
            } else {
                malformed += 1;
            }
        }
        self.absorb_duplicates(&mut selected);

        let room = limit.saturating_sub(selected.len());
        for event in self.pending.take_front(room) {
            if event.is_well_formed() {
                merge(&mut selected, event, Origin::Pending);
            } else {
                malformed += 1;
            }
        }

        if malformed > 0 {
            warn!(malformed, "discarded events without an id");
        }

        let mut batch = Batch::default();
        for (_, (event, origin)) in selected {
            batch.events.push(event);
            batch.origins.push(origin);
        }
        batch
    }

    /// Pull copies of selected ids out of the retry and pending queues.
    fn absorb_duplicates(&self, selected: &mut IndexMap<EventId, (Event, Origin)>) {
        let ids: HashSet<EventId> = selected.keys().cloned().collect();
        let copies = self
            .retry
            .remove_ids(&ids)
            .into_iter()
            .chain(self.pending.remove_ids(&ids));
        for copy in copies {
            if let Some((event, _)) = selected.get_mut(&copy.event_id) {
                event.retry_count = event.retry_count.max(copy.retry_count);
            }
        }
    }

    async fn settle_success(&self, batch: &Batch) -> FlushOutcome {
        let count = batch.len();
        self.remove_durable(&batch.ids()).await;
        Counters::add(&self.counters.delivered, count);
        info!(batch_len = count, "batch delivered");
        FlushOutcome::Delivered { count }
    }

    async fn settle_failure(&self, batch: Batch, error: TransportError) -> FlushOutcome {
        let count = batch.len();
        let mut requeued = 0usize;
        let mut exhausted = Vec::new();

        for mut event in batch.events {
            event.record_failed_attempt();
            match self.retry.requeue(event.clone()) {
                RetryOutcome::Requeued => {
                    requeued += 1;
                    if let Some(durable) = &self.durable
                        && let Err(error) = durable.push(&event).await
                    {
                        warn!(error = %format!("{error:#}"), "failed to persist retry count");
                    }
                }
                RetryOutcome::Exhausted => exhausted.push(event.event_id),
            }
        }
        self.remove_durable(&exhausted).await;

        let dropped = exhausted.len();
        Counters::add(&self.counters.failed, count);
        Counters::add(&self.counters.requeued, requeued);
        Counters::add(&self.counters.dropped, dropped);
        warn!(
            batch_len = count,
            requeued,
            dropped,
            kind = error.kind(),
            %error,
            "batch delivery failed"
        );
        FlushOutcome::Failed {
            count,
            requeued,
            dropped,
            error,
        }
    }

    /// Put a batch that never left back where it came from. Durable entries
    /// were only peeked and are still stored.
    fn restore(&self, batch: Batch) {
        let mut retry = Vec::new();
        let mut pending = Vec::new();
        for (event, origin) in batch.events.into_iter().zip(batch.origins) {
            match origin {
                Origin::Durable => {}
                Origin::Retry => retry.push(event),
                Origin::Pending => pending.push(event),
            }
        }
        self.retry.restore_front(retry);
        self.pending.restore_front(pending);
    }

    async fn remove_durable(&self, ids: &[EventId]) {
        if ids.is_empty() {
            return;
        }
        if let Some(durable) = &self.durable
            && let Err(error) = durable.remove_keys(ids).await
        {
            warn!(error = %format!("{error:#}"), "durable remove failed");
        }
    }
}

fn merge(selected: &mut IndexMap<EventId, (Event, Origin)>, event: Event, origin: Origin) {
    match selected.get_mut(&event.event_id) {
        Some((existing, _)) => {
            existing.retry_count = existing.retry_count.max(event.retry_count);
        }
        None => {
            selected.insert(event.event_id.clone(), (event, origin));
        }
    }
}

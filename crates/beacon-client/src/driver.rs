use std::sync::Arc;
use std::time::Duration;

use beacon_runtime::{DeliveryScheduler, FlushTrigger};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

pub(crate) const TRIGGER_CHANNEL_CAPACITY: usize = 16;

/// Background task turning timer ticks and scheduler signals into flush
/// cycles. Each cycle runs in its own task so a slow transmission never
/// blocks the loop; the scheduler drops triggers that overlap.
pub(crate) struct TriggerDriver {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TriggerDriver {
    pub(crate) fn spawn(scheduler: Arc<DeliveryScheduler>, period: Duration) -> Self {
        let mut triggers = scheduler.subscribe_triggers(TRIGGER_CHANNEL_CAPACITY);
        let (stop, mut stopped) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            info!(period_ms = period.as_millis() as u64, "flush driver started");

            loop {
                let trigger = tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => FlushTrigger::Timer,
                    Some(trigger) = triggers.recv() => trigger,
                };
                let scheduler = scheduler.clone();
                tokio::spawn(async move {
                    let outcome = scheduler.flush(trigger).await;
                    debug!(%trigger, ?outcome, "flush cycle finished");
                });
            }
            debug!("flush driver stopped");
        });

        Self { stop, task }
    }

    pub(crate) async fn stop(self) {
        let _ = self.stop.send(());
        let _ = self.task.await;
    }
}

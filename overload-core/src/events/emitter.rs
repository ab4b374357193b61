//! Periodic metrics publication for live streaming.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{EventHub, Subscription};
use crate::config::EmitterConfig;
use crate::metrics::{Metrics, MetricsSnapshot};

/// Publishes metrics snapshots of the active simulation run onto an event
/// hub at a fixed interval.
pub struct MetricsEmitter {
    hub: EventHub<MetricsSnapshot>,
    interval: Duration,
}

impl MetricsEmitter {
    pub fn new(cfg: EmitterConfig) -> Self {
        Self {
            hub: EventHub::new(10),
            interval: cfg.interval,
        }
    }

    /// Starts snapshotting `metrics` until `token` is cancelled. Each
    /// simulation run gets its own watcher; runs never overlap.
    pub fn watch_run(&self, token: CancellationToken, metrics: Arc<Metrics>) {
        let interval = self.interval;
        let publisher = self.hub.publisher();
        tokio::spawn(async move {
            tracing::debug!("metrics emitter watching new run");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => publisher.publish(metrics.snapshot()),
                }
            }
            tracing::debug!("metrics emitter run finished");
        });
    }

    /// Registers a snapshot subscriber.
    pub fn subscribe(&self, buffer: usize) -> Subscription<MetricsSnapshot> {
        self.hub.subscribe(buffer)
    }

    /// Removes a snapshot subscriber.
    pub fn unsubscribe(&self, id: u64) {
        self.hub.unsubscribe(id)
    }
}

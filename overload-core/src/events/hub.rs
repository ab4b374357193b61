//! Generic multi-subscriber event fan-out.
//!
//! Publishing never blocks a producer: the hub's input buffer drops the
//! event when full, and a slow subscriber only loses events for itself.
//! Staleness is preferable to backpressure on the simulation's hot paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

type SubscriberMap<T> = Arc<Mutex<HashMap<u64, mpsc::Sender<T>>>>;

/// A handle to a hub subscription. Dropping it ends the subscription from
/// the receiver side; call [`EventHub::unsubscribe`] for an explicit
/// removal.
pub struct Subscription<T> {
    pub id: u64,
    rx: mpsc::Receiver<T>,
}

impl<T> Subscription<T> {
    /// Receives the next event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

/// Clonable publishing handle, detached from the hub's lifetime.
#[derive(Clone)]
pub struct EventPublisher<T> {
    input: mpsc::Sender<T>,
}

impl<T: Send + 'static> EventPublisher<T> {
    /// Same non-blocking semantics as [`EventHub::publish`].
    pub fn publish(&self, event: T) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.input.try_send(event) {
            tracing::warn!("hub input buffer full, producer dropped event");
        }
    }
}

/// Generic event hub distributing published events to all subscribers.
pub struct EventHub<T> {
    input: mpsc::Sender<T>,
    subscribers: SubscriberMap<T>,
    next_id: AtomicU64,
}

impl<T: Clone + Send + 'static> EventHub<T> {
    /// Creates the hub and spawns its distribution task.
    pub fn new(input_buffer: usize) -> Self {
        let (input, mut rx) = mpsc::channel::<T>(input_buffer.max(1));
        let subscribers: SubscriberMap<T> = Arc::new(Mutex::new(HashMap::new()));

        let distribution = subscribers.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let mut closed = Vec::new();
                {
                    let subs = distribution.lock();
                    for (id, sub) in subs.iter() {
                        match sub.try_send(event.clone()) {
                            Ok(()) => {}
                            Err(mpsc::error::TrySendError::Full(_)) => {
                                tracing::warn!(
                                    subscriber = id,
                                    "subscriber buffer full, dropped event"
                                );
                            }
                            Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                        }
                    }
                }
                if !closed.is_empty() {
                    let mut subs = distribution.lock();
                    for id in closed {
                        subs.remove(&id);
                    }
                }
            }
            tracing::debug!("event hub stopped");
        });

        Self {
            input,
            subscribers,
            next_id: AtomicU64::new(1),
        }
    }

    /// Publishes an event to all subscribers. Non-blocking: drops the event
    /// when the hub's input buffer is full.
    pub fn publish(&self, event: T) {
        if let Err(mpsc::error::TrySendError::Full(_)) = self.input.try_send(event) {
            tracing::warn!("hub input buffer full, producer dropped event");
        }
    }

    /// A detached publishing handle for producer tasks.
    pub fn publisher(&self) -> EventPublisher<T> {
        EventPublisher {
            input: self.input.clone(),
        }
    }

    /// Registers a subscriber with its own buffer.
    pub fn subscribe(&self, buffer: usize) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().insert(id, tx);
        tracing::debug!(subscriber = id, "hub subscriber registered");
        Subscription { id, rx }
    }

    /// Removes a subscriber; its channel closes.
    pub fn unsubscribe(&self, id: u64) {
        if self.subscribers.lock().remove(&id).is_some() {
            tracing::debug!(subscriber = id, "hub subscriber unregistered");
        }
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

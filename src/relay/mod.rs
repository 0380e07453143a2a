//! Ingest-and-fan-out core.
//!
//! `RelayState` owns the last-value cache and the subscriber registry behind
//! a single lock, so publishing (cache overwrite + broadcast) and joining
//! (register + push cached value) never interleave. `FanoutRelay` is the one
//! task that turns broker events into publishes, in arrival order.

pub mod cache;
pub mod registry;

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;

use crate::mqtt::BrokerEvent;

pub use cache::{LastValueCache, SensorPayload};
pub use registry::{
    BroadcastReport, SubscriberId, SubscriberRegistry, SubscriberStatus, Subscription,
    DEFAULT_QUEUE_CAPACITY,
};

struct Core {
    cache: LastValueCache,
    subscribers: SubscriberRegistry,
    /// Set by `shutdown`; no subscriber joins after this.
    closing: bool,
}

struct Inner {
    core: Mutex<Core>,
    /// Notified whenever the registry becomes empty.
    drained: Notify,
}

/// Process-wide relay state. Cloning yields another handle to the same state.
#[derive(Clone)]
pub struct RelayState {
    inner: Arc<Inner>,
}

impl RelayState {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    cache: LastValueCache::new(),
                    subscribers: SubscriberRegistry::new(queue_capacity),
                    closing: false,
                }),
                drained: Notify::new(),
            }),
        }
    }

    /// Cache `payload` and queue it to every open subscriber.
    pub fn publish(&self, payload: SensorPayload) -> BroadcastReport {
        let mut core = self.inner.core.lock();
        let report = core.subscribers.broadcast(&payload);
        core.cache.set(payload);
        if report.dropped > 0 && core.subscribers.is_empty() {
            self.inner.drained.notify_waiters();
        }
        report
    }

    /// Register a new client; it receives the cached value first, if any.
    ///
    /// After `shutdown` the returned queue is already closed and the client is
    /// not registered.
    pub fn attach(&self) -> Subscription {
        let mut core = self.inner.core.lock();
        let Core {
            cache,
            subscribers,
            closing,
        } = &mut *core;
        if *closing {
            return subscribers.add_closed();
        }
        subscribers.add(cache.get())
    }

    /// Forget a client. Safe to call more than once.
    pub fn detach(&self, id: SubscriberId) -> bool {
        let mut core = self.inner.core.lock();
        let removed = core.subscribers.remove(id);
        if removed && core.subscribers.is_empty() {
            self.inner.drained.notify_waiters();
        }
        removed
    }

    pub fn current(&self) -> Option<SensorPayload> {
        self.inner.core.lock().cache.get().cloned()
    }

    pub fn status(&self, id: SubscriberId) -> SubscriberStatus {
        self.inner.core.lock().subscribers.status(id)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.core.lock().subscribers.len()
    }

    /// Start closing every connected client. Returns how many were told.
    pub fn shutdown(&self) -> usize {
        let mut core = self.inner.core.lock();
        core.closing = true;
        let closing = core.subscribers.begin_close_all();
        tracing::info!(closing, "closing subscribers");
        closing
    }

    /// Resolve once no subscriber is registered.
    pub async fn wait_for_drained(&self) {
        loop {
            let notified = self.inner.drained.notified();
            let count = self.subscriber_count();
            if count == 0 {
                return;
            }
            tracing::debug!(count, "waiting for subscribers to close");
            notified.await;
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

/// Consumes broker events and publishes messages into `RelayState`.
pub struct FanoutRelay {
    state: RelayState,
    events: mpsc::Receiver<BrokerEvent>,
}

impl FanoutRelay {
    pub fn new(state: RelayState, events: mpsc::Receiver<BrokerEvent>) -> Self {
        Self { state, events }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Process events one at a time until every sender is gone.
    pub async fn run(mut self) {
        while let Some(event) = self.events.recv().await {
            self.handle(event);
        }
        tracing::debug!("broker event channel closed, relay stopping");
    }

    fn handle(&self, event: BrokerEvent) {
        match event {
            BrokerEvent::Message(payload) => {
                tracing::debug!(payload = %payload.to_text(), "received reading");
                let report = self.state.publish(payload);
                tracing::debug!(delivered = report.delivered, dropped = report.dropped, "fanned out");
            }
            BrokerEvent::Connected => tracing::info!("connected to MQTT broker"),
            BrokerEvent::Subscribed { topic } => {
                tracing::info!(%topic, "subscribed to topic")
            }
            BrokerEvent::SubscribeRejected { topic } => {
                tracing::error!(%topic, "subscription rejected by broker")
            }
            BrokerEvent::Disconnected { reason } => {
                tracing::error!(%reason, "broker connection lost")
            }
        }
    }
}

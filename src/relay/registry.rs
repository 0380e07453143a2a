//! Live subscriber bookkeeping.
//!
//! Every connected client gets a bounded outbound queue. The registry holds
//! the sending half and the connection task drains the receiving half into
//! its socket. A subscriber whose queue is closed or full is dropped during
//! broadcast; the remaining subscribers are unaffected.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc::{self, error::TrySendError};

use super::cache::SensorPayload;

/// Outbound queue depth per subscriber.
pub const DEFAULT_QUEUE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Lifecycle of one duplex connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberStatus {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SubscriberStatus {
    pub fn can_transition_to(self, next: SubscriberStatus) -> bool {
        use SubscriberStatus::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closed) | (Open, Closing) | (Open, Closed) | (Closing, Closed)
        )
    }
}

struct Subscriber {
    /// `None` once the subscriber is closing; dropping the sender lets the
    /// connection task drain what is queued and then finish.
    tx: Option<mpsc::Sender<SensorPayload>>,
    status: SubscriberStatus,
}

impl Subscriber {
    fn advance(&mut self, id: SubscriberId, next: SubscriberStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(subscriber = %id, from = ?self.status, to = ?next, "refused status transition");
            return false;
        }
        self.status = next;
        if next != SubscriberStatus::Open {
            self.tx = None;
        }
        true
    }
}

/// Handed to the connection task when a client joins.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub rx: mpsc::Receiver<SensorPayload>,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

pub struct SubscriberRegistry {
    next_id: u64,
    capacity: usize,
    subscribers: HashMap<SubscriberId, Subscriber>,
}

impl SubscriberRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            next_id: 0,
            capacity: capacity.max(1),
            subscribers: HashMap::new(),
        }
    }

    /// Register a new connection, queueing `current` to it first if present.
    pub fn add(&mut self, current: Option<&SensorPayload>) -> Subscription {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        let (tx, rx) = mpsc::channel(self.capacity);

        let mut subscriber = Subscriber {
            tx: Some(tx),
            status: SubscriberStatus::Connecting,
        };

        if let (Some(payload), Some(tx)) = (current, subscriber.tx.as_ref()) {
            // Fresh queue with capacity >= 1, cannot be full or closed.
            let _ = tx.try_send(payload.clone());
            tracing::debug!(subscriber = %id, "queued cached value");
        }
        subscriber.advance(id, SubscriberStatus::Open);

        self.subscribers.insert(id, subscriber);
        tracing::debug!(subscriber = %id, total = self.subscribers.len(), "subscriber added");
        Subscription { id, rx }
    }

    /// Hand out a subscription that is already closed and never registered,
    /// for clients arriving after shutdown began.
    pub fn add_closed(&mut self) -> Subscription {
        self.next_id += 1;
        let id = SubscriberId(self.next_id);
        let (_, rx) = mpsc::channel(1);
        tracing::debug!(subscriber = %id, "refused subscriber, relay closing");
        Subscription { id, rx }
    }

    /// Remove a subscriber. Returns whether it was still registered; calling
    /// it again is harmless.
    pub fn remove(&mut self, id: SubscriberId) -> bool {
        match self.subscribers.remove(&id) {
            Some(mut subscriber) => {
                subscriber.advance(id, SubscriberStatus::Closed);
                tracing::debug!(subscriber = %id, total = self.subscribers.len(), "subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Move an open subscriber to `Closing` and close its queue.
    pub fn begin_close(&mut self, id: SubscriberId) -> bool {
        self.subscribers
            .get_mut(&id)
            .is_some_and(|s| s.advance(id, SubscriberStatus::Closing))
    }

    pub fn begin_close_all(&mut self) -> usize {
        let open: Vec<_> = self
            .subscribers
            .iter()
            .filter(|(_, s)| s.status == SubscriberStatus::Open)
            .map(|(id, _)| *id)
            .collect();
        open.into_iter().filter(|id| self.begin_close(*id)).count()
    }

    /// Queue `payload` to every open subscriber. Subscribers that cannot take
    /// it are removed and the rest still get it.
    pub fn broadcast(&mut self, payload: &SensorPayload) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut failed = Vec::new();

        for (id, subscriber) in &self.subscribers {
            if subscriber.status != SubscriberStatus::Open {
                continue;
            }
            let Some(tx) = subscriber.tx.as_ref() else {
                continue;
            };
            match tx.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber = %id, "subscriber gone, dropping");
                    failed.push(*id);
                }
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(subscriber = %id, "subscriber queue full, dropping");
                    failed.push(*id);
                }
            }
        }

        for id in failed {
            self.remove(id);
            report.dropped += 1;
        }
        report
    }

    /// Status of a subscriber; unknown ids are `Closed`.
    pub fn status(&self, id: SubscriberId) -> SubscriberStatus {
        self.subscribers
            .get(&id)
            .map_or(SubscriberStatus::Closed, |s| s.status)
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

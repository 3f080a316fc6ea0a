pub mod mqtt;

use crate::message::Message;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// A message leaving the node because no local module subscribes to its
/// topic.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub topic: String,
    pub message: Message,
}

/// Outcome of a publish call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(usize),
    Forwarded,
    Dropped,
}

/// In-process publish/subscribe bus binding module names to topics.
#[derive(Clone, Default)]
pub struct Intercom {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>>,
    remote: RwLock<Option<mpsc::UnboundedSender<Outbound>>>,
    in_flight: Arc<InFlight>,
}

#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

/// Keeps a delivered message counted as in flight until dropped.
pub struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl InFlightGuard {
    fn new(tracker: &Arc<InFlight>) -> Self {
        tracker.count.fetch_add(1, Ordering::SeqCst);
        Self {
            tracker: tracker.clone(),
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// A delivered message. It counts as in flight until dropped, so a receiver
/// that forwards should publish before letting go of the envelope.
pub struct Envelope {
    pub topic: String,
    pub message: Message,
    _guard: InFlightGuard,
}

impl Envelope {
    pub fn into_parts(self) -> (Message, InFlightGuard) {
        (self.message, self._guard)
    }
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("topic", &self.topic)
            .field("message", &self.message.kind_label())
            .finish()
    }
}

pub struct Subscription {
    name: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

impl Subscription {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }
}

impl Intercom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `name` to its own topic plus `extra_topics`. All topics
    /// feed the same FIFO queue.
    pub fn subscribe(&self, name: &str, extra_topics: &[String]) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.inner.topics.write();
        topics.entry(name.to_string()).or_default().push(tx.clone());
        for topic in extra_topics {
            if topic != name {
                topics.entry(topic.clone()).or_default().push(tx.clone());
            }
        }
        Subscription {
            name: name.to_string(),
            rx,
        }
    }

    pub fn has_subscriber(&self, topic: &str) -> bool {
        self.inner
            .topics
            .read()
            .get(topic)
            .is_some_and(|subs| subs.iter().any(|tx| !tx.is_closed()))
    }

    /// Routes topics without a local subscriber to `remote` instead of
    /// dropping them.
    pub fn set_remote(&self, remote: mpsc::UnboundedSender<Outbound>) {
        *self.inner.remote.write() = Some(remote);
    }

    pub fn publish(&self, topic: &str, message: Message) -> Delivery {
        let message = match self.deliver(topic, message) {
            Ok(count) => return Delivery::Delivered(count),
            Err(message) => message,
        };

        if let Some(remote) = self.inner.remote.read().as_ref() {
            let outbound = Outbound {
                topic: topic.to_string(),
                message,
            };
            return match remote.send(outbound) {
                Ok(()) => Delivery::Forwarded,
                Err(mpsc::error::SendError(outbound)) => {
                    tracing::debug!(topic, "remote bridge is gone");
                    log_dropped(topic, &outbound.message);
                    Delivery::Dropped
                }
            };
        }

        log_dropped(topic, &message);
        Delivery::Dropped
    }

    /// Delivers to local subscribers only. Used for messages that arrived
    /// from the remote bridge.
    pub fn publish_local(&self, topic: &str, message: Message) -> Delivery {
        match self.deliver(topic, message) {
            Ok(count) => Delivery::Delivered(count),
            Err(message) => {
                log_dropped(topic, &message);
                Delivery::Dropped
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.count.load(Ordering::SeqCst)
    }

    /// Waits until every delivered envelope has been dropped or `grace`
    /// elapses. Returns whether the bus went idle.
    pub async fn drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let notified = self.inner.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight() == 0;
            }
        }
    }

    fn deliver(&self, topic: &str, message: Message) -> Result<usize, Message> {
        let (delivered, stale) = {
            let topics = self.inner.topics.read();
            let Some(subscribers) = topics.get(topic) else {
                return Err(message);
            };
            let mut delivered = 0;
            let mut stale = false;
            for tx in subscribers {
                let envelope = Envelope {
                    topic: topic.to_string(),
                    message: message.clone(),
                    _guard: InFlightGuard::new(&self.inner.in_flight),
                };
                if tx.send(envelope).is_ok() {
                    delivered += 1;
                } else {
                    stale = true;
                }
            }
            (delivered, stale)
        };
        if stale {
            self.prune(topic);
        }
        if delivered == 0 {
            Err(message)
        } else {
            Ok(delivered)
        }
    }

    /// Forgets senders whose subscription has been dropped.
    fn prune(&self, topic: &str) {
        let mut topics = self.inner.topics.write();
        if let Some(subscribers) = topics.get_mut(topic) {
            subscribers.retain(|tx| !tx.is_closed());
            if subscribers.is_empty() {
                topics.remove(topic);
            }
        }
        tracing::debug!(topic, "pruned closed subscriptions");
    }
}

fn log_dropped(topic: &str, message: &Message) {
    match message {
        Message::Observation(obs) => tracing::warn!(
            topic,
            observation = %obs.name,
            id = %obs.id,
            "no subscriber for topic; observation dropped"
        ),
        Message::Notification(n) => {
            tracing::debug!(topic, kind = n.kind.tag(), "no subscriber for notification")
        }
    }
}

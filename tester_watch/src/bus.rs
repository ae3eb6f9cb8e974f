// THEORY:
// Components talk only through a topic-based publish/subscribe bus. The real
// transport is somebody else's concern; this module fixes its interface
// (`MessageBus`) and provides the in-process implementation used by the
// runner and the tests.
//
// Delivery is at-most-once. A publish with no subscribers is not an error, a
// subscriber that falls behind loses the oldest messages, and nothing is ever
// redelivered. Subscriptions use `*` as a single-segment wildcard, so
// `tester.*.response` sees the responses of every rig in the namespace.

use thiserror::Error;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("invalid topic `{0}`")]
    InvalidTopic(String),
    #[error("invalid subscription pattern `{0}`")]
    InvalidPattern(String),
}

/// One published message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub topic: String,
    pub payload: String,
}

pub trait MessageBus: Send + Sync + 'static {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError>;
    fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError>;
}

/// Publishes and logs instead of failing.
pub fn publish_best_effort<B: MessageBus + ?Sized>(bus: &B, topic: &str, payload: String) {
    if let Err(error) = bus.publish(topic, payload) {
        warn!(%topic, %error, "publish failed");
    }
}

/// `*` matches exactly one segment; everything else must match literally.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern = pattern.split('.');
    let mut topic = topic.split('.');
    loop {
        match (pattern.next(), topic.next()) {
            (None, None) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            _ => return false,
        }
    }
}

fn well_formed(text: &str, allow_wildcard: bool) -> bool {
    text.split('.')
        .all(|segment| !segment.is_empty() && ((segment == "*" && allow_wildcard) || !segment.contains('*')))
}

/// A filtered view of the bus.
pub struct Subscription {
    pattern: String,
    receiver: broadcast::Receiver<Envelope>,
}

impl Subscription {
    pub fn new(pattern: &str, receiver: broadcast::Receiver<Envelope>) -> Result<Self, BusError> {
        if !well_formed(pattern, true) {
            return Err(BusError::InvalidPattern(pattern.to_string()));
        }
        Ok(Self {
            pattern: pattern.to_string(),
            receiver,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Next matching message, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.recv().await {
                Ok(envelope) if topic_matches(&self.pattern, &envelope.topic) => return Some(envelope),
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    warn!(pattern = %self.pattern, missed, "subscriber lagged, messages dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next matching message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        loop {
            match self.receiver.try_recv() {
                Ok(envelope) if topic_matches(&self.pattern, &envelope.topic) => return Some(envelope),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(missed)) => {
                    warn!(pattern = %self.pattern, missed, "subscriber lagged, messages dropped");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return None,
            }
        }
    }
}

/// In-process bus backed by a single broadcast channel.
#[derive(Clone)]
pub struct InMemoryBus {
    sender: broadcast::Sender<Envelope>,
}

impl InMemoryBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, topic: &str, payload: String) -> Result<(), BusError> {
        if !well_formed(topic, false) {
            return Err(BusError::InvalidTopic(topic.to_string()));
        }
        debug!(%topic, %payload, "publish");
        let envelope = Envelope {
            topic: topic.to_string(),
            payload,
        };
        if self.sender.send(envelope).is_err() {
            debug!(%topic, "no subscribers");
        }
        Ok(())
    }

    fn subscribe(&self, pattern: &str) -> Result<Subscription, BusError> {
        Subscription::new(pattern, self.sender.subscribe())
    }
}

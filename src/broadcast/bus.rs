//! Pub/sub bus consumed by the broadcast channel.
//!
//! Bus failures are reported with the shared store's error type; in
//! production both are the same Redis-like backend.

use std::future::Future;

use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::store::StoreResult;

/// What a subscription yields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusMessage {
    Payload(String),
    /// The subscriber fell behind and this many messages were dropped
    Lagged(u64),
}

/// One open subscription. `recv` returning `None` means the subscription
/// closed (bus reconnect, topic torn down) and must be reopened.
pub trait BusSubscription: Send + 'static {
    fn recv(&mut self) -> impl Future<Output = Option<BusMessage>> + Send;
}

/// Topic-based publish/subscribe shared by every process.
pub trait PubSub: Send + Sync + 'static {
    type Subscription: BusSubscription;

    /// Publish `message` on `topic`, returning how many subscribers got it.
    fn publish(
        &self,
        topic: &str,
        message: String,
    ) -> impl Future<Output = StoreResult<usize>> + Send;

    fn subscribe(&self, topic: &str) -> impl Future<Output = StoreResult<Self::Subscription>> + Send;
}

const DEFAULT_TOPIC_CAPACITY: usize = 1024;

/// In-process bus built on `tokio::sync::broadcast`, one channel per topic.
pub struct MemoryPubSub {
    topics: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }

    /// Bus whose subscribers lag once `capacity` messages are unread.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Drop a topic, closing every subscription to it (simulates a reconnect).
    pub fn close_topic(&self, topic: &str) {
        self.topics.remove(topic);
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}

impl PubSub for MemoryPubSub {
    type Subscription = MemorySubscription;

    async fn publish(&self, topic: &str, message: String) -> StoreResult<usize> {
        let Some(sender) = self.topics.get(topic) else {
            return Ok(0);
        };
        // A send error only means nobody is listening.
        Ok(sender.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> StoreResult<MemorySubscription> {
        let receiver = self
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Ok(MemorySubscription { receiver })
    }
}

pub struct MemorySubscription {
    receiver: broadcast::Receiver<String>,
}

impl BusSubscription for MemorySubscription {
    async fn recv(&mut self) -> Option<BusMessage> {
        match self.receiver.recv().await {
            Ok(payload) => Some(BusMessage::Payload(payload)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some(BusMessage::Lagged(skipped)),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

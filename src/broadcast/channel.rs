use std::sync::Arc;
use std::time::Duration;

use super::wire::{BroadcastDecodeError, WireMessage};
use super::{BusMessage, BusSubscription, PubSub};
use crate::document::DocumentId;
use crate::error::{SyncError, SyncResult};
use crate::updates::AppliedUpdate;

const LOG_TARGET: &str = "collab_sync::broadcast";

/// Pause before retrying a failed re-subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);

/// Topic carrying a document's applied operations.
pub fn topic_for(doc_id: &DocumentId) -> String {
    format!("applied-ops:{}", doc_id)
}

/// Something a document subscriber needs to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    Update(AppliedUpdate),
    /// An op for this document was refused; clients' optimistic state is stale
    Rejected { doc_id: DocumentId, message: String },
    Undecodable(BroadcastDecodeError),
    /// Messages may have been lost (bus lag or resubscription)
    Interrupted,
}

/// Publishes applied operations and opens per-document update streams.
pub struct BroadcastChannel<P> {
    bus: Arc<P>,
}

impl<P> Clone for BroadcastChannel<P> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
        }
    }
}

impl<P: PubSub> BroadcastChannel<P> {
    pub fn new(bus: Arc<P>) -> Self {
        Self { bus }
    }

    /// Publish an applied update on its document's topic.
    ///
    /// Returns the number of subscribers that received it.
    pub async fn publish(&self, update: &AppliedUpdate) -> SyncResult<usize> {
        self.send(&update.doc_id, WireMessage::Applied(update.clone()))
            .await
    }

    /// Tell every subscriber of `doc_id` that an update was refused.
    pub async fn publish_rejection(&self, doc_id: &DocumentId, message: &str) -> SyncResult<usize> {
        self.send(
            doc_id,
            WireMessage::UpdateRejected {
                doc_id: doc_id.clone(),
                message: message.to_string(),
            },
        )
        .await
    }

    async fn send(&self, doc_id: &DocumentId, message: WireMessage) -> SyncResult<usize> {
        let payload = message
            .encode()
            .map_err(|e| SyncError::malformed(doc_id.as_str(), e.to_string()))?;
        let topic = topic_for(doc_id);
        let receivers = self
            .bus
            .publish(&topic, payload)
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "publishing to the bus", e))?;
        log::trace!(
            target: LOG_TARGET,
            "Published on {} to {} subscriber(s)",
            topic,
            receivers
        );
        Ok(receivers)
    }

    /// Open the update stream of `doc_id`.
    ///
    /// The bus subscription is in place when this returns, so nothing
    /// published afterwards is missed.
    pub async fn subscribe(&self, doc_id: &DocumentId) -> SyncResult<UpdateStream<P>> {
        let topic = topic_for(doc_id);
        let subscription = self
            .bus
            .subscribe(&topic)
            .await
            .map_err(|e| SyncError::store(doc_id.as_str(), "subscribing to the bus", e))?;
        Ok(UpdateStream {
            bus: Arc::clone(&self.bus),
            topic,
            subscription: Some(subscription),
            resubscribed: false,
        })
    }
}

/// Endless stream of a document's broadcast events.
pub struct UpdateStream<P: PubSub> {
    bus: Arc<P>,
    topic: String,
    subscription: Option<P::Subscription>,
    resubscribed: bool,
}

impl<P: PubSub> UpdateStream<P> {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next event.
    ///
    /// A closed bus subscription is reopened transparently; the first event
    /// after that is `Interrupted` because messages may have been missed.
    pub async fn next(&mut self) -> BroadcastEvent {
        loop {
            let Some(subscription) = self.subscription.as_mut() else {
                self.resubscribe().await;
                if std::mem::take(&mut self.resubscribed) {
                    return BroadcastEvent::Interrupted;
                }
                continue;
            };

            match subscription.recv().await {
                Some(BusMessage::Payload(payload)) => return self.decode(&payload),
                Some(BusMessage::Lagged(skipped)) => {
                    log::warn!(
                        target: LOG_TARGET,
                        "Subscriber on {} lagged, {} message(s) lost",
                        self.topic,
                        skipped
                    );
                    return BroadcastEvent::Interrupted;
                }
                None => {
                    log::debug!(
                        target: LOG_TARGET,
                        "Subscription to {} closed, resubscribing",
                        self.topic
                    );
                    self.subscription = None;
                }
            }
        }
    }

    async fn resubscribe(&mut self) {
        match self.bus.subscribe(&self.topic).await {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.resubscribed = true;
            }
            Err(e) => {
                log::warn!(
                    target: LOG_TARGET,
                    "Resubscribing to {} failed: {}",
                    self.topic,
                    e
                );
                tokio::time::sleep(RESUBSCRIBE_DELAY).await;
            }
        }
    }

    fn decode(&self, payload: &str) -> BroadcastEvent {
        match WireMessage::decode(&self.topic, payload) {
            Ok(WireMessage::Applied(update)) => BroadcastEvent::Update(update),
            Ok(WireMessage::UpdateRejected { doc_id, message }) => {
                BroadcastEvent::Rejected { doc_id, message }
            }
            Err(e) => BroadcastEvent::Undecodable(e),
        }
    }
}

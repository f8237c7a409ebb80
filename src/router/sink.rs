use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::document::{DocumentId, EditOperation};

/// Message pushed to one client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Sent to the connection that submitted the op
    VersionAck {
        #[serde(rename = "docId")]
        doc_id: DocumentId,
        version: u64,
    },
    /// Sent to every other connection on the document
    ApplyUpdate {
        #[serde(rename = "docId")]
        doc_id: DocumentId,
        version: u64,
        op: EditOperation,
    },
    /// The client's copy can no longer be trusted; it must reload the document
    ForceResync {
        #[serde(rename = "docId")]
        doc_id: DocumentId,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection closed")]
    Closed,
    #[error("connection buffer full")]
    Full,
}

/// Outbound side of a client connection, owned by the socket layer.
///
/// `deliver` must not block; a sink that cannot take a message right away
/// reports an error and is dropped by the router.
pub trait ConnectionSink: Send + Sync {
    fn deliver(&self, message: ClientMessage) -> Result<(), DeliveryError>;
}

impl ConnectionSink for mpsc::Sender<ClientMessage> {
    fn deliver(&self, message: ClientMessage) -> Result<(), DeliveryError> {
        self.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bounded_sender_reports_full_then_closed() {
        let (tx, rx) = mpsc::channel(1);
        let resync = ClientMessage::ForceResync {
            doc_id: DocumentId::new("d1"),
            reason: "test".into(),
        };

        assert_eq!(tx.deliver(resync.clone()), Ok(()));
        assert_eq!(tx.deliver(resync.clone()), Err(DeliveryError::Full));

        drop(rx);
        assert_eq!(tx.deliver(resync), Err(DeliveryError::Closed));
    }

    #[test]
    fn messages_serialize_with_type_tag() {
        let ack = ClientMessage::VersionAck {
            doc_id: DocumentId::new("d1"),
            version: 4,
        };
        assert_eq!(
            serde_json::to_value(ack).unwrap(),
            json!({"type": "versionAck", "docId": "d1", "version": 4})
        );
    }
}

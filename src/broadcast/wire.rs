//! JSON messages carried on the `applied-ops:{doc}` topics.
//!
//! ```json
//! {"type":"applied","docId":"d1","version":7,"op":{"op":[{"p":0,"i":"a"}],"v":6},"source":"c1"}
//! {"type":"updateRejected","docId":"d1","message":"delete at 3 does not match document text"}
//! ```

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::document::DocumentId;
use crate::updates::AppliedUpdate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub(crate) enum WireMessage {
    Applied(AppliedUpdate),
    UpdateRejected {
        #[serde(rename = "docId")]
        doc_id: DocumentId,
        message: String,
    },
}

/// A payload on a document topic that is not a valid wire message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Undecodable broadcast on {topic}: {reason}")]
pub struct BroadcastDecodeError {
    pub topic: String,
    pub reason: String,
}

impl WireMessage {
    pub(crate) fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub(crate) fn decode(topic: &str, payload: &str) -> Result<Self, BroadcastDecodeError> {
        serde_json::from_str(payload).map_err(|e| BroadcastDecodeError {
            topic: topic.to_string(),
            reason: e.to_string(),
        })
    }
}

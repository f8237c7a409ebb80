//! Edit operations as they travel through the queue and the broadcast bus.
//!
//! The JSON shape keeps the short field names used on the wire
//! (`{"op": [{"p": 4, "i": "foo"}], "v": 12, "meta": {...}}`) while the Rust
//! side gets descriptive names. Unknown top-level fields survive a round trip
//! through `extra`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ConnectionId;

/// A single component of an edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpComponent {
    /// Insert `text` at char offset `position`.
    Insert {
        #[serde(rename = "p")]
        position: usize,
        #[serde(rename = "i")]
        text: String,
    },
    /// Delete `text`, which must currently start at `position`.
    Delete {
        #[serde(rename = "p")]
        position: usize,
        #[serde(rename = "d")]
        text: String,
    },
    /// Attach comment thread `thread_id` to `text` at `position`.
    Comment {
        #[serde(rename = "p")]
        position: usize,
        #[serde(rename = "c")]
        text: String,
        #[serde(rename = "t")]
        thread_id: String,
    },
}

impl OpComponent {
    pub fn position(&self) -> usize {
        match self {
            OpComponent::Insert { position, .. }
            | OpComponent::Delete { position, .. }
            | OpComponent::Comment { position, .. } => *position,
        }
    }

    fn strings(&self) -> Vec<&str> {
        match self {
            OpComponent::Insert { text, .. } | OpComponent::Delete { text, .. } => vec![text],
            OpComponent::Comment {
                text, thread_id, ..
            } => vec![text, thread_id],
        }
    }
}

/// Who produced an operation and when.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpMeta {
    /// Connection that submitted the op
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ConnectionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Milliseconds since the epoch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<u64>,
}

/// A client edit queued for application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditOperation {
    #[serde(rename = "op")]
    pub components: Vec<OpComponent>,
    /// Document version the client based this edit on
    #[serde(rename = "v")]
    pub base_version: u64,
    #[serde(default)]
    pub meta: OpMeta,
    /// Sources this op may already have been submitted under (resubmission after reconnect)
    #[serde(
        rename = "dupIfSource",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub dup_if_source: Vec<ConnectionId>,
    /// Unknown fields, passed through untouched
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EditOperation {
    pub fn new(components: Vec<OpComponent>, base_version: u64) -> Self {
        Self {
            components,
            base_version,
            meta: OpMeta::default(),
            dup_if_source: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn insert(position: usize, text: impl Into<String>, base_version: u64) -> Self {
        Self::new(
            vec![OpComponent::Insert {
                position,
                text: text.into(),
            }],
            base_version,
        )
    }

    pub fn delete(position: usize, text: impl Into<String>, base_version: u64) -> Self {
        Self::new(
            vec![OpComponent::Delete {
                position,
                text: text.into(),
            }],
            base_version,
        )
    }

    pub fn with_source(mut self, source: impl Into<ConnectionId>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    pub fn with_dup_if_source(mut self, sources: Vec<ConnectionId>) -> Self {
        self.dup_if_source = sources;
        self
    }

    pub fn source(&self) -> Option<&ConnectionId> {
        self.meta.source.as_ref()
    }

    /// Name of the first field carrying a NUL character, if any.
    ///
    /// NUL bytes break the framing of the persisted queue, so such ops are
    /// refused before they are enqueued.
    pub fn find_nul(&self) -> Option<String> {
        for (index, component) in self.components.iter().enumerate() {
            if component.strings().iter().any(|s| s.contains('\0')) {
                return Some(format!("op[{}]", index));
            }
        }
        let meta_strings = [
            self.meta.source.as_ref().map(ConnectionId::as_str),
            self.meta.user_id.as_deref(),
        ];
        if meta_strings.into_iter().flatten().any(|s| s.contains('\0')) {
            return Some("meta".to_string());
        }
        if self.dup_if_source.iter().any(|s| s.as_str().contains('\0')) {
            return Some("dupIfSource".to_string());
        }
        self.extra
            .iter()
            .find(|(key, value)| key.contains('\0') || value_has_nul(value))
            .map(|(key, _)| key.clone())
    }
}

fn value_has_nul(value: &Value) -> bool {
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(value_has_nul),
        Value::Object(map) => map
            .iter()
            .any(|(key, value)| key.contains('\0') || value_has_nul(value)),
        _ => false,
    }
}

/// Byte index of char offset `char_pos` in `text`, or `None` past the end.
pub(crate) fn byte_index(text: &str, char_pos: usize) -> Option<usize> {
    if char_pos == 0 {
        return Some(0);
    }
    text.char_indices()
        .map(|(index, _)| index)
        .chain(std::iter::once(text.len()))
        .nth(char_pos)
}

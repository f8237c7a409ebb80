//! Comment and tracked-change ranges, and their projection into history.
//!
//! Positions are char offsets into the document text. Ranges normally live
//! in "current" coordinates, where tracked deletions are already gone from
//! the text. History views need "full history" coordinates, where deleted
//! text is still present; [`to_history_ranges`] converts between the two
//! and [`add_tracked_deletes_to_content`] rebuilds the matching text.

mod content;
mod history;

pub use content::add_tracked_deletes_to_content;
pub use history::to_history_ranges;

use serde::{Deserialize, Serialize};

/// Half-open span `[from, to)` of char offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub from: usize,
    pub to: usize,
}

impl Range {
    /// Span between `a` and `b`, in whichever order they are given.
    pub fn new(a: usize, b: usize) -> Self {
        Self {
            from: a.min(b),
            to: a.max(b),
        }
    }

    pub fn at(position: usize, len: usize) -> Self {
        Self {
            from: position,
            to: position + len,
        }
    }

    pub fn len(&self) -> usize {
        self.to - self.from
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    pub fn contains(&self, position: usize) -> bool {
        self.from <= position && position < self.to
    }

    pub fn overlaps(&self, other: &Range) -> bool {
        self.from < other.to && other.from < self.to
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// ISO-8601 timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<String>,
}

/// Edit of a tracked change. `hpos` is the position in history coordinates
/// when it differs from `position`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChangeOp {
    Insert {
        #[serde(rename = "p")]
        position: usize,
        #[serde(rename = "i")]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hpos: Option<usize>,
    },
    Delete {
        #[serde(rename = "p")]
        position: usize,
        #[serde(rename = "d")]
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hpos: Option<usize>,
    },
}

impl ChangeOp {
    pub fn insert(position: usize, text: impl Into<String>) -> Self {
        ChangeOp::Insert {
            position,
            text: text.into(),
            hpos: None,
        }
    }

    pub fn delete(position: usize, text: impl Into<String>) -> Self {
        ChangeOp::Delete {
            position,
            text: text.into(),
            hpos: None,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            ChangeOp::Insert { position, .. } | ChangeOp::Delete { position, .. } => *position,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            ChangeOp::Insert { text, .. } | ChangeOp::Delete { text, .. } => text,
        }
    }

    /// Length in chars.
    pub fn len(&self) -> usize {
        self.text().chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.text().is_empty()
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeOp::Delete { .. })
    }

    pub fn hpos(&self) -> Option<usize> {
        match self {
            ChangeOp::Insert { hpos, .. } | ChangeOp::Delete { hpos, .. } => *hpos,
        }
    }

    fn set_hpos(&mut self, value: Option<usize>) {
        match self {
            ChangeOp::Insert { hpos, .. } | ChangeOp::Delete { hpos, .. } => *hpos = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedChange {
    pub id: String,
    pub op: ChangeOp,
    #[serde(default)]
    pub metadata: RangeMetadata,
}

impl TrackedChange {
    pub fn new(id: impl Into<String>, op: ChangeOp) -> Self {
        Self {
            id: id.into(),
            op,
            metadata: RangeMetadata::default(),
        }
    }

    /// Span covered in current coordinates. Deletions are zero-width there.
    pub fn range(&self) -> Range {
        match &self.op {
            ChangeOp::Insert { position, .. } => Range::at(*position, self.op.len()),
            ChangeOp::Delete { position, .. } => Range::at(*position, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentOp {
    #[serde(rename = "p")]
    pub position: usize,
    /// Commented text
    #[serde(rename = "c")]
    pub text: String,
    #[serde(rename = "t")]
    pub thread_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hpos: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hlen: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub op: CommentOp,
    #[serde(default)]
    pub metadata: RangeMetadata,
}

impl Comment {
    pub fn new(id: impl Into<String>, position: usize, text: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            op: CommentOp {
                position,
                text: text.into(),
                thread_id: id.clone(),
                hpos: None,
                hlen: None,
            },
            id,
            metadata: RangeMetadata::default(),
        }
    }

    /// Length of the commented text in chars.
    pub fn len(&self) -> usize {
        self.op.text.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.op.text.is_empty()
    }

    pub fn range(&self) -> Range {
        Range::at(self.op.position, self.len())
    }
}

/// Every annotation of one document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ranges {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub comments: Vec<Comment>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<TrackedChange>,
}

impl Ranges {
    pub fn is_empty(&self) -> bool {
        self.comments.is_empty() && self.changes.is_empty()
    }
}

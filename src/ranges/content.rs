use super::history::sorted_deletions;
use super::{ChangeOp, TrackedChange};
use crate::document::byte_index;

/// Put the text of every tracked deletion back into `content`.
///
/// Deletions are processed in ascending position order; each reinsertion
/// shifts the ones after it. Insertions are already part of `content` and
/// are ignored. A position past the end of the text appends.
pub fn add_tracked_deletes_to_content(content: &str, changes: &[TrackedChange]) -> String {
    let mut result = content.to_string();
    let mut shift = 0;

    for change in sorted_deletions(changes) {
        let ChangeOp::Delete { position, text, .. } = &change.op else {
            continue;
        };
        let at = byte_index(&result, position + shift).unwrap_or(result.len());
        result.insert_str(at, text);
        shift += change.op.len();
    }
    result
}

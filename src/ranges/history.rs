use super::{Comment, Ranges, TrackedChange};

/// Project `ranges` from current into full-history coordinates.
///
/// Tracked changes come back sorted by position. Each one gets an `hpos`
/// shifted by the length of every tracked deletion before it. Each comment
/// is shifted by the deletions at or before its start and lengthened by the
/// deletions strictly inside it; `hpos`/`hlen` are only set when they
/// differ from `p` and the comment length. Insertions never shift anything.
pub fn to_history_ranges(ranges: &Ranges) -> Ranges {
    let mut changes = ranges.changes.clone();
    changes.sort_by_key(|change| change.op.position());

    let mut offset = 0;
    for change in &mut changes {
        let position = change.op.position();
        change.op.set_hpos((offset > 0).then_some(position + offset));
        if change.op.is_delete() {
            offset += change.op.len();
        }
    }

    let deletions: Vec<(usize, usize)> = changes
        .iter()
        .filter(|change| change.op.is_delete())
        .map(|change| (change.op.position(), change.op.len()))
        .collect();

    let comments = ranges
        .comments
        .iter()
        .map(|comment| shift_comment(comment, &deletions))
        .collect();

    Ranges { comments, changes }
}

fn shift_comment(comment: &Comment, deletions: &[(usize, usize)]) -> Comment {
    let start = comment.op.position;
    let len = comment.len();

    let mut shift = 0;
    let mut grow = 0;
    for &(position, deleted) in deletions {
        if position <= start {
            shift += deleted;
        } else if position < start + len {
            grow += deleted;
        }
    }

    let mut shifted = comment.clone();
    shifted.op.hpos = (shift > 0).then_some(start + shift);
    shifted.op.hlen = (grow > 0).then_some(len + grow);
    shifted
}

/// Tracked deletions of `changes` in ascending position order.
pub(super) fn sorted_deletions(changes: &[TrackedChange]) -> Vec<&TrackedChange> {
    let mut deletions: Vec<&TrackedChange> =
        changes.iter().filter(|change| change.op.is_delete()).collect();
    deletions.sort_by_key(|change| change.op.position());
    deletions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ranges::ChangeOp;

    fn fixture() -> Ranges {
        let changes = [
            (2, ChangeOp::delete(2, "a".repeat(5))),
            (4, ChangeOp::insert(4, "b".repeat(5))),
            (10, ChangeOp::delete(10, "c".repeat(10))),
            (21, ChangeOp::delete(21, "d".repeat(6))),
            (50, ChangeOp::delete(50, "e".repeat(7))),
        ]
        .into_iter()
        .map(|(p, op)| TrackedChange::new(format!("change-{}", p), op))
        .collect();

        let comments = [(0, 1), (10, 12), (20, 10), (15, 3)]
            .into_iter()
            .map(|(p, len)| Comment::new(format!("comment-{}", p), p, "x".repeat(len)))
            .collect();

        Ranges { comments, changes }
    }

    #[test]
    fn empty_ranges_stay_empty() {
        assert_eq!(to_history_ranges(&Ranges::default()), Ranges::default());
    }

    #[test]
    fn comments_without_tracked_changes_are_unchanged() {
        let ranges = Ranges {
            comments: vec![Comment::new("c1", 3, "abc"), Comment::new("c2", 0, "z")],
            changes: Vec::new(),
        };
        assert_eq!(to_history_ranges(&ranges), ranges);
    }

    #[test]
    fn comments_shift_and_grow_around_deletions() {
        let history = to_history_ranges(&fixture());
        let ops: Vec<(usize, Option<usize>, Option<usize>)> = history
            .comments
            .iter()
            .map(|c| (c.op.position, c.op.hpos, c.op.hlen))
            .collect();

        assert_eq!(
            ops,
            vec![
                (0, None, None),
                (10, Some(25), Some(18)),
                (20, Some(35), Some(16)),
                (15, Some(30), None),
            ]
        );
    }

    #[test]
    fn changes_shift_by_preceding_deletions_only() {
        let history = to_history_ranges(&fixture());
        let hpos: Vec<(usize, Option<usize>)> = history
            .changes
            .iter()
            .map(|c| (c.op.position(), c.op.hpos()))
            .collect();

        assert_eq!(
            hpos,
            vec![
                (2, None),
                (4, Some(9)),
                (10, Some(15)),
                (21, Some(36)),
                (50, Some(71)),
            ]
        );
    }

    #[test]
    fn changes_are_sorted_by_position() {
        let mut ranges = fixture();
        ranges.changes.reverse();

        let history = to_history_ranges(&ranges);

        let positions: Vec<usize> = history.changes.iter().map(|c| c.op.position()).collect();
        assert_eq!(positions, vec![2, 4, 10, 21, 50]);
    }

    #[test]
    fn insertions_alone_shift_nothing() {
        let ranges = Ranges {
            comments: vec![Comment::new("c1", 10, "abc")],
            changes: vec![TrackedChange::new("1", ChangeOp::insert(2, "inserted"))],
        };
        assert_eq!(to_history_ranges(&ranges), ranges);
    }

    #[test]
    fn sorted_deletions_skips_insertions() {
        let ranges = fixture();
        let positions: Vec<usize> = sorted_deletions(&ranges.changes)
            .iter()
            .map(|c| c.op.position())
            .collect();
        assert_eq!(positions, vec![2, 10, 21, 50]);
    }
}

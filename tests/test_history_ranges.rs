//! History-coordinate conversion of ranges loaded from their JSON form.

use collab_sync::ranges::{Ranges, TrackedChange, add_tracked_deletes_to_content, to_history_ranges};
use serde_json::json;

#[test]
fn empty_ranges_convert_to_empty_ranges() {
    let ranges: Ranges = serde_json::from_value(json!({})).unwrap();
    let history = to_history_ranges(&ranges);
    assert_eq!(serde_json::to_value(&history).unwrap(), json!({}));
}

#[test]
fn json_fixture_gets_history_positions() {
    let ranges: Ranges = serde_json::from_value(json!({
        "changes": [
            {"id": "5", "op": {"p": 50, "d": "eeeeeee"}},
            {"id": "1", "op": {"p": 2, "d": "aaaaa"}},
            {"id": "2", "op": {"p": 4, "i": "bbbbb"}},
            {"id": "3", "op": {"p": 10, "d": "cccccccccc"}},
            {"id": "4", "op": {"p": 21, "d": "dddddd"}}
        ],
        "comments": [
            {"id": "c1", "op": {"p": 0, "c": "x", "t": "c1"}},
            {"id": "c2", "op": {"p": 10, "c": "xxxxxxxxxxxx", "t": "c2"}},
            {"id": "c3", "op": {"p": 20, "c": "xxxxxxxxxx", "t": "c3"}},
            {"id": "c4", "op": {"p": 15, "c": "xxx", "t": "c4"}}
        ]
    }))
    .unwrap();

    let history = serde_json::to_value(to_history_ranges(&ranges)).unwrap();

    assert_eq!(
        history,
        json!({
            "comments": [
                {"id": "c1", "op": {"p": 0, "c": "x", "t": "c1"}, "metadata": {}},
                {"id": "c2", "op": {"p": 10, "c": "xxxxxxxxxxxx", "t": "c2", "hpos": 25, "hlen": 18}, "metadata": {}},
                {"id": "c3", "op": {"p": 20, "c": "xxxxxxxxxx", "t": "c3", "hpos": 35, "hlen": 16}, "metadata": {}},
                {"id": "c4", "op": {"p": 15, "c": "xxx", "t": "c4", "hpos": 30}, "metadata": {}}
            ],
            "changes": [
                {"id": "1", "op": {"p": 2, "d": "aaaaa"}, "metadata": {}},
                {"id": "2", "op": {"p": 4, "i": "bbbbb", "hpos": 9}, "metadata": {}},
                {"id": "3", "op": {"p": 10, "d": "cccccccccc", "hpos": 15}, "metadata": {}},
                {"id": "4", "op": {"p": 21, "d": "dddddd", "hpos": 36}, "metadata": {}},
                {"id": "5", "op": {"p": 50, "d": "eeeeeee", "hpos": 71}, "metadata": {}}
            ]
        })
    );
}

#[test]
fn history_content_matches_history_ranges() {
    let changes: Vec<TrackedChange> = serde_json::from_value(json!([
        {"id": "1", "op": {"p": 4, "d": "quick "}},
        {"id": "2", "op": {"p": 5, "i": "brown "}},
        {"id": "3", "op": {"p": 29, "d": "lazy "}}
    ]))
    .unwrap();
    let content = "the brown fox jumps over the dog";

    let full = add_tracked_deletes_to_content(content, &changes);
    assert_eq!(full, "the quick brown fox jumps over the lazy dog");

    // Each deletion's history position points at its text in the full content.
    let history = to_history_ranges(&Ranges {
        comments: Vec::new(),
        changes,
    });
    for change in history.changes.iter().filter(|c| c.op.is_delete()) {
        let start = change.op.hpos().unwrap_or(change.op.position());
        let found: String = full.chars().skip(start).take(change.op.len()).collect();
        assert_eq!(found, change.op.text());
    }
}

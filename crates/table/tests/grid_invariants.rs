//! Property tests for the entity grid: sort stability, set-expansion
//! faithfulness, and session monotonicity.

use cohort_core::TextTable;
use cohort_table::{insert_event, ColumnType, EntityGrid, GridMap, Schema, ZOrderMap};
use proptest::prelude::*;
use std::sync::Arc;

const GAP_MS: i64 = 30 * 60 * 1000;

fn setup() -> (Schema, EntityGrid, ZOrderMap, TextTable) {
    let mut schema = Schema::new();
    schema.add("fruit", ColumnType::Text, false).unwrap();
    schema.add("tags", ColumnType::Text, true).unwrap();
    let map = Arc::new(GridMap::map_table(&schema, None));
    let grid = EntityGrid::new(map, "prop@test", GAP_MS);
    (schema, grid, ZOrderMap::new(), TextTable::new())
}

prop_compose! {
    fn arb_event()(
        stamp in 0i64..200_000_000_000i64,
        event_ix in 0usize..4,
        fruit_ix in 0usize..5,
        tag_count in 0usize..4,
    ) -> serde_json::Value {
        let events = ["purchase", "view", "signup", "refund"];
        let fruits = ["orange", "apple", "pear", "banana", "plum"];
        let tags: Vec<&str> = ["red", "ripe", "round"].into_iter().take(tag_count).collect();
        let mut payload = serde_json::json!({ "fruit": fruits[fruit_ix] });
        if !tags.is_empty() {
            payload["tags"] = serde_json::json!(tags);
        }
        serde_json::json!({
            "id": "prop@test",
            "stamp": stamp,
            "event": events[event_ix],
            "_": payload,
        })
    }
}

proptest! {
    // P1: after any insert sequence the grid is sorted by
    // (stamp, z_order, event); re-sorting changes nothing
    #[test]
    fn sorted_by_row_key(events in prop::collection::vec(arb_event(), 1..40)) {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        for ev in &events {
            insert_event(&mut grid, &schema, &mut zorder, &mut texts, ev).unwrap();
        }
        let keys: Vec<(i64, i32, i64)> = (0..grid.row_count())
            .map(|i| { let r = grid.row(i); (r.stamp, r.z, r.event) })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        prop_assert_eq!(keys, sorted);
    }

    // P2: a set-valued column of size k produces exactly k physical rows
    // differing only in that column, and collapsing reproduces the set
    #[test]
    fn set_expansion_faithful(tag_count in 1usize..4, stamp in 1i64..1_000_000i64) {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        let all_tags = ["red", "ripe", "round"];
        let tags: Vec<&str> = all_tags.into_iter().take(tag_count).collect();
        let ev = serde_json::json!({
            "id": "prop@test", "stamp": stamp, "event": "label",
            "_": { "tags": tags }
        });
        insert_event(&mut grid, &schema, &mut zorder, &mut texts, &ev).unwrap();
        prop_assert_eq!(grid.row_count(), tag_count);
        let tags_col = schema.get_by_name("tags").unwrap().id;
        for i in 0..grid.row_count() {
            prop_assert_eq!(grid.row(i).stamp, grid.row(0).stamp);
            prop_assert_eq!(grid.row(i).event, grid.row(0).event);
            prop_assert_eq!(grid.set_values(i, tags_col).len(), tag_count);
        }
    }

    // P3: session numbers are monotonic; they advance exactly when the
    // stamp gap exceeds the configured session gap
    #[test]
    fn sessions_monotonic(events in prop::collection::vec(arb_event(), 1..40)) {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        for ev in &events {
            insert_event(&mut grid, &schema, &mut zorder, &mut texts, ev).unwrap();
        }
        prop_assert!(grid.session(0) == 1);
        for i in 0..grid.row_count() - 1 {
            let gap = grid.row(i + 1).stamp - grid.row(i).stamp;
            let same = grid.session(i + 1) == grid.session(i);
            prop_assert!(grid.session(i) <= grid.session(i + 1));
            if gap > GAP_MS {
                prop_assert!(!same);
            } else {
                prop_assert!(same);
            }
        }
    }
}

//! Cross-partition scenarios: grouped tallies, index pruning, stamp
//! windows, sessions, segments, and output determinism.

use cohort_core::RuntimeConfig;
use cohort_engine::{Database, QueryOptions, Table};
use cohort_segment::SegmentChange;
use cohort_table::schema::ColumnType;
use std::sync::Arc;
use std::time::Duration;

fn config(partitions: usize, workers: usize) -> RuntimeConfig {
    RuntimeConfig {
        partitions,
        workers,
        ..RuntimeConfig::default()
    }
}

fn shop_table(cfg: RuntimeConfig) -> Arc<Table> {
    let db = Database::new(cfg);
    let table = db.create_table("shop").unwrap();
    table.add_column("fruit", ColumnType::Text, false).unwrap();
    table.add_column("price", ColumnType::Double, false).unwrap();
    table
}

fn insert_purchases(table: &Table) {
    table
        .insert_json(
            r#"[
        {"id": "user1@test.com", "stamp": 1458820830, "event": "purchase",
         "_": {"fruit": "orange", "price": 5.55}},
        {"id": "user1@test.com", "stamp": 1458820831, "event": "purchase",
         "_": {"fruit": "apple", "price": 9.95}},
        {"id": "user1@test.com", "stamp": 1458820832, "event": "purchase",
         "_": {"fruit": "pear", "price": 12.49}},
        {"id": "user1@test.com", "stamp": 1458820833, "event": "purchase",
         "_": {"fruit": "banana", "price": 2.49}},
        {"id": "user1@test.com", "stamp": 1458820834, "event": "purchase",
         "_": {"fruit": "orange", "price": 5.55}}
    ]"#,
        )
        .unwrap();
}

const TALLY_QUERY: &str = r#"
    select
      count id
      count fruit
      sum price
    end
    each_row where event == "purchase"
      << fruit
    end
"#;

fn group<'a>(result: &'a serde_json::Value, key: &str) -> &'a serde_json::Value {
    result["_"]
        .as_array()
        .unwrap()
        .iter()
        .find(|g| g["g"] == key)
        .unwrap_or_else(|| panic!("no group `{}` in {}", key, result))
}

// S1: grouped tally with dedup — the orange group counts one entity,
// two rows, and 11.10 of price
#[test]
fn test_complex_tally() {
    let table = shop_table(config(4, 2));
    insert_purchases(&table);
    let result = table.query(TALLY_QUERY).unwrap();

    let groups = result["_"].as_array().unwrap();
    assert_eq!(groups.len(), 4);

    let orange = group(&result, "orange");
    let cells = orange["c"].as_array().unwrap();
    assert_eq!(cells[0], 1);
    assert_eq!(cells[1], 2);
    assert!((cells[2].as_f64().unwrap() - 11.10).abs() < 1e-9);

    for fruit in ["apple", "pear", "banana"] {
        let cells = group(&result, fruit)["c"].as_array().unwrap();
        assert_eq!(cells[0], 1);
        assert_eq!(cells[1], 1);
    }
}

// S2: `.ever` / `.never` prune through the bit index, and the pruning
// expression is countable (exact)
#[test]
fn test_ever_never_pruning() {
    let table = shop_table(config(4, 2));
    table
        .insert_json(
            r#"[
        {"id": "e1", "stamp": 1458820830, "event": "purchase", "_": {"fruit": "banana"}},
        {"id": "e1", "stamp": 1458820831, "event": "purchase", "_": {"fruit": "pear"}},
        {"id": "e2", "stamp": 1458820830, "event": "purchase", "_": {"fruit": "banana"}},
        {"id": "e2", "stamp": 1458820831, "event": "purchase", "_": {"fruit": "orange"}}
    ]"#,
        )
        .unwrap();

    let code = r#"
        select
          count id
        end
        each_row.limit(1) where fruit.is(== "banana") && fruit.never(== "pear")
          << "matched"
        end
    "#;
    let program = table.compile(code).unwrap();
    assert!(program.index.countable);

    let result = table.query(code).unwrap();
    let cells = group(&result, "matched")["c"].as_array().unwrap();
    // e2 only: e1 bought a pear
    assert_eq!(cells[0], 1);
}

// S3: `.range` is stamp-inclusive and `.reverse` flips visit order
#[test]
fn test_range_with_reverse() {
    let table = shop_table(RuntimeConfig::single());
    insert_purchases(&table);
    let log = table
        .debug_entity(
            "user1@test.com",
            r#"
            counter = 0
            each_row.reverse().range("2016-03-24T12:00:30+00:00", "2016-03-24T12:00:32+00:00") where event == "purchase"
              counter = counter + 1
              debug(stamp)
            end
            debug(counter == 3)
        "#,
        )
        .unwrap();
    assert_eq!(log.len(), 4);
    let stamps: Vec<i64> = log[..3].iter().map(|v| v.as_int().unwrap()).collect();
    assert_eq!(
        stamps,
        vec![1_458_820_832_000, 1_458_820_831_000, 1_458_820_830_000]
    );
    assert!(log[3].loose_eq(&cohort_core::Value::Bool(true)));
}

// S4: `break n` unwinds n iteration frames
#[test]
fn test_break_depth_two() {
    let table = shop_table(RuntimeConfig::single());
    insert_purchases(&table);
    let log = table
        .debug_entity(
            "user1@test.com",
            r#"
            counter = 0
            for letter in ["a", "b", "c"]
              for num in [1, 2, 3]
                counter = counter + 1
                if letter == "b" && num == 2
                  break(2)
                end
              end
            end
            debug(counter == 5)
        "#,
        )
        .unwrap();
    assert!(log[0].loose_eq(&cohort_core::Value::Bool(true)));
}

// S5: 9 events in 3 temporal clusters yield 3 sessions
#[test]
fn test_session_count() {
    let table = shop_table(RuntimeConfig::single());
    let base = 1_458_820_830i64;
    let hour = 3600;
    let mut events = Vec::new();
    for cluster in 0..3i64 {
        for i in 0..3i64 {
            events.push(serde_json::json!({
                "id": "user1@test.com",
                "stamp": base + cluster * 2 * hour + i,
                "event": "purchase",
                "_": {"fruit": "orange", "price": 1.0}
            }));
        }
    }
    table
        .insert_json(&serde_json::Value::Array(events).to_string())
        .unwrap();

    let log = table
        .debug_entity("user1@test.com", "debug(session_count() == 3)")
        .unwrap();
    assert!(log[0].loose_eq(&cohort_core::Value::Bool(true)));

    let result = table
        .query(
            r#"
            select
              count session
            end
            each_row where event == "purchase"
              << "all"
            end
        "#,
        )
        .unwrap();
    let cells = group(&result, "all")["c"].as_array().unwrap();
    assert_eq!(cells[0], 3);
}

// S6: segment math over cached segments, with enter deltas
#[test]
fn test_segment_math() {
    let table = shop_table(config(4, 2));
    table
        .insert_json(
            r#"[
        {"id": "u1", "stamp": 1458820830, "event": "purchase", "_": {"fruit": "f1"}},
        {"id": "u2", "stamp": 1458820830, "event": "purchase", "_": {"fruit": "f2"}},
        {"id": "u3", "stamp": 1458820830, "event": "purchase", "_": {"fruit": "f3"}},
        {"id": "u4", "stamp": 1458820830, "event": "purchase", "_": {"fruit": "f4"}}
    ]"#,
        )
        .unwrap();

    // segA = {u1, u2, u3}
    let seg_a = table
        .segment(
            r#"@segment segA
            fruit.ever(== "f1") || fruit.ever(== "f2") || fruit.ever(== "f3")
        "#,
        )
        .unwrap();
    assert_eq!(seg_a.population, 3);
    assert_eq!(seg_a.deltas.len(), 3);
    assert!(seg_a
        .deltas
        .iter()
        .all(|d| d.change == SegmentChange::Enter));

    // segB = {u3, u4}
    let seg_b = table
        .segment(
            r#"@segment segB
            fruit.ever(== "f3") || fruit.ever(== "f4")
        "#,
        )
        .unwrap();
    assert_eq!(seg_b.population, 2);

    // union = {u1, u2, u3, u4}; enter-deltas from the empty set name
    // every member
    let combo = table
        .segment("@segment combo\nunion(\"segA\", \"segB\")")
        .unwrap();
    assert_eq!(combo.population, 4);
    let mut entered: Vec<String> = combo
        .deltas
        .iter()
        .filter(|d| d.change == SegmentChange::Enter)
        .map(|d| d.entity_id.clone())
        .collect();
    entered.sort();
    assert_eq!(entered, vec!["u1", "u2", "u3", "u4"]);

    assert_eq!(table.segment_population("combo"), Some(4));
    assert!(table.delete_segment("combo"));
    assert_eq!(table.segment_population("combo"), None);
}

// P8: identical inputs produce byte-identical output regardless of
// worker count
#[test]
fn test_deterministic_output_across_worker_counts() {
    let mut outputs = Vec::new();
    for workers in [1usize, 4] {
        let table = shop_table(config(4, workers));
        insert_purchases(&table);
        table
            .insert_json(
                r#"[
            {"id": "user2@test.com", "stamp": 1458820900, "event": "purchase",
             "_": {"fruit": "orange", "price": 3.00}}
        ]"#,
            )
            .unwrap();
        let result = table.query(TALLY_QUERY).unwrap();
        outputs.push(serde_json::to_string(&result).unwrap());
    }
    assert_eq!(outputs[0], outputs[1]);
}

// deadlines trip at the first slice checkpoint
#[test]
fn test_deadline_exceeded() {
    let table = shop_table(RuntimeConfig::single());
    insert_purchases(&table);
    let err = table
        .query_with(
            TALLY_QUERY,
            &QueryOptions {
                deadline: Some(Duration::from_millis(0)),
                ..QueryOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err.code, cohort_core::ErrorCode::DeadlineExceeded);
    assert!(err.is_transient());
}

// segment refresh: cached bits are served within the refresh window
#[test]
fn test_segment_refresh_cache() {
    let table = shop_table(RuntimeConfig::single());
    insert_purchases(&table);
    let code = r#"@segment buyers refresh=1_hours use_cached=true
        fruit.ever(== "orange")
    "#;
    let first = table.segment(code).unwrap();
    assert_eq!(first.population, 1);
    assert_eq!(first.deltas.len(), 1);

    // second run inside the refresh window: cached, no new deltas
    let second = table.segment(code).unwrap();
    assert_eq!(second.population, 1);
    assert!(second.deltas.is_empty());
}

// query parameters substitute before tokenization
#[test]
fn test_query_params() {
    let table = shop_table(RuntimeConfig::single());
    insert_purchases(&table);
    let mut params = std::collections::BTreeMap::new();
    params.insert("target".to_string(), cohort_core::Value::text("orange"));
    let result = table
        .query_with(
            r#"
            select
              count fruit
            end
            each_row where fruit == {{target}}
              << fruit
            end
        "#,
            &QueryOptions {
                params,
                ..QueryOptions::default()
            },
        )
        .unwrap();
    let cells = group(&result, "orange")["c"].as_array().unwrap();
    assert_eq!(cells[0], 2);
}

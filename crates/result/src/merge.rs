//! Deterministic merge of partition results
//!
//! Inputs are the per-partition sorted `(group_path, row)` lists plus
//! their local text tables. The merge:
//!
//! 1. unifies text tables, failing the query on a 64-bit hash
//!    collision (`Internal/HashCollision`)
//! 2. folds rows path-by-path, combining slots with the per-modifier
//!    rules (`avg` merges as `(sum_a + sum_b, count_a + count_b)`;
//!    distinct slots merge by set union)
//! 3. finalizes (`avg` → `sum / count`, distinct → set size) and emits
//!    the JSON tree `{"_": [{"g": …, "c": […], "_": [children]}]}`
//!
//! For fixed inputs and sort options the output byte layout is
//! identical regardless of partition order or worker count: group keys
//! order structurally, and text resolves through the unified table
//! before emission.

use crate::accumulator::{Cell, ResultRow};
use cohort_core::error::Result;
use cohort_core::value::Value;
use cohort_core::TextTable;
use cohort_query::{AggModifier, SelectColumn};
use cohort_table::schema::{COL_ID, COL_SESSION};
use std::collections::BTreeMap;

/// One partition's result: sorted rows, local texts, and the select
/// layout they were accumulated under.
#[derive(Debug)]
pub struct ResultSet {
    /// `(group_path, row)` pairs in group order
    pub rows: Vec<(Vec<Value>, ResultRow)>,
    /// Partition-local hash → string table
    pub texts: TextTable,
    /// Select layout (identical across partitions of one query)
    pub selects: Vec<SelectColumn>,
}

/// Merge-time options.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Sort sibling groups by this select column (descending), ties
    /// broken by group key; `None` sorts by group key alone.
    pub sort_by_slot: Option<usize>,
}

/// Merge partition results into the response JSON.
pub fn merge(inputs: Vec<ResultSet>, options: &MergeOptions) -> Result<serde_json::Value> {
    let selects = inputs
        .first()
        .map(|set| set.selects.clone())
        .unwrap_or_default();

    // 1. unify text tables, detecting collisions
    let mut texts = TextTable::new();
    for set in &inputs {
        texts.unify(&set.texts)?;
    }

    // 2. fold rows by group path
    let mut merged: BTreeMap<Vec<Value>, ResultRow> = BTreeMap::new();
    for set in inputs {
        for (path, row) in set.rows {
            match merged.get_mut(&path) {
                Some(existing) => combine_rows(existing, row, &selects),
                None => {
                    merged.insert(path, row);
                }
            }
        }
    }

    tracing::debug!(groups = merged.len(), "merged partition results");

    // 3. finalize and emit
    let mut tree = TreeNode::default();
    for (path, row) in merged {
        tree.insert(&path, finalize_row(&row, &selects));
    }
    Ok(serde_json::json!({ "_": tree.emit(&texts, options) }))
}

fn combine_rows(into: &mut ResultRow, from: ResultRow, selects: &[SelectColumn]) {
    for (slot, select) in selects.iter().enumerate() {
        let a = &into.cells[slot];
        let b = &from.cells[slot];
        let value = match select.modifier {
            AggModifier::Count if !is_distinct_count(select) => add_cells(a, b),
            AggModifier::Sum | AggModifier::Avg => add_cells(a, b),
            AggModifier::Min => pick(a, b, std::cmp::Ordering::Less),
            AggModifier::Max => pick(a, b, std::cmp::Ordering::Greater),
            AggModifier::Value | AggModifier::Var => {
                if b.value.is_nil() {
                    a.value.clone()
                } else {
                    b.value.clone()
                }
            }
            // distinct counts resolve from the merged sets below
            _ => a.value.clone(),
        };
        let count = into.cells[slot].count + from.cells[slot].count;
        into.cells[slot] = Cell { value, count };
    }
    // set union for the distinct-count slots
    into.distinct.extend(from.distinct);
}

fn is_distinct_count(select: &SelectColumn) -> bool {
    matches!(select.column, Some(COL_ID) | Some(COL_SESSION))
}

fn add_cells(a: &Cell, b: &Cell) -> Value {
    match (&a.value, &b.value) {
        (Value::Nil, v) | (v, Value::Nil) => v.clone(),
        (a, b) => a.clone().add(b.clone()).unwrap_or(Value::Nil),
    }
}

fn pick(a: &Cell, b: &Cell, want: std::cmp::Ordering) -> Value {
    match (&a.value, &b.value) {
        (Value::Nil, v) | (v, Value::Nil) => v.clone(),
        (x, y) => {
            if x.loose_cmp(y) == Some(want) {
                x.clone()
            } else {
                y.clone()
            }
        }
    }
}

fn finalize_row(row: &ResultRow, selects: &[SelectColumn]) -> Vec<Value> {
    selects
        .iter()
        .enumerate()
        .map(|(slot, select)| match select.modifier {
            AggModifier::Avg => {
                if row.cells[slot].count == 0 {
                    Value::Nil
                } else {
                    row.cells[slot]
                        .value
                        .clone()
                        .div(Value::Float(row.cells[slot].count as f64))
                        .unwrap_or(Value::Nil)
                }
            }
            AggModifier::DistCountPerson => Value::Int(distinct_size(row, slot as u32)),
            AggModifier::Count if is_distinct_count(select) => {
                Value::Int(distinct_size(row, slot as u32))
            }
            _ => row.cells[slot].value.clone(),
        })
        .collect()
}

fn distinct_size(row: &ResultRow, slot: u32) -> i64 {
    row.distinct.iter().filter(|(s, _)| *s == slot).count() as i64
}

#[derive(Debug, Default)]
struct TreeNode {
    children: BTreeMap<Value, TreeNode>,
    cells: Option<Vec<Value>>,
}

impl TreeNode {
    fn insert(&mut self, path: &[Value], cells: Vec<Value>) {
        match path.split_first() {
            None => self.cells = Some(cells),
            Some((head, rest)) => {
                self.children
                    .entry(head.clone())
                    .or_default()
                    .insert(rest, cells);
            }
        }
    }

    fn emit(&self, texts: &TextTable, options: &MergeOptions) -> serde_json::Value {
        let mut entries: Vec<(&Value, &TreeNode)> = self.children.iter().collect();
        if let Some(slot) = options.sort_by_slot {
            entries.sort_by(|(ka, a), (kb, b)| {
                let va = a.cells.as_ref().and_then(|c| c.get(slot)).cloned().unwrap_or(Value::Nil);
                let vb = b.cells.as_ref().and_then(|c| c.get(slot)).cloned().unwrap_or(Value::Nil);
                // descending by slot, ascending key tie-break
                vb.cmp(&va).then_with(|| ka.cmp(kb))
            });
        }
        let out: Vec<serde_json::Value> = entries
            .into_iter()
            .map(|(key, node)| {
                let mut obj = serde_json::Map::new();
                obj.insert("g".into(), resolve_text(key, texts));
                if let Some(cells) = &node.cells {
                    obj.insert(
                        "c".into(),
                        serde_json::Value::Array(
                            cells.iter().map(|v| resolve_text(v, texts)).collect(),
                        ),
                    );
                }
                if !node.children.is_empty() {
                    obj.insert("_".into(), node.emit(texts, options));
                }
                serde_json::Value::Object(obj)
            })
            .collect();
        serde_json::Value::Array(out)
    }
}

fn resolve_text(value: &Value, texts: &TextTable) -> serde_json::Value {
    if let Value::Text(t) = value {
        if t.as_str().is_none() {
            if let Some(s) = texts.get(t.hash()) {
                return serde_json::Value::String(s.to_string());
            }
        }
    }
    value.to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::{ResultAccumulator, RowStamp};
    use cohort_table::schema::FIRST_USER_COL;

    fn selects() -> Vec<SelectColumn> {
        vec![
            SelectColumn {
                modifier: AggModifier::Count,
                column: Some(COL_ID),
                name: "id".into(),
                distinct_key: None,
            },
            SelectColumn {
                modifier: AggModifier::Sum,
                column: Some(FIRST_USER_COL + 1),
                name: "price".into(),
                distinct_key: None,
            },
            SelectColumn {
                modifier: AggModifier::Avg,
                column: Some(FIRST_USER_COL + 1),
                name: "avg_price".into(),
                distinct_key: None,
            },
        ]
    }

    fn partition(entity: i64, fruit: &str, prices: &[f64]) -> ResultSet {
        let mut acc = ResultAccumulator::new(&selects());
        for (i, price) in prices.iter().enumerate() {
            let group = vec![Value::text(fruit)];
            let values = vec![
                Value::Int(entity),
                Value::Float(*price),
                Value::Float(*price),
            ];
            acc.add_local_text(cohort_core::hash_text(fruit), fruit);
            acc.tally(
                &group,
                &values,
                &values,
                RowStamp {
                    stamp: 1000 + i as i64,
                    event: 7,
                    entity,
                    session: 1,
                },
            );
        }
        acc.into_result_set()
    }

    #[test]
    fn test_merge_combines_slots() {
        let a = partition(1, "orange", &[5.0, 3.0]);
        let b = partition(2, "orange", &[2.0]);
        let json = merge(vec![a, b], &MergeOptions::default()).unwrap();
        let groups = json["_"].as_array().unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0]["g"], "orange");
        let cells = groups[0]["c"].as_array().unwrap();
        assert_eq!(cells[0], 2); // two distinct entities
        assert!((cells[1].as_f64().unwrap() - 10.0).abs() < 1e-9);
        // avg merges as (sum, count): 10 / 3
        assert!((cells[2].as_f64().unwrap() - 10.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_merge_associative_commutative() {
        let make = |entities: &[(i64, &str, f64)]| {
            let mut acc = ResultAccumulator::new(&selects());
            for (entity, fruit, price) in entities {
                acc.add_local_text(cohort_core::hash_text(fruit), fruit);
                acc.tally(
                    &[Value::text(*fruit)],
                    &[
                        Value::Int(*entity),
                        Value::Float(*price),
                        Value::Float(*price),
                    ],
                    &[
                        Value::Int(*entity),
                        Value::Float(*price),
                        Value::Float(*price),
                    ],
                    RowStamp {
                        stamp: *entity * 100,
                        event: 7,
                        entity: *entity,
                        session: 1,
                    },
                );
            }
            acc.into_result_set()
        };
        let opts = MergeOptions::default();

        let abc = merge(
            vec![
                make(&[(1, "orange", 5.0)]),
                make(&[(2, "pear", 3.0)]),
                make(&[(3, "orange", 1.0)]),
            ],
            &opts,
        )
        .unwrap();
        let cba = merge(
            vec![
                make(&[(3, "orange", 1.0)]),
                make(&[(2, "pear", 3.0)]),
                make(&[(1, "orange", 5.0)]),
            ],
            &opts,
        )
        .unwrap();
        assert_eq!(
            serde_json::to_string(&abc).unwrap(),
            serde_json::to_string(&cba).unwrap()
        );
    }

    #[test]
    fn test_hash_collision_fails_query() {
        let a = partition(1, "orange", &[5.0]);
        let mut b = partition(2, "pear", &[1.0]);
        // forge: bind orange's hash to a different string
        b.texts = {
            let mut t = TextTable::new();
            t.insert(cohort_core::hash_text("orange"), "not orange");
            t
        };
        let err = merge(vec![a, b], &MergeOptions::default()).unwrap_err();
        assert_eq!(err.code, cohort_core::ErrorCode::HashCollision);
    }

    #[test]
    fn test_sorted_emission() {
        let a = partition(1, "orange", &[5.0]);
        let b = partition(2, "pear", &[9.0]);
        let json = merge(
            vec![a, b],
            &MergeOptions {
                sort_by_slot: Some(1),
            },
        )
        .unwrap();
        let groups = json["_"].as_array().unwrap();
        // descending by sum: pear (9.0) first
        assert_eq!(groups[0]["g"], "pear");
        assert_eq!(groups[1]["g"], "orange");
    }
}

//! Hierarchical result accumulator
//!
//! `tally(g1, g2, …, gk)` walks the group tree, creating nodes as
//! needed, and updates the leaf's row of accumulator slots — one per
//! `select` column. `count` and `sum` dedup through a per-leaf set of
//! `(slot, distinct_key, stamp, event)` scoped per entity evaluation,
//! so one logical event cannot double-count through its set-expanded
//! physical rows. `count` over
//! the built-in `id` and `session` columns counts distinct entities
//! and distinct `(entity, session)` pairs via the same per-slot
//! distinct machinery `dist_count_person` uses.
//!
//! Group keys holding text store 64-bit hashes; the accumulator interns
//! the strings into its partition-local text table as they arrive.

use cohort_core::value::Value;
use cohort_core::TextTable;
use cohort_query::{AggModifier, SelectColumn};
use cohort_table::schema::{COL_ID, COL_SESSION};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;

/// Row identity used for dedup: the physical row's stamp and event.
#[derive(Debug, Clone, Copy)]
pub struct RowStamp {
    /// Event stamp (ms)
    pub stamp: i64,
    /// Event name hash
    pub event: i64,
    /// Entity id hash
    pub entity: i64,
    /// Session number of the row
    pub session: i64,
}

/// One accumulator slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cell {
    /// Aggregated value (`sum` for avg)
    pub value: Value,
    /// Row count feeding the slot (avg divisor)
    pub count: i64,
}

/// One leaf row: the accumulator cells plus distinct tracking.
#[derive(Debug, Clone, Default)]
pub struct ResultRow {
    /// One cell per select column
    pub cells: Vec<Cell>,
    /// Dedup, scoped per entity evaluation:
    /// `(slot, distinct_key, stamp, event, entity)`
    dedup: FxHashSet<(u32, Value, i64, i64, i64)>,
    /// Distinct sets for entity/session counting slots:
    /// `(slot, key)`
    pub distinct: FxHashSet<(u32, Value)>,
}

impl ResultRow {
    fn new(width: usize) -> Self {
        ResultRow {
            cells: vec![Cell::default(); width],
            ..ResultRow::default()
        }
    }
}

#[derive(Debug, Default)]
struct Node {
    children: BTreeMap<Value, Node>,
    row: Option<ResultRow>,
}

/// Per-partition, per-query accumulator.
#[derive(Debug)]
pub struct ResultAccumulator {
    selects: Vec<SelectColumn>,
    root: Node,
    texts: TextTable,
}

impl ResultAccumulator {
    /// Accumulator for the query's select columns.
    pub fn new(selects: &[SelectColumn]) -> Self {
        ResultAccumulator {
            selects: selects.to_vec(),
            root: Node::default(),
            texts: TextTable::new(),
        }
    }

    /// Record a hash → string pair for later merge resolution.
    pub fn add_local_text(&mut self, hash: i64, s: &str) {
        self.texts.insert(hash, s);
    }

    /// Tally one row into the group at `path`. `values[i]` is the
    /// current row's value for select column `i`; `keys[i]` its
    /// distinct key (the value itself unless `key <col>` overrode it).
    pub fn tally(&mut self, path: &[Value], values: &[Value], keys: &[Value], row: RowStamp) {
        let width = self.selects.len();
        let leaf = leaf_for(&mut self.root, width, path);
        debug_assert_eq!(values.len(), width);

        for (slot, select) in self.selects.iter().enumerate() {
            let slot_u = slot as u32;
            let value = &values[slot];
            let cell = &mut leaf.cells[slot];
            match select.modifier {
                AggModifier::Count => {
                    // `count id` / `count session` count distinct
                    // entities / sessions, not rows
                    match select.column {
                        Some(COL_ID) => {
                            leaf.distinct.insert((slot_u, Value::Int(row.entity)));
                            cell.value = Value::Int(distinct_size(&leaf.distinct, slot_u));
                        }
                        Some(COL_SESSION) => {
                            leaf.distinct.insert((
                                slot_u,
                                Value::List(vec![Value::Int(row.entity), Value::Int(row.session)]),
                            ));
                            cell.value = Value::Int(distinct_size(&leaf.distinct, slot_u));
                        }
                        _ => {
                            if leaf.dedup.insert((slot_u, keys[slot].clone(), row.stamp, row.event, row.entity))
                            {
                                cell.value = match &cell.value {
                                    Value::Nil => Value::Int(1),
                                    v => Value::Int(v.as_int().unwrap_or(0) + 1),
                                };
                                cell.count += 1;
                            }
                        }
                    }
                }
                AggModifier::Sum => {
                    if value.is_nil() {
                        continue;
                    }
                    if leaf.dedup.insert((slot_u, keys[slot].clone(), row.stamp, row.event, row.entity)) {
                        cell.value = match &cell.value {
                            Value::Nil => value.clone(),
                            prev => prev
                                .clone()
                                .add(value.clone())
                                .unwrap_or(Value::Nil),
                        };
                        cell.count += 1;
                    }
                }
                AggModifier::Min => {
                    if value.is_nil() {
                        continue;
                    }
                    let smaller = match &cell.value {
                        Value::Nil => true,
                        prev => matches!(
                            value.loose_cmp(prev),
                            Some(std::cmp::Ordering::Less)
                        ),
                    };
                    if smaller {
                        cell.value = value.clone();
                    }
                    cell.count += 1;
                }
                AggModifier::Max => {
                    if value.is_nil() {
                        continue;
                    }
                    let larger = match &cell.value {
                        Value::Nil => true,
                        prev => matches!(
                            value.loose_cmp(prev),
                            Some(std::cmp::Ordering::Greater)
                        ),
                    };
                    if larger {
                        cell.value = value.clone();
                    }
                    cell.count += 1;
                }
                AggModifier::Avg => {
                    if value.is_nil() {
                        continue;
                    }
                    cell.value = match &cell.value {
                        Value::Nil => value.clone(),
                        prev => prev.clone().add(value.clone()).unwrap_or(Value::Nil),
                    };
                    cell.count += 1;
                }
                AggModifier::Value | AggModifier::Var => {
                    if !value.is_nil() {
                        cell.value = value.clone();
                        cell.count += 1;
                    }
                }
                AggModifier::DistCountPerson => {
                    leaf.distinct.insert((slot_u, Value::Int(row.entity)));
                    cell.value = Value::Int(distinct_size(&leaf.distinct, slot_u));
                }
            }
        }
    }

    /// Flatten into sorted `(group_path, row)` pairs plus the local
    /// text table; the partition hands this to the merge step.
    pub fn into_result_set(self) -> crate::merge::ResultSet {
        let mut rows = Vec::new();
        flatten(&self.root, &mut Vec::new(), &mut rows);
        crate::merge::ResultSet {
            rows,
            texts: self.texts,
            selects: self.selects,
        }
    }

    /// Number of distinct leaves (test helper).
    pub fn leaf_count(&self) -> usize {
        let mut rows = Vec::new();
        flatten(&self.root, &mut Vec::new(), &mut rows);
        rows.len()
    }
}

fn distinct_size(distinct: &FxHashSet<(u32, Value)>, slot: u32) -> i64 {
    distinct.iter().filter(|(s, _)| *s == slot).count() as i64
}

fn leaf_for<'t>(root: &'t mut Node, width: usize, path: &[Value]) -> &'t mut ResultRow {
    let mut node = root;
    for key in path {
        node = node.children.entry(key.clone()).or_default();
    }
    node.row.get_or_insert_with(|| ResultRow::new(width))
}

fn flatten(node: &Node, path: &mut Vec<Value>, out: &mut Vec<(Vec<Value>, ResultRow)>) {
    if let Some(row) = &node.row {
        out.push((path.clone(), row.clone()));
    }
    for (key, child) in &node.children {
        path.push(key.clone());
        flatten(child, path, out);
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
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
                modifier: AggModifier::Count,
                column: Some(FIRST_USER_COL),
                name: "fruit".into(),
                distinct_key: None,
            },
            SelectColumn {
                modifier: AggModifier::Sum,
                column: Some(FIRST_USER_COL + 1),
                name: "price".into(),
                distinct_key: None,
            },
        ]
    }

    fn stamp(stamp: i64) -> RowStamp {
        RowStamp {
            stamp,
            event: 7,
            entity: 42,
            session: 1,
        }
    }

    fn tally_fruit(acc: &mut ResultAccumulator, fruit: &str, price: f64, at: i64) {
        let group = vec![Value::text(fruit)];
        let values = vec![
            Value::Int(42),
            Value::text(fruit),
            Value::Float(price),
        ];
        let keys = values.clone();
        acc.tally(&group, &values, &keys, stamp(at));
    }

    #[test]
    fn test_grouped_counts_and_sums() {
        let mut acc = ResultAccumulator::new(&selects());
        tally_fruit(&mut acc, "orange", 5.55, 1000);
        tally_fruit(&mut acc, "apple", 9.95, 2000);
        tally_fruit(&mut acc, "pear", 12.49, 3000);
        tally_fruit(&mut acc, "banana", 2.49, 4000);
        tally_fruit(&mut acc, "orange", 5.55, 5000);

        let set = acc.into_result_set();
        assert_eq!(set.rows.len(), 4);
        let orange = set
            .rows
            .iter()
            .find(|(path, _)| path[0].loose_eq(&Value::text("orange")))
            .unwrap();
        // one distinct entity, two rows, 11.10 total
        assert_eq!(orange.1.cells[0].value, Value::Int(1));
        assert_eq!(orange.1.cells[1].value, Value::Int(2));
        assert!(orange.1.cells[2].value.loose_eq(&Value::Float(11.10)));
    }

    #[test]
    fn test_dedup_idempotence() {
        // tallying the identical (group, stamp, event, key) twice
        // updates count and sum exactly once
        let mut acc = ResultAccumulator::new(&selects());
        tally_fruit(&mut acc, "orange", 5.55, 1000);
        tally_fruit(&mut acc, "orange", 5.55, 1000);

        let set = acc.into_result_set();
        let orange = &set.rows[0];
        assert_eq!(orange.1.cells[1].value, Value::Int(1));
        assert!(orange.1.cells[2].value.loose_eq(&Value::Float(5.55)));
    }

    #[test]
    fn test_count_session_distinct() {
        let selects = vec![SelectColumn {
            modifier: AggModifier::Count,
            column: Some(COL_SESSION),
            name: "session".into(),
            distinct_key: None,
        }];
        let mut acc = ResultAccumulator::new(&selects);
        for (at, session) in [(1i64, 1i64), (2, 1), (3, 2), (4, 3), (5, 3)] {
            acc.tally(
                &[Value::text("all")],
                &[Value::Int(session)],
                &[Value::Int(session)],
                RowStamp {
                    stamp: at,
                    event: 7,
                    entity: 42,
                    session,
                },
            );
        }
        let set = acc.into_result_set();
        assert_eq!(set.rows[0].1.cells[0].value, Value::Int(3));
    }

    #[test]
    fn test_hierarchical_groups() {
        let mut acc = ResultAccumulator::new(&selects());
        let values = vec![Value::Int(1), Value::text("x"), Value::Float(1.0)];
        acc.tally(
            &[Value::text("a"), Value::text("b")],
            &values,
            &values,
            stamp(1),
        );
        acc.tally(
            &[Value::text("a"), Value::text("c")],
            &values,
            &values,
            stamp(2),
        );
        acc.tally(&[Value::text("a")], &values, &values, stamp(3));
        assert_eq!(acc.leaf_count(), 3);
    }
}

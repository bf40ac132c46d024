//! Per-column inverted index
//!
//! Each partition keeps, per column, a map from cell value to the
//! bitmap of entities carrying that value in at least one row, plus a
//! presence bitmap. The ingest path notes every non-nil cell; the index
//! expression evaluator reads them back with comparison semantics that
//! match the VM's, so an exact (countable) expression needs no grid
//! evaluation at all.

use crate::bits::IndexBits;
use cohort_table::grid::decode_cell;
use cohort_table::schema::{ColumnId, ColumnType};
use cohort_table::NIL_CELL;
use rustc_hash::FxHashMap;

#[derive(Debug, Default)]
struct ColumnPostings {
    ctype: Option<ColumnType>,
    by_value: FxHashMap<i64, IndexBits>,
    presence: IndexBits,
}

/// The per-partition bit index.
#[derive(Debug, Default)]
pub struct BitIndex {
    columns: FxHashMap<ColumnId, ColumnPostings>,
    universe: IndexBits,
    entity_count: usize,
}

impl BitIndex {
    /// Empty index.
    pub fn new() -> Self {
        BitIndex::default()
    }

    /// Register an entity linear id (rows or not); keeps the universe
    /// aligned with the partition's entity table.
    pub fn note_entity(&mut self, linear_id: usize) {
        self.universe.set(linear_id);
        if linear_id + 1 > self.entity_count {
            self.entity_count = linear_id + 1;
        }
    }

    /// Note one cell of one row for an entity.
    pub fn note(&mut self, linear_id: usize, col: ColumnId, ctype: ColumnType, cell: i64) {
        self.note_entity(linear_id);
        if cell == NIL_CELL {
            return;
        }
        let postings = self.columns.entry(col).or_default();
        postings.ctype = Some(ctype);
        postings.presence.set(linear_id);
        postings.by_value.entry(cell).or_default().set(linear_id);
    }

    /// All registered entities.
    pub fn universe(&self) -> &IndexBits {
        &self.universe
    }

    /// Entity count (bound for complements).
    pub fn entity_count(&self) -> usize {
        self.entity_count
    }

    /// Entities with any non-nil value in `col`.
    pub fn presence(&self, col: ColumnId) -> IndexBits {
        self.columns
            .get(&col)
            .map(|p| p.presence.clone())
            .unwrap_or_default()
    }

    /// Entities with at least one row whose `col` satisfies `op value`.
    ///
    /// Exact for every operator: `!=` against a non-nil literal also
    /// includes entities with no value in the column at all (a nil cell
    /// is unequal by tag).
    pub fn build(&self, col: ColumnId, op: crate::expr::CmpOp, value: &cohort_core::Value) -> IndexBits {
        use crate::expr::CmpOp;
        let postings = self.columns.get(&col);

        let absent = || {
            let mut bits = self.universe.clone();
            if let Some(p) = postings {
                bits.op_and_not(&p.presence);
            }
            bits
        };

        match op {
            CmpOp::Present => {
                return postings.map(|p| p.presence.clone()).unwrap_or_default();
            }
            CmpOp::Eq if value.is_nil() => return absent(),
            CmpOp::Neq if value.is_nil() => {
                return postings.map(|p| p.presence.clone()).unwrap_or_default();
            }
            _ => {}
        }

        let postings = match postings {
            Some(p) => p,
            None => {
                // column never seen: only `!=` can match (vacuously, for
                // every entity)
                return if op == CmpOp::Neq {
                    self.universe.clone()
                } else {
                    IndexBits::new()
                };
            }
        };
        let ctype = postings.ctype.expect("postings always carry a type");

        let mut out = IndexBits::new();
        for (cell, bits) in &postings.by_value {
            let decoded = decode_cell(*cell, ctype);
            let hit = match op {
                CmpOp::Eq => decoded.loose_eq(value),
                CmpOp::Neq => !decoded.loose_eq(value),
                CmpOp::Gt => matches!(decoded.loose_cmp(value), Some(std::cmp::Ordering::Greater)),
                CmpOp::Gte => matches!(
                    decoded.loose_cmp(value),
                    Some(std::cmp::Ordering::Greater | std::cmp::Ordering::Equal)
                ),
                CmpOp::Lt => matches!(decoded.loose_cmp(value), Some(std::cmp::Ordering::Less)),
                CmpOp::Lte => matches!(
                    decoded.loose_cmp(value),
                    Some(std::cmp::Ordering::Less | std::cmp::Ordering::Equal)
                ),
                CmpOp::Present => unreachable!(),
            };
            if hit {
                out.op_or(bits);
            }
        }
        if op == CmpOp::Neq {
            // nil cells are unequal by tag
            out.op_or(&absent());
        }
        out
    }
}

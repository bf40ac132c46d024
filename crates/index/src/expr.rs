//! Index expression: the compile-time boolean formula over columns
//!
//! The compiler distills the program's `if` / `each_row where` logic
//! into a postfix op list over `column OP value` terms (sub-expressions
//! it cannot express — user variables, arithmetic, function calls —
//! were replaced with VOID and deleted, clearing the *countable* flag).
//! Partitions evaluate the list against their [`BitIndex`] with a small
//! bitmap stack.

use crate::bits::IndexBits;
use crate::inverted::BitIndex;
use cohort_core::Value;
use cohort_table::schema::ColumnId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Comparison operator, shared by index terms and VM filter
/// descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    /// `==`
    Eq,
    /// `!=`
    Neq,
    /// `>`
    Gt,
    /// `>=`
    Gte,
    /// `<`
    Lt,
    /// `<=`
    Lte,
    /// bare column reference → non-nil
    Present,
}

impl CmpOp {
    /// The operator with operands swapped (`a OP b` ⇔ `b OP' a`).
    pub fn swapped(self) -> CmpOp {
        match self {
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::Gte => CmpOp::Lte,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::Lte => CmpOp::Gte,
            other => other,
        }
    }

    /// The negated operator, used when `.never(...)` flips a term.
    pub fn negated(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Neq,
            CmpOp::Neq => CmpOp::Eq,
            CmpOp::Gt => CmpOp::Lte,
            CmpOp::Gte => CmpOp::Lt,
            CmpOp::Lt => CmpOp::Gte,
            CmpOp::Lte => CmpOp::Gt,
            CmpOp::Present => CmpOp::Present,
        }
    }

    /// Apply the operator with the VM's loose comparison semantics.
    pub fn test(self, left: &Value, right: &Value) -> bool {
        match self {
            CmpOp::Eq => left.loose_eq(right),
            CmpOp::Neq => !left.loose_eq(right),
            CmpOp::Gt => matches!(left.loose_cmp(right), Some(Ordering::Greater)),
            CmpOp::Gte => matches!(
                left.loose_cmp(right),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CmpOp::Lt => matches!(left.loose_cmp(right), Some(Ordering::Less)),
            CmpOp::Lte => matches!(left.loose_cmp(right), Some(Ordering::Less | Ordering::Equal)),
            CmpOp::Present => !left.is_nil(),
        }
    }
}

/// One leaf of the index expression.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexTerm {
    /// Column the term tests
    pub col: ColumnId,
    /// Operator (always with the column on the left)
    pub op: CmpOp,
    /// Literal right-hand side (`Nil` for presence terms)
    pub value: Value,
}

/// Postfix op consumed by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOp {
    /// Push a term's bitmap
    Push(IndexTerm),
    /// Pop two, push their intersection
    And,
    /// Pop two, push their union
    Or,
    /// Pop one, push its complement within the universe
    Not,
}

/// The compiled index expression.
#[derive(Debug, Clone, Default)]
pub struct IndexExpr {
    /// Postfix op list; empty means "no pruning possible"
    pub ops: Vec<IndexOp>,
    /// True iff no VOID was introduced during extraction: the bitmap is
    /// exact and population queries can skip the VM entirely
    pub countable: bool,
}

impl IndexExpr {
    /// An expression that prunes nothing (every entity is a candidate).
    pub fn unbounded() -> Self {
        IndexExpr {
            ops: Vec::new(),
            countable: false,
        }
    }

    /// Evaluate against a partition's bit index.
    ///
    /// Guaranteed to return a superset of the entities the full program
    /// would match; exact when `countable`.
    pub fn evaluate(&self, index: &BitIndex) -> IndexBits {
        if self.ops.is_empty() {
            return index.universe().clone();
        }
        let mut stack: Vec<IndexBits> = Vec::with_capacity(4);
        for op in &self.ops {
            match op {
                IndexOp::Push(term) => {
                    stack.push(index.build(term.col, term.op, &term.value));
                }
                IndexOp::And => {
                    let rhs = stack.pop().unwrap_or_default();
                    if let Some(lhs) = stack.last_mut() {
                        lhs.op_and(&rhs);
                    }
                }
                IndexOp::Or => {
                    let rhs = stack.pop().unwrap_or_default();
                    if let Some(lhs) = stack.last_mut() {
                        lhs.op_or(&rhs);
                    }
                }
                IndexOp::Not => {
                    if let Some(top) = stack.last_mut() {
                        top.flip_all(index.entity_count());
                    }
                }
            }
        }
        stack.pop().unwrap_or_else(|| index.universe().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_table::schema::ColumnType;

    fn term(col: ColumnId, op: CmpOp, value: Value) -> IndexOp {
        IndexOp::Push(IndexTerm { col, op, value })
    }

    fn two_fruit_index() -> BitIndex {
        // E1 (lin 0): banana, pear; E2 (lin 1): banana, orange
        let mut index = BitIndex::new();
        let fruit = 4;
        for (lin, name) in [(0usize, "banana"), (0, "pear"), (1, "banana"), (1, "orange")] {
            index.note(lin, fruit, ColumnType::Text, cohort_core::hash_text(name));
        }
        index
    }

    #[test]
    fn test_and_or_not() {
        let index = two_fruit_index();
        // banana && !pear → entity 1 only
        let expr = IndexExpr {
            ops: vec![
                term(4, CmpOp::Eq, Value::text("banana")),
                term(4, CmpOp::Eq, Value::text("pear")),
                IndexOp::Not,
                IndexOp::And,
            ],
            countable: true,
        };
        let bits = expr.evaluate(&index);
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_empty_expression_is_universe() {
        let index = two_fruit_index();
        let bits = IndexExpr::unbounded().evaluate(&index);
        assert_eq!(bits.population(), 2);
    }

    #[test]
    fn test_cmp_op_algebra() {
        assert_eq!(CmpOp::Gt.swapped(), CmpOp::Lt);
        assert_eq!(CmpOp::Gte.negated(), CmpOp::Lt);
        assert_eq!(CmpOp::Eq.negated(), CmpOp::Neq);
        assert!(CmpOp::Lte.test(&Value::Int(3), &Value::Float(3.0)));
        assert!(CmpOp::Present.test(&Value::Int(0), &Value::Nil));
        assert!(!CmpOp::Present.test(&Value::Nil, &Value::Nil));
    }
}

//! Index expression extraction
//!
//! While parsing `if` / `each_row where` conditions, the parser builds
//! an [`IndexNode`] tree alongside the emitted ops. Sub-expressions the
//! bit index cannot answer — user variables, function calls,
//! arithmetic, computed columns — become [`IndexNode::Void`]; the
//! simplifier then deletes voided subtrees until a fixed point:
//!
//! - `And(Void, x)` → `x` (still a superset)
//! - `Or(…, Void, …)` → `Void` (no bound possible)
//! - `Not(Void)` → `Void`
//!
//! A bare column reference in boolean position becomes a presence term;
//! `.never(X)` becomes `Not(X)`. The extractor records whether any
//! `Void` was ever introduced: if not, the final bitmap is *countable*
//! (exact), and population queries skip the VM.

use cohort_index::{CmpOp, IndexExpr, IndexOp, IndexTerm};
use cohort_table::schema::ColumnId;

/// Expression tree over index terms, before simplification.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexNode {
    /// Unanswerable sub-expression
    Void,
    /// Literal operand (only meaningful as a comparison side)
    Literal(cohort_core::Value),
    /// List literal operand; `Some` when every element is a literal
    /// (the shape `col in [a, b, c]` normalizes over)
    ListLiteral(Option<Vec<cohort_core::Value>>),
    /// Column operand (presence term when used as a boolean)
    Column(ColumnId),
    /// `col OP value`
    Term(IndexTerm),
    /// Negated subtree (`.never`)
    Not(Box<IndexNode>),
    /// Conjunction
    And(Box<IndexNode>, Box<IndexNode>),
    /// Disjunction
    Or(Box<IndexNode>, Box<IndexNode>),
}

impl IndexNode {
    /// Promote an operand node to boolean position: bare columns become
    /// presence terms, literals and everything else void out.
    pub fn as_boolean(self) -> IndexNode {
        match self {
            IndexNode::Column(col) => IndexNode::Term(IndexTerm {
                col,
                op: CmpOp::Present,
                value: cohort_core::Value::Nil,
            }),
            IndexNode::Literal(_) | IndexNode::ListLiteral(_) => IndexNode::Void,
            other => other,
        }
    }

    /// Combine two comparison operands into a term when one side is a
    /// column and the other a literal (swapping the operator when the
    /// column is on the right).
    pub fn compare(op: CmpOp, lhs: IndexNode, rhs: IndexNode) -> IndexNode {
        match (lhs, rhs) {
            (IndexNode::Column(col), IndexNode::Literal(value)) => {
                IndexNode::Term(IndexTerm { col, op, value })
            }
            (IndexNode::Literal(value), IndexNode::Column(col)) => IndexNode::Term(IndexTerm {
                col,
                op: op.swapped(),
                value,
            }),
            _ => IndexNode::Void,
        }
    }

    /// Membership (`col in [a, b, c]`) normalized to an `Or` of
    /// equality terms when every element is a literal.
    pub fn membership(col_side: IndexNode, items: Option<&[cohort_core::Value]>) -> IndexNode {
        let col = match col_side {
            IndexNode::Column(col) => col,
            _ => return IndexNode::Void,
        };
        let items = match items {
            Some(items) if !items.is_empty() => items,
            _ => return IndexNode::Void,
        };
        let mut out: Option<IndexNode> = None;
        for item in items {
            let term = IndexNode::Term(IndexTerm {
                col,
                op: CmpOp::Eq,
                value: item.clone(),
            });
            out = Some(match out {
                Some(prev) => IndexNode::Or(Box::new(prev), Box::new(term)),
                None => term,
            });
        }
        out.unwrap_or(IndexNode::Void)
    }

    fn simplify(self) -> IndexNode {
        match self {
            IndexNode::And(a, b) => match (a.simplify(), b.simplify()) {
                (IndexNode::Void, IndexNode::Void) => IndexNode::Void,
                (IndexNode::Void, x) | (x, IndexNode::Void) => x,
                (a, b) => IndexNode::And(Box::new(a), Box::new(b)),
            },
            IndexNode::Or(a, b) => match (a.simplify(), b.simplify()) {
                (IndexNode::Void, _) | (_, IndexNode::Void) => IndexNode::Void,
                (a, b) => IndexNode::Or(Box::new(a), Box::new(b)),
            },
            IndexNode::Not(inner) => match inner.simplify() {
                IndexNode::Void => IndexNode::Void,
                x => IndexNode::Not(Box::new(x)),
            },
            IndexNode::Column(_) | IndexNode::Literal(_) | IndexNode::ListLiteral(_) => {
                IndexNode::Void
            }
            leaf => leaf,
        }
    }

    fn emit(&self, ops: &mut Vec<IndexOp>) {
        match self {
            IndexNode::Term(term) => ops.push(IndexOp::Push(term.clone())),
            IndexNode::Not(inner) => {
                inner.emit(ops);
                ops.push(IndexOp::Not);
            }
            IndexNode::And(a, b) => {
                a.emit(ops);
                b.emit(ops);
                ops.push(IndexOp::And);
            }
            IndexNode::Or(a, b) => {
                a.emit(ops);
                b.emit(ops);
                ops.push(IndexOp::Or);
            }
            IndexNode::Void
            | IndexNode::Column(_)
            | IndexNode::Literal(_)
            | IndexNode::ListLiteral(_) => {}
        }
    }
}

/// Fold the condition trees of every `if` / `where` in the program into
/// one postfix expression. Conditions combine with `Or`: a candidate
/// entity is one that could enter *any* conditional body.
pub fn build_index_expr(conditions: Vec<IndexNode>, void_seen: bool) -> IndexExpr {
    let mut combined: Option<IndexNode> = None;
    for cond in conditions {
        let cond = cond.as_boolean();
        combined = Some(match combined {
            Some(prev) => IndexNode::Or(Box::new(prev), Box::new(cond)),
            None => cond,
        });
    }
    let simplified = combined.map(IndexNode::simplify);
    let mut ops = Vec::new();
    if let Some(node) = &simplified {
        node.emit(&mut ops);
    }
    let unbounded = matches!(simplified, None | Some(IndexNode::Void));
    IndexExpr {
        ops,
        countable: !void_seen && !unbounded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::Value;

    fn term(col: ColumnId, op: CmpOp, v: Value) -> IndexNode {
        IndexNode::Term(IndexTerm { col, op, value: v })
    }

    #[test]
    fn test_and_drops_void_side() {
        let node = IndexNode::And(
            Box::new(IndexNode::Void),
            Box::new(term(4, CmpOp::Eq, Value::text("banana"))),
        );
        let expr = build_index_expr(vec![node], true);
        assert_eq!(expr.ops.len(), 1);
        assert!(!expr.countable);
    }

    #[test]
    fn test_or_with_void_is_unbounded() {
        let node = IndexNode::Or(
            Box::new(IndexNode::Void),
            Box::new(term(4, CmpOp::Eq, Value::text("banana"))),
        );
        let expr = build_index_expr(vec![node], true);
        assert!(expr.ops.is_empty());
        assert!(!expr.countable);
    }

    #[test]
    fn test_countable_when_fully_indexable() {
        let node = IndexNode::And(
            Box::new(term(4, CmpOp::Eq, Value::text("banana"))),
            Box::new(IndexNode::Not(Box::new(term(
                4,
                CmpOp::Eq,
                Value::text("pear"),
            )))),
        );
        let expr = build_index_expr(vec![node], false);
        assert!(expr.countable);
        assert_eq!(expr.ops.len(), 4);
    }

    #[test]
    fn test_bare_column_becomes_presence() {
        let expr = build_index_expr(vec![IndexNode::Column(7)], false);
        assert_eq!(expr.ops.len(), 1);
        match &expr.ops[0] {
            IndexOp::Push(t) => assert_eq!(t.op, CmpOp::Present),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_membership_expands_to_or_chain() {
        let node = IndexNode::membership(
            IndexNode::Column(4),
            Some(&[Value::text("apple"), Value::text("orange")]),
        );
        let expr = build_index_expr(vec![node], false);
        // two pushes + one Or
        assert_eq!(expr.ops.len(), 3);
        assert!(expr.countable);
    }
}

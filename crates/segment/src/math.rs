//! Direct evaluation of segment-math programs
//!
//! When the compiler flags a program as segment-math-only (`union`,
//! `intersection`, `difference`, `complement`, `population` over
//! literals), the result is computed straight from cached bitmaps —
//! no candidate scan, no per-entity evaluation.

use crate::store::SegmentStore;
use cohort_core::error::{Error, ErrorCode, Result};
use cohort_core::value::Value;
use cohort_index::IndexBits;
use cohort_query::{Marshal, Op, Program};
use cohort_vm::SegmentReader;

enum MathValue {
    Bits(IndexBits),
    Count(u64),
    Name(String),
}

/// Evaluate a segment-math-only program against the partition's cached
/// bitmaps. Returns the resulting bitmap (a bare `population(...)`
/// result is returned as its source bitmap; the caller reads the
/// count).
pub fn evaluate_segment_math(program: &Program, store: &SegmentStore) -> Result<IndexBits> {
    debug_assert!(program.segment_math_only);
    let mut stack: Vec<MathValue> = Vec::new();

    let start = program.block_start(0);
    for instr in &program.instrs[start..] {
        match &instr.op {
            Op::PushLiteral(idx) => {
                let name = match &program.literals[*idx as usize] {
                    Value::Text(t) => t.to_string(),
                    other => other.to_string(),
                };
                stack.push(MathValue::Name(name));
            }
            Op::PushInt(i) => stack.push(MathValue::Count(*i as u64)),
            Op::Call { marshal, .. } => {
                let out = match marshal {
                    Marshal::Population => {
                        let bits = pop_bits(&mut stack, store)?;
                        MathValue::Count(bits.population())
                    }
                    Marshal::Complement => {
                        let mut bits = pop_bits(&mut stack, store)?;
                        bits.flip_all(store.entity_count());
                        MathValue::Bits(bits)
                    }
                    Marshal::Intersection | Marshal::Union | Marshal::Difference => {
                        let b = pop_bits(&mut stack, store)?;
                        let mut a = pop_bits(&mut stack, store)?;
                        match marshal {
                            Marshal::Intersection => a.op_and(&b),
                            Marshal::Union => a.op_or(&b),
                            _ => a.op_and_not(&b),
                        }
                        MathValue::Bits(a)
                    }
                    other => {
                        return Err(Error::internal(
                            ErrorCode::Internal,
                            format!("{:?} in a segment-math program", other),
                        ));
                    }
                };
                stack.push(out);
            }
            Op::Term | Op::Ret => break,
            other => {
                return Err(Error::internal(
                    ErrorCode::Internal,
                    format!("{:?} in a segment-math program", other),
                ));
            }
        }
    }

    match stack.pop() {
        Some(MathValue::Bits(bits)) => Ok(bits),
        Some(MathValue::Name(name)) => resolve(&name, store),
        Some(MathValue::Count(_)) | None => Ok(IndexBits::new()),
    }
}

fn pop_bits(stack: &mut Vec<MathValue>, store: &SegmentStore) -> Result<IndexBits> {
    match stack.pop() {
        Some(MathValue::Bits(bits)) => Ok(bits),
        Some(MathValue::Name(name)) => resolve(&name, store),
        _ => Err(Error::runtime(
            ErrorCode::TypeMismatch,
            "segment math expects a segment operand",
        )),
    }
}

fn resolve(name: &str, store: &SegmentStore) -> Result<IndexBits> {
    store.segment_bits(name).ok_or_else(|| {
        Error::runtime(
            ErrorCode::TypeMismatch,
            format!("no segment named `{}`", name),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_table::schema::{ColumnType, Schema};

    fn store_with_segments() -> SegmentStore {
        let mut store = SegmentStore::new();
        store.set_entity_count(6);
        store.store_result("segA", [1, 2, 3].into_iter().collect(), None, &[], 0, |lin| {
            Some(format!("u{}", lin))
        });
        store.store_result("segB", [3, 4].into_iter().collect(), None, &[], 0, |lin| {
            Some(format!("u{}", lin))
        });
        store.drain_messages();
        store
    }

    fn compile(src: &str) -> Program {
        let mut schema = Schema::new();
        schema.add("fruit", ColumnType::Text, false).unwrap();
        cohort_query::compile(&schema, src).unwrap()
    }

    #[test]
    fn test_union_population() {
        let store = store_with_segments();
        let program = compile("union(\"segA\", \"segB\")");
        let bits = evaluate_segment_math(&program, &store).unwrap();
        assert_eq!(bits.population(), 4);
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_nested_math() {
        let store = store_with_segments();
        let program = compile("difference(union(\"segA\", \"segB\"), \"segB\")");
        let bits = evaluate_segment_math(&program, &store).unwrap();
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_complement_bounded_by_entity_count() {
        let store = store_with_segments();
        let program = compile("complement(\"segA\")");
        let bits = evaluate_segment_math(&program, &store).unwrap();
        assert_eq!(bits.ones().collect::<Vec<_>>(), vec![0, 4, 5]);
    }

    #[test]
    fn test_unknown_segment_errors() {
        let store = store_with_segments();
        let program = compile("population(\"nope\")");
        assert!(evaluate_segment_math(&program, &store).is_err());
    }
}

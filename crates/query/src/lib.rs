//! Query-language compiler
//!
//! Turns QL source into a [`Program`]: typed bytecode plus the index
//! expression used to prune candidate entities before execution.
//!
//! Pipeline: parameter substitution → section directives → tokenize →
//! block extraction → statement parse (emitting ops and condition
//! trees) → lowering (blocks flattened to instruction offsets) → index
//! extraction.
//!
//! ```text
//! select
//!   count id
//!   sum price
//! end
//! each_row where event == "purchase"
//!   << fruit
//! end
//! ```

#![warn(clippy::all)]

pub mod blocks;
pub mod index_extract;
pub mod parse;
pub mod program;
pub mod section;
pub mod token;

use cohort_core::error::Result;
use cohort_core::value::Value;
use cohort_table::schema::Schema;
use std::collections::BTreeMap;

pub use program::{
    AggModifier, FilterDesc, InlineAgg, Instr, Marshal, MarshalSig, Op, Program, Section,
    SelectColumn, BREAK_ALL, BREAK_TOP, MARSHALS,
};

/// Compile a script against a table schema.
pub fn compile(schema: &Schema, source: &str) -> Result<Program> {
    compile_with_params(schema, source, &BTreeMap::new())
}

/// Compile with `{{name}}` parameter substitution. String parameters
/// are inserted quoted unless the value names a column.
pub fn compile_with_params(
    schema: &Schema,
    source: &str,
    params: &BTreeMap<String, Value>,
) -> Result<Program> {
    let substituted = substitute_params(schema, source, params);
    let (body, section) = section::strip_sections(&substituted)?;
    let (tokens, _lines) = token::tokenize(&body)?;
    let blocks = blocks::extract_blocks(&tokens)?;
    let parsed = parse::Parser::new(schema, &blocks).run()?;

    let index = index_extract::build_index_expr(parsed.conditions, parsed.void_seen);
    let segment_math_only = is_segment_math_only(&parsed.code);

    // flatten blocks into one instruction stream
    let mut instrs = Vec::new();
    let mut block_offsets = Vec::with_capacity(parsed.code.len());
    for block in &parsed.code {
        block_offsets.push(instrs.len() as u32);
        instrs.extend(block.iter().cloned());
    }

    tracing::debug!(
        blocks = parsed.code.len(),
        instrs = instrs.len(),
        countable = index.countable,
        "compiled query"
    );

    Ok(Program {
        instrs,
        block_offsets,
        literals: parsed.literals,
        user_vars: parsed.user_vars,
        columns: parsed.columns,
        filters: parsed.filters,
        selects: parsed.selects,
        index,
        section,
        segment_math_only,
    })
}

fn substitute_params(schema: &Schema, source: &str, params: &BTreeMap<String, Value>) -> String {
    if params.is_empty() {
        return source.to_string();
    }
    let mut out = source.to_string();
    for (name, value) in params {
        let pattern = format!("{{{{{}}}}}", name);
        let replacement = match value {
            Value::Text(t) => {
                let s = t.as_str().map(str::to_owned).unwrap_or_else(|| t.to_string());
                if schema.is_column(&s) {
                    s
                } else {
                    format!("\"{}\"", s)
                }
            }
            other => other.to_string(),
        };
        out = out.replace(&pattern, &replacement);
    }
    out
}

/// The program consists only of segment-math calls over literals: the
/// segment engine answers it from cached bitmaps without touching
/// entities.
fn is_segment_math_only(code: &[Vec<Instr>]) -> bool {
    let root = match code.first() {
        Some(root) if !root.is_empty() => root,
        _ => return false,
    };
    let mut saw_math = false;
    for instr in root {
        match &instr.op {
            Op::PushLiteral(_) | Op::PushInt(_) | Op::Term | Op::Ret => {}
            Op::Call { marshal, .. } if program::is_segment_math(*marshal) => saw_math = true,
            _ => return false,
        }
    }
    saw_math
}

#[cfg(test)]
mod tests {
    use super::*;
    use cohort_core::error::ErrorCode;
    use cohort_index::{CmpOp, IndexOp};
    use cohort_table::schema::ColumnType;

    fn fruit_schema() -> Schema {
        let mut schema = Schema::new();
        schema.add("fruit", ColumnType::Text, false).unwrap();
        schema.add("price", ColumnType::Double, false).unwrap();
        schema.add("tags", ColumnType::Text, true).unwrap();
        schema
    }

    #[test]
    fn test_compile_assign_and_multiply() {
        let schema = fruit_schema();
        let program = compile(&schema, "test_value = 123\nnew_value = test_value * 2").unwrap();
        assert_eq!(program.user_vars, vec!["test_value", "new_value"]);
        assert!(!program.instrs.is_empty());
        assert_eq!(program.block_offsets[0], 0);
    }

    #[test]
    fn test_undefined_variable_rejected() {
        let schema = fruit_schema();
        let err = compile(&schema, "x = y + 1").unwrap_err();
        assert_eq!(err.code, ErrorCode::UndefinedVariable);
    }

    #[test]
    fn test_select_block() {
        let schema = fruit_schema();
        let program = compile(
            &schema,
            "select\n  count id\n  count fruit\n  sum price as total\nend\neach_row where event == \"purchase\"\n  << fruit\nend",
        )
        .unwrap();
        assert_eq!(program.selects.len(), 3);
        assert_eq!(program.selects[0].modifier, AggModifier::Count);
        assert_eq!(program.selects[2].name, "total");
        // the where clause indexes on the event column
        assert!(!program.index.ops.is_empty());
    }

    #[test]
    fn test_ever_never_index_extraction() {
        let schema = fruit_schema();
        let program = compile(
            &schema,
            "each_row where fruit.is(== \"banana\") && fruit.never(== \"pear\")\n  debug(true)\nend",
        )
        .unwrap();
        assert!(program.index.countable);
        // banana term, pear term, Not, And
        assert_eq!(program.index.ops.len(), 4);
        assert!(matches!(program.index.ops[2], IndexOp::Not));
        assert!(matches!(program.index.ops[3], IndexOp::And));
    }

    #[test]
    fn test_user_variable_voids_index() {
        let schema = fruit_schema();
        let program = compile(
            &schema,
            "target = \"banana\"\neach_row where fruit == target\n  debug(true)\nend",
        )
        .unwrap();
        assert!(!program.index.countable);
        assert!(program.index.ops.is_empty());
    }

    #[test]
    fn test_membership_normalizes_to_or() {
        let schema = fruit_schema();
        let program = compile(
            &schema,
            "each_row where fruit in [\"apple\", \"orange\"]\n  debug(true)\nend",
        )
        .unwrap();
        assert!(program.index.countable);
        let eqs = program
            .index
            .ops
            .iter()
            .filter(|op| matches!(op, IndexOp::Push(t) if t.op == CmpOp::Eq))
            .count();
        assert_eq!(eqs, 2);
        assert!(matches!(program.index.ops[2], IndexOp::Or));
    }

    #[test]
    fn test_bad_filter_combination() {
        let schema = fruit_schema();
        let err = compile(
            &schema,
            "each_row.reverse().forward() where event == \"x\"\n  debug(true)\nend",
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadFilterCombination);

        let err = compile(&schema, "each_row.limit(2) where fruit.ever(== \"a\") && fruit.row(== \"b\")\n debug(true)\nend");
        assert!(err.is_ok(), "distinct modes on distinct chains are fine");

        let err = compile(
            &schema,
            "if fruit.ever(== \"a\").never(== \"b\")\n  debug(true)\nend",
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadFilterCombination);
    }

    #[test]
    fn test_unknown_column_in_select() {
        let schema = fruit_schema();
        let err = compile(&schema, "select\n  sum weight\nend").unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownColumn);
    }

    #[test]
    fn test_break_forms() {
        let schema = fruit_schema();
        let program = compile(
            &schema,
            "for a in [1, 2]\n  for b in [3, 4]\n    break(2)\n  end\nend",
        )
        .unwrap();
        assert!(program
            .instrs
            .iter()
            .any(|i| matches!(i.op, Op::Break(2))));
        let program = compile(&schema, "for a in [1]\n  break(\"all\")\nend").unwrap();
        assert!(program
            .instrs
            .iter()
            .any(|i| matches!(i.op, Op::Break(BREAK_ALL))));
    }

    #[test]
    fn test_params_substitution() {
        let schema = fruit_schema();
        let mut params = BTreeMap::new();
        params.insert("target".to_string(), Value::text("banana"));
        params.insert("col".to_string(), Value::text("fruit"));
        let program = compile_with_params(
            &schema,
            "each_row where {{col}} == {{target}}\n  debug(true)\nend",
            &params,
        )
        .unwrap();
        // column name substituted bare, string quoted: indexable term
        assert!(program.index.countable);
    }

    #[test]
    fn test_segment_math_only_detection() {
        let schema = fruit_schema();
        let program = compile(&schema, "union(\"segA\", \"segB\")").unwrap();
        assert!(program.segment_math_only);
        let program = compile(&schema, "x = 1\npopulation(\"segA\")").unwrap();
        assert!(!program.segment_math_only);
    }

    #[test]
    fn test_time_shorthand_in_chain() {
        let schema = fruit_schema();
        let program = compile(
            &schema,
            "each_row.within(30_minutes, stamp) where event == \"purchase\"\n  debug(true)\nend",
        )
        .unwrap();
        let filter = program
            .filters
            .iter()
            .find(|f| f.is_within)
            .expect("within filter");
        assert!(filter.within_window_block.is_some());
        assert!(filter.within_origin_block.is_some());
    }

    #[test]
    fn test_caret_on_syntax_error() {
        let schema = fruit_schema();
        let err = compile(&schema, "x = )").unwrap_err();
        assert!(err.loc.is_some());
    }
}

//! Statement and expression parsing
//!
//! Each extracted line lowers to a sequence of ops. Arithmetic and
//! comparisons use an operator accumulator: a comparison's right-hand
//! side is parsed immediately and the op emitted right away (giving
//! left-to-right evaluation), while `&&` / `||` and arithmetic are
//! deferred and flushed when the expression ends. Lists and dicts lower
//! to `make_list(n)` / `make_dict(2n)` calls consuming their elements
//! off the stack.
//!
//! Alongside op emission, every `if` / `where` condition contributes an
//! [`IndexNode`] tree for index extraction (see `index_extract`).

use crate::blocks::{loc_of, Block, Blocks, LineItem};
use crate::index_extract::IndexNode;
use crate::program::{
    AggModifier, FilterDesc, InlineAgg, Instr, Marshal, Op, SelectColumn, BREAK_ALL, BREAK_TOP,
    MARSHALS,
};
use crate::token::{
    is_digitish, is_float_literal, is_identifier, is_string_literal, strip_quotes, Tok,
    CHAIN_PREFIX,
};
use cohort_core::error::{Error, ErrorCode, Result, SourceLoc};
use cohort_core::time;
use cohort_core::value::Value;
use cohort_index::CmpOp;
use cohort_table::schema::{Schema, COL_ID, COL_SESSION, COL_STAMP};
use rustc_hash::FxHashSet;

const INLINE_AGGS: [(&str, InlineAgg); 8] = [
    ("sum", InlineAgg::Sum),
    ("avg", InlineAgg::Avg),
    ("min", InlineAgg::Min),
    ("max", InlineAgg::Max),
    ("count", InlineAgg::Count),
    ("dcount", InlineAgg::DCount),
    ("test", InlineAgg::Test),
    ("row", InlineAgg::Row),
];

/// Parser output, consumed by the lowering step in `compile`.
#[derive(Debug, Default)]
pub struct Parsed {
    /// Per-block op lists; block 0 is the script body
    pub code: Vec<Vec<Instr>>,
    /// Literal pool
    pub literals: Vec<Value>,
    /// User variable names
    pub user_vars: Vec<String>,
    /// Referenced column ids
    pub columns: Vec<cohort_table::schema::ColumnId>,
    /// Filter descriptors (0 = default)
    pub filters: Vec<FilterDesc>,
    /// `select` declarations
    pub selects: Vec<SelectColumn>,
    /// Condition trees for index extraction
    pub conditions: Vec<IndexNode>,
    /// A VOID was introduced during extraction
    pub void_seen: bool,
}

pub(crate) struct Parser<'a> {
    schema: &'a Schema,
    blocks: &'a Blocks,
    out: Parsed,
    assigned: FxHashSet<u32>,
}

impl<'a> Parser<'a> {
    pub(crate) fn new(schema: &'a Schema, blocks: &'a Blocks) -> Self {
        let mut out = Parsed::default();
        out.filters.push(FilterDesc::default()); // descriptor 0: unfiltered
        Parser {
            schema,
            blocks,
            out,
            assigned: FxHashSet::default(),
        }
    }

    /// Parse the whole script; block 0 ends with `Term`.
    pub(crate) fn run(mut self) -> Result<Parsed> {
        let root_lines: Vec<LineItem> = self.blocks.get(0).lines.clone();
        let root = self.compile_lines(&root_lines, Op::Term)?;
        debug_assert_eq!(root, 0);
        Ok(self.out)
    }

    // ------------------------------------------------------------------
    // blocks and statements
    // ------------------------------------------------------------------

    fn new_block(&mut self) -> usize {
        self.out.code.push(Vec::new());
        self.out.code.len() - 1
    }

    fn push_op(&mut self, block: usize, op: Op, loc: SourceLoc) {
        self.out.code[block].push(Instr { op, loc });
    }

    fn compile_lines(&mut self, lines: &[LineItem], terminal: Op) -> Result<usize> {
        let block = self.new_block();
        for item in lines {
            self.statement(block, item)?;
        }
        let loc = lines.last().map(|l| loc_of(&l.words)).unwrap_or_default();
        self.push_op(block, terminal, loc);
        Ok(block)
    }

    fn statement(&mut self, block: usize, item: &LineItem) -> Result<()> {
        let words = &item.words;
        if words.is_empty() {
            return Ok(());
        }
        let head = words[0].text.as_str();
        let loc = loc_of(words);

        match head {
            "if" => self.stmt_if(block, item),
            "elsif" | "else" => Err(Error::parse(
                ErrorCode::SyntaxError,
                format!("`{}` without a preceding `if`", head),
            )
            .with_loc(loc)),
            "each_row" => self.stmt_each_row(block, item),
            "for" => self.stmt_for(block, item),
            "select" => self.stmt_select(item),
            "<<" => self.stmt_tally(block, item),
            "break" => self.stmt_break(block, item),
            "continue" => {
                self.push_op(block, Op::Continue, loc);
                Ok(())
            }
            _ => self.stmt_assign_or_expr(block, item),
        }
    }

    fn body_of(&self, item: &LineItem) -> Result<&'a Block> {
        let id = item.code_block.ok_or_else(|| {
            Error::parse(ErrorCode::SyntaxError, "statement requires a block")
                .with_loc(loc_of(&item.words))
        })?;
        let blocks: &'a Blocks = self.blocks;
        Ok(blocks.get(id))
    }

    fn stmt_if(&mut self, block: usize, item: &LineItem) -> Result<()> {
        let words = &item.words;
        let loc = loc_of(words);
        if words.len() < 2 {
            return Err(
                Error::parse(ErrorCode::SyntaxError, "`if` requires a condition").with_loc(loc)
            );
        }
        let (logic, cond_node) = self.lambda_expr(&words[1..])?;
        self.out.conditions.push(cond_node);

        let body_lines = self.body_of(item)?.lines.clone();
        let (then_lines, chain) = split_if_chain(&body_lines);
        let body = self.compile_lines(then_lines, Op::Ret)? as u32;
        let else_block = self.compile_else_chain(&chain)?;
        self.push_op(
            block,
            Op::IfCall {
                body,
                logic,
                else_block,
            },
            loc,
        );
        Ok(())
    }

    /// Compile the `elsif` / `else` tail of an `if` body into a chain of
    /// nested blocks.
    fn compile_else_chain(&mut self, chain: &[(LineItem, Vec<LineItem>)]) -> Result<Option<u32>> {
        let (head, rest) = match chain.split_first() {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let (marker, body_lines) = head;
        let loc = loc_of(&marker.words);
        if marker.words[0].text == "else" {
            return Ok(Some(self.compile_lines(body_lines, Op::Ret)? as u32));
        }
        // elsif: a one-statement block holding a nested IfCall
        let (logic, cond_node) = self.lambda_expr(&marker.words[1..])?;
        self.out.conditions.push(cond_node);
        let body = self.compile_lines(body_lines, Op::Ret)? as u32;
        let else_block = self.compile_else_chain(rest)?;
        let wrapper = self.new_block();
        self.push_op(
            wrapper,
            Op::IfCall {
                body,
                logic,
                else_block,
            },
            loc.clone(),
        );
        self.push_op(wrapper, Op::Ret, loc);
        Ok(Some(wrapper as u32))
    }

    fn stmt_each_row(&mut self, block: usize, item: &LineItem) -> Result<()> {
        let words = &item.words;
        let loc = loc_of(words);
        let mut filter = FilterDesc::default();
        let mut idx = 1;

        while idx < words.len() && words[idx].text.starts_with(CHAIN_PREFIX) {
            idx = self.each_row_chain(words, idx, &mut filter)?;
        }

        let (logic, cond_node) = if idx < words.len() {
            if words[idx].text != "where" {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    format!("expected `where`, found `{}`", words[idx].text),
                )
                .with_loc(loc.clone()));
            }
            self.lambda_expr(&words[idx + 1..])?
        } else {
            (self.lambda_true()?, IndexNode::Void)
        };
        self.out.conditions.push(cond_node);

        validate_each_row_filter(&filter, &loc)?;
        let fidx = self.add_filter(filter);
        let body_lines = self.body_of(item)?.lines.clone();
        let body = self.compile_lines(&body_lines, Op::Ret)? as u32;

        self.push_op(block, Op::LogicFilter(fidx), loc.clone());
        self.push_op(block, Op::EachCall { body, logic }, loc);
        Ok(())
    }

    /// Parse one `.<chain>(params)` on an `each_row` header.
    fn each_row_chain(
        &mut self,
        words: &[Tok],
        idx: usize,
        filter: &mut FilterDesc,
    ) -> Result<usize> {
        let loc = loc_of(words);
        let name = words[idx].text[CHAIN_PREFIX.len()..].to_string();
        let (params, next) = chain_params(words, idx + 1, &loc)?;

        let lambda_for = |parser: &mut Self, i: usize| -> Result<u32> {
            let (block, _) = parser.lambda_expr(&params[i])?;
            Ok(block)
        };

        match name.as_str() {
            "limit" => {
                expect_params(&params, 1, &name, &loc)?;
                filter.is_limit = true;
                filter.limit_block = Some(lambda_for(self, 0)?);
            }
            "reverse" => {
                expect_params(&params, 0, &name, &loc)?;
                filter.is_reverse = true;
            }
            "forward" => {
                expect_params(&params, 0, &name, &loc)?;
                filter.is_forward = true;
            }
            "next" => {
                expect_params(&params, 0, &name, &loc)?;
                filter.is_next = true;
            }
            "continue" => {
                if params.len() > 1 {
                    return Err(bad_chain_arity(&name, &loc));
                }
                filter.is_continue = true;
            }
            "from" => {
                expect_params(&params, 1, &name, &loc)?;
                filter.is_from = true;
                filter.from_block = Some(lambda_for(self, 0)?);
            }
            "range" => {
                expect_params(&params, 2, &name, &loc)?;
                filter.is_range = true;
                filter.range_start_block = Some(lambda_for(self, 0)?);
                filter.range_end_block = Some(lambda_for(self, 1)?);
            }
            "within" | "look_ahead" | "look_back" => {
                expect_params(&params, 2, &name, &loc)?;
                match name.as_str() {
                    "within" => filter.is_within = true,
                    "look_ahead" => filter.is_look_ahead = true,
                    _ => filter.is_look_back = true,
                }
                filter.within_window_block = Some(lambda_for(self, 0)?);
                filter.within_origin_block = Some(lambda_for(self, 1)?);
            }
            other => {
                return Err(Error::compile(
                    ErrorCode::BadFilterCombination,
                    format!("`.{}` cannot be applied to each_row", other),
                )
                .with_loc(loc));
            }
        }
        Ok(next)
    }

    fn stmt_for(&mut self, block: usize, item: &LineItem) -> Result<()> {
        let words = &item.words;
        let loc = loc_of(words);
        if words.len() < 4 || words[2].text != "in" || !is_identifier(&words[1].text) {
            return Err(Error::parse(
                ErrorCode::SyntaxError,
                "expected `for <var> in <expression>`",
            )
            .with_loc(loc));
        }
        let var = self.var_index(&words[1].text);
        self.assigned.insert(var);
        self.compile_expr(block, words, 3, words.len())?;
        let body_lines = self.body_of(item)?.lines.clone();
        let body = self.compile_lines(&body_lines, Op::Ret)? as u32;
        self.push_op(block, Op::ForCall { body, var }, loc);
        Ok(())
    }

    fn stmt_select(&mut self, item: &LineItem) -> Result<()> {
        let body = self.body_of(item)?;
        // select lines are plain declarations; regroup the block's
        // tokens by source line
        let mut groups: Vec<Vec<Tok>> = Vec::new();
        for line in &body.lines {
            for tok in &line.words {
                match groups.last_mut() {
                    Some(group) if group[0].line == tok.line => group.push(tok.clone()),
                    _ => groups.push(vec![tok.clone()]),
                }
            }
        }

        for group in groups {
            let loc = loc_of(&group);
            let modifier = match group[0].text.as_str() {
                "count" => AggModifier::Count,
                "sum" => AggModifier::Sum,
                "min" => AggModifier::Min,
                "max" => AggModifier::Max,
                "avg" => AggModifier::Avg,
                "value" => AggModifier::Value,
                "var" => AggModifier::Var,
                "dist_count_person" => AggModifier::DistCountPerson,
                other => {
                    return Err(Error::parse(
                        ErrorCode::SyntaxError,
                        format!("unknown select modifier `{}`", other),
                    )
                    .with_loc(loc));
                }
            };
            if group.len() < 2 {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    "select column requires a name",
                )
                .with_loc(loc));
            }
            let col_name = &group[1].text;
            let column = if modifier == AggModifier::Var {
                None
            } else {
                let id = self.column_id(col_name, &loc)?;
                // select columns join the projection even when no op
                // references them
                self.column_ref(id);
                Some(id)
            };

            let mut name = col_name.clone();
            let mut distinct_key = None;
            let mut i = 2;
            while i < group.len() {
                match group[i].text.as_str() {
                    "as" if i + 1 < group.len() => {
                        name = group[i + 1].text.clone();
                        i += 2;
                    }
                    "key" if i + 1 < group.len() => {
                        let id = self.column_id(&group[i + 1].text, &loc)?;
                        self.column_ref(id);
                        distinct_key = Some(id);
                        i += 2;
                    }
                    other => {
                        return Err(Error::parse(
                            ErrorCode::SyntaxError,
                            format!("unexpected `{}` in select column", other),
                        )
                        .with_loc(loc));
                    }
                }
            }
            self.out.selects.push(SelectColumn {
                modifier,
                column,
                name,
                distinct_key,
            });
        }
        Ok(())
    }

    fn stmt_tally(&mut self, block: usize, item: &LineItem) -> Result<()> {
        let words = &item.words;
        let loc = loc_of(words);
        let args = split_top_level(words, 1, words.len(), ",");
        if args.is_empty() {
            return Err(
                Error::parse(ErrorCode::SyntaxError, "`<<` requires group keys").with_loc(loc)
            );
        }
        let argc = args.len() as u8;
        for (start, end) in args {
            self.compile_expr(block, words, start, end)?;
        }
        self.push_op(block, Op::TallyCall { argc }, loc);
        Ok(())
    }

    fn stmt_break(&mut self, block: usize, item: &LineItem) -> Result<()> {
        let words = &item.words;
        let loc = loc_of(words);
        let n = if words.len() == 1 {
            1
        } else {
            // break ( <depth> )
            if words.len() != 4 || words[1].text != "(" || words[3].text != ")" {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    "expected `break`, `break(n)`, `break(\"all\")`, or `break(\"top\")`",
                )
                .with_loc(loc));
            }
            let arg = words[2].text.as_str();
            if is_string_literal(arg) {
                match strip_quotes(arg) {
                    "all" => BREAK_ALL,
                    "top" => BREAK_TOP,
                    other => {
                        return Err(Error::parse(
                            ErrorCode::SyntaxError,
                            format!("bad break target `{}`", other),
                        )
                        .with_loc(loc));
                    }
                }
            } else {
                arg.parse::<u32>().map_err(|_| {
                    Error::parse(ErrorCode::SyntaxError, "break depth must be an integer")
                        .with_loc(loc.clone())
                })?
            }
        };
        self.push_op(block, Op::Break(n), loc);
        Ok(())
    }

    fn stmt_assign_or_expr(&mut self, block: usize, item: &LineItem) -> Result<()> {
        let words = &item.words;
        let loc = loc_of(words);

        // top-level assignment?
        if let Some((eq_pos, compound)) = find_assignment(words) {
            if eq_pos == 0 || !is_identifier(&words[0].text) {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    "assignment target must be a variable",
                )
                .with_loc(loc));
            }
            if eq_pos + 1 >= words.len() {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    "assignment requires a right-hand side",
                )
                .with_loc(loc));
            }
            let name = &words[0].text;
            if self.schema.is_column(name) {
                return Err(Error::compile(
                    ErrorCode::ReservedWord,
                    format!("cannot assign to column `{}`", name),
                )
                .with_loc(loc));
            }
            if MARSHALS.contains_key(name.as_str()) {
                return Err(Error::compile(
                    ErrorCode::ReservedWord,
                    format!("cannot assign to built-in `{}`", name),
                )
                .with_loc(loc));
            }
            let var = self.var_index(name);

            // subscripted target: keys pushed first
            let depth = if eq_pos > 1 {
                let subs = split_subscripts(words, 1, eq_pos, &loc)?;
                for (start, end) in &subs {
                    self.compile_expr(block, words, *start, *end)?;
                }
                subs.len() as u8
            } else {
                0
            };

            if depth == 0 && compound.is_none() {
                // plain assignment: RHS may be an inline aggregator
                if !self.try_inline_agg(block, words, eq_pos + 1, words.len())? {
                    self.compile_expr(block, words, eq_pos + 1, words.len())?;
                }
            } else {
                if let Some(op) = compound {
                    if depth > 0 {
                        return Err(Error::parse(
                            ErrorCode::SyntaxError,
                            "compound assignment not supported on subscripts",
                        )
                        .with_loc(loc));
                    }
                    self.require_assigned(var, name, &loc)?;
                    self.push_op(block, Op::PushUser(var), loc.clone());
                    self.compile_expr(block, words, eq_pos + 1, words.len())?;
                    self.push_op(block, op, loc.clone());
                } else {
                    self.require_assigned(var, name, &loc)?;
                    self.compile_expr(block, words, eq_pos + 1, words.len())?;
                }
            }

            self.assigned.insert(var);
            if depth == 0 {
                self.push_op(block, Op::PopUser(var), loc);
            } else {
                self.push_op(block, Op::PopUserObj { var, depth }, loc);
            }
            return Ok(());
        }

        // bare expression statement (marshal call, column test, …). At
        // the script root its value is the program result — segment
        // scripts are often just a boolean column expression — so it
        // contributes to index extraction like a condition.
        let node = self.compile_expr(block, words, 0, words.len())?;
        if block == 0 {
            self.out.conditions.push(node);
        }
        Ok(())
    }

    /// `x = sum(price) where event == "purchase"` style right-hand side.
    fn try_inline_agg(
        &mut self,
        block: usize,
        words: &[Tok],
        start: usize,
        end: usize,
    ) -> Result<bool> {
        if start >= end || start + 1 >= end || words[start + 1].text != "(" {
            return Ok(false);
        }
        let agg = match INLINE_AGGS
            .iter()
            .find(|(name, _)| *name == words[start].text.as_str())
        {
            Some((_, agg)) => *agg,
            None => return Ok(false),
        };
        let loc = loc_of(words);
        let close = match_paren(words, start + 1, end, &loc)?;
        let (eval, _) = self.lambda_expr(&words[start + 2..close])?;
        let logic = if close + 1 < end {
            if words[close + 1].text != "where" {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    "expected `where` after inline aggregator",
                )
                .with_loc(loc.clone()));
            }
            let (logic, node) = self.lambda_expr(&words[close + 2..end])?;
            self.out.conditions.push(node);
            logic
        } else {
            self.lambda_true()?
        };
        self.out.void_seen = true; // aggregate results are not indexable
        self.push_op(block, Op::AggCall { agg, eval, logic }, loc);
        Ok(true)
    }

    // ------------------------------------------------------------------
    // expressions
    // ------------------------------------------------------------------

    /// Compile an expression into a fresh lambda block ending in `Ret`.
    fn lambda_expr(&mut self, words: &[Tok]) -> Result<(u32, IndexNode)> {
        let block = self.new_block();
        let node = if words.is_empty() {
            self.push_op(block, Op::PushTrue, SourceLoc::default());
            IndexNode::Void
        } else {
            self.compile_expr(block, words, 0, words.len())?
        };
        let loc = words.first().map(|_| loc_of(words)).unwrap_or_default();
        self.push_op(block, Op::Ret, loc);
        Ok((block as u32, node))
    }

    fn lambda_true(&mut self) -> Result<u32> {
        let block = self.new_block();
        self.push_op(block, Op::PushTrue, SourceLoc::default());
        self.push_op(block, Op::Ret, SourceLoc::default());
        Ok(block as u32)
    }

    /// Compile `words[start..end]`, emitting ops into `block` and
    /// returning the expression's index tree.
    fn compile_expr(
        &mut self,
        block: usize,
        words: &[Tok],
        start: usize,
        end: usize,
    ) -> Result<IndexNode> {
        let loc = loc_of(&words[start.min(words.len())..end.min(words.len())]);
        let mut pending: Vec<String> = Vec::new();
        let mut nodes: Vec<IndexNode> = Vec::new();
        let mut idx = start;

        while idx < end {
            let text = words[idx].text.as_str();

            // comparisons emit immediately, right side parsed now
            if let Some(cmp) = comparison_op(text) {
                let lhs = nodes.pop().unwrap_or(IndexNode::Void);
                // a set-valued column on the left of an existential
                // test pushes its logical set, not the physical cell
                if matches!(text, "==" | "!=" | "in" | "contains" | "any") {
                    if let Some(Instr {
                        op: Op::PushColumn(col_ref),
                        ..
                    }) = self.out.code[block].last()
                    {
                        let col = self.out.columns[*col_ref as usize];
                        if self
                            .schema
                            .get_by_id(col)
                            .map(|c| c.set_valued)
                            .unwrap_or(false)
                        {
                            let col_ref = *col_ref;
                            self.out.code[block].last_mut().unwrap().op =
                                Op::PushColumnSet(col_ref);
                        }
                    }
                }
                if idx + 1 >= end {
                    return Err(Error::parse(
                        ErrorCode::SyntaxError,
                        format!("`{}` missing its right-hand side", text),
                    )
                    .with_loc(loc));
                }
                let (next_idx, rhs) = self.comparison_rhs(block, words, idx + 1, end)?;
                self.push_op(block, cmp_op_code(text), loc.clone());
                let node = combine_comparison(text, cmp, lhs, rhs);
                if node == IndexNode::Void {
                    self.out.void_seen = true;
                }
                nodes.push(node);
                idx = next_idx;
                continue;
            }

            // deferred logic / arithmetic
            if matches!(text, "&&" | "||" | "+" | "-" | "*" | "/") {
                pending.push(text.to_string());
                idx += 1;
                continue;
            }

            if text == "(" {
                let close = match_paren(words, idx, end, &loc)?;
                let node = self.compile_expr(block, words, idx + 1, close)?;
                nodes.push(node);
                idx = close + 1;
                continue;
            }

            if text == ")" || text == "]" || text == "}" {
                return Err(Error::parse(
                    ErrorCode::UnmatchedBracket,
                    format!("unexpected `{}`", text),
                )
                .with_loc(loc));
            }

            if text == "[" {
                let (next_idx, _literals) = self.compile_array(block, words, idx, end)?;
                nodes.push(IndexNode::Void);
                self.out.void_seen = true;
                idx = next_idx;
                continue;
            }

            if text == "{" {
                let next_idx = self.compile_dict(block, words, idx, end)?;
                nodes.push(IndexNode::Void);
                self.out.void_seen = true;
                idx = next_idx;
                continue;
            }

            let (next_idx, node) = self.compile_operand(block, words, idx, end)?;
            nodes.push(node);
            idx = next_idx;
        }

        // flush deferred operators in reverse
        for op_text in pending.iter().rev() {
            let op = match op_text.as_str() {
                "&&" => Op::And,
                "||" => Op::Or,
                "+" => Op::Add,
                "-" => Op::Sub,
                "*" => Op::Mul,
                _ => Op::Div,
            };
            self.push_op(block, op, loc.clone());
            let rhs = nodes.pop().unwrap_or(IndexNode::Void);
            let lhs = nodes.pop().unwrap_or(IndexNode::Void);
            let node = match op_text.as_str() {
                "&&" => IndexNode::And(Box::new(lhs.as_boolean()), Box::new(rhs.as_boolean())),
                "||" => IndexNode::Or(Box::new(lhs.as_boolean()), Box::new(rhs.as_boolean())),
                _ => {
                    self.out.void_seen = true;
                    IndexNode::Void
                }
            };
            nodes.push(node);
        }

        Ok(nodes.pop().unwrap_or(IndexNode::Void))
    }

    /// Parse a comparison's right-hand side: a parenthesized expression,
    /// a list literal, or a single operand.
    fn comparison_rhs(
        &mut self,
        block: usize,
        words: &[Tok],
        idx: usize,
        end: usize,
    ) -> Result<(usize, IndexNode)> {
        let loc = loc_of(&words[idx..end]);
        match words[idx].text.as_str() {
            "(" => {
                let close = match_paren(words, idx, end, &loc)?;
                let node = self.compile_expr(block, words, idx + 1, close)?;
                Ok((close + 1, node))
            }
            "[" => {
                let (next_idx, literals) = self.compile_array(block, words, idx, end)?;
                Ok((next_idx, IndexNode::ListLiteral(literals)))
            }
            "{" => {
                let next_idx = self.compile_dict(block, words, idx, end)?;
                self.out.void_seen = true;
                Ok((next_idx, IndexNode::Void))
            }
            _ => self.compile_operand(block, words, idx, end),
        }
    }

    /// One operand: literal, column (with optional filter chain), user
    /// variable (with optional subscripts or method call), or marshal
    /// call.
    fn compile_operand(
        &mut self,
        block: usize,
        words: &[Tok],
        idx: usize,
        end: usize,
    ) -> Result<(usize, IndexNode)> {
        let tok = &words[idx];
        let text = tok.text.as_str();
        let loc = loc_of(&words[idx..end.min(words.len())]);

        // literals
        if let Some(value) = literal_value(text)? {
            let node = IndexNode::Literal(value.clone());
            match value {
                Value::Int(i) => self.push_op(block, Op::PushInt(i), loc.clone()),
                Value::Float(f) => self.push_op(block, Op::PushFloat(f), loc.clone()),
                Value::Bool(true) => self.push_op(block, Op::PushTrue, loc.clone()),
                Value::Bool(false) => self.push_op(block, Op::PushFalse, loc.clone()),
                Value::Nil => self.push_op(block, Op::PushNil, loc.clone()),
                other => {
                    let lit = self.literal_index(other);
                    self.push_op(block, Op::PushLiteral(lit), loc.clone());
                }
            }
            // pure methods chain off literals: `"a,b,c".split(",")`
            let next = words.get(idx + 1).map(|t| t.text.as_str()).unwrap_or("");
            if let Some(chain) = next.strip_prefix(CHAIN_PREFIX) {
                let sig = MARSHALS.get(chain).copied().ok_or_else(|| {
                    Error::parse(
                        ErrorCode::SyntaxError,
                        format!("unknown method `.{}`", chain),
                    )
                    .with_loc(loc.clone())
                })?;
                if !sig.is_method || mutates_receiver(sig.marshal) {
                    return Err(Error::parse(
                        ErrorCode::SyntaxError,
                        format!("`.{}` cannot be applied to a literal", chain),
                    )
                    .with_loc(loc));
                }
                let name = chain.to_string();
                let (params, next_idx) = chain_params(words, idx + 2, &loc)?;
                let argc = params.len() as u8 + 1;
                if argc < sig.min_argc || argc > sig.max_argc {
                    return Err(arity_error(&name, sig.min_argc, sig.max_argc, argc)
                        .with_loc(loc));
                }
                for param in &params {
                    self.compile_expr_toks(block, param)?;
                }
                self.push_op(
                    block,
                    Op::Call {
                        marshal: sig.marshal,
                        argc,
                    },
                    loc,
                );
                self.out.void_seen = true;
                return Ok((next_idx, IndexNode::Void));
            }
            return Ok((idx + 1, node));
        }

        if !is_identifier(text) {
            return Err(Error::parse(
                ErrorCode::SyntaxError,
                format!("unexpected token `{}`", text),
            )
            .with_loc(loc));
        }

        let next = words.get(idx + 1).map(|t| t.text.as_str()).unwrap_or("");

        // marshal call
        if let Some(sig) = MARSHALS.get(text).copied() {
            if next != "(" && sig.min_argc > 0 {
                return Err(Error::parse(
                    ErrorCode::SyntaxError,
                    format!("built-in `{}` must be called", text),
                )
                .with_loc(loc));
            }
            return self.compile_call(block, words, idx, end, text, sig, None);
        }

        // column reference, possibly with a filter chain
        if let Some(col) = self.schema.get_by_name(text) {
            let col_id = col.id;
            if next.starts_with(CHAIN_PREFIX) {
                return self.column_chain(block, words, idx, end, col_id);
            }
            let col_ref = self.column_ref(col_id);
            self.push_op(block, Op::PushColumn(col_ref), loc);
            let node = if matches!(col_id, COL_ID | COL_STAMP | COL_SESSION) {
                self.out.void_seen = true;
                IndexNode::Void
            } else {
                IndexNode::Column(col_id)
            };
            return Ok((idx + 1, node));
        }

        // user variable
        let var = self.var_index(text);

        if next.starts_with(CHAIN_PREFIX) {
            // method call: list.append(x) etc.
            return self.compile_method(block, words, idx, end, var);
        }

        if next == "[" {
            self.require_assigned(var, text, &loc)?;
            let subs = split_subscripts(words, idx + 1, end, &loc)?;
            let mut last = idx + 1;
            for (s, e) in &subs {
                self.compile_expr(block, words, *s, *e)?;
                last = *e + 1; // past the closing `]`
            }
            let depth = subs.len() as u8;
            self.push_op(block, Op::PushUserObj { var, depth }, loc);
            self.out.void_seen = true;
            return Ok((last, IndexNode::Void));
        }

        self.require_assigned(var, text, &loc)?;
        self.push_op(block, Op::PushUser(var), loc);
        self.out.void_seen = true;
        Ok((idx + 1, IndexNode::Void))
    }

    /// Compile a marshal call; `receiver` carries a method call's
    /// receiver variable.
    fn compile_call(
        &mut self,
        block: usize,
        words: &[Tok],
        idx: usize,
        end: usize,
        name: &str,
        sig: crate::program::MarshalSig,
        receiver: Option<u32>,
    ) -> Result<(usize, IndexNode)> {
        let loc = loc_of(&words[idx..end.min(words.len())]);
        let (params, next) = if words.get(idx + 1).map(|t| t.text.as_str()) == Some("(") {
            chain_params(words, idx + 1, &loc)?
        } else {
            (Vec::new(), idx + 1)
        };

        let mut argc = params.len() as u8;
        if let Some(var) = receiver {
            self.push_op(block, Op::PushUser(var), loc.clone());
            argc += 1;
        }
        if argc < sig.min_argc || argc > sig.max_argc {
            return Err(arity_error(name, sig.min_argc, sig.max_argc, argc).with_loc(loc.clone()));
        }
        for param in &params {
            self.compile_expr_toks(block, param)?;
        }
        self.push_op(
            block,
            Op::Call {
                marshal: sig.marshal,
                argc,
            },
            loc.clone(),
        );
        // mutating methods push the updated receiver for write-back
        if sig.is_method {
            if let Some(var) = receiver {
                if mutates_receiver(sig.marshal) {
                    self.push_op(block, Op::PopUser(var), loc);
                }
            }
        }
        self.out.void_seen = true;
        Ok((next, IndexNode::Void))
    }

    fn compile_method(
        &mut self,
        block: usize,
        words: &[Tok],
        idx: usize,
        end: usize,
        var: u32,
    ) -> Result<(usize, IndexNode)> {
        let loc = loc_of(&words[idx..end.min(words.len())]);
        let chain = &words[idx + 1].text[CHAIN_PREFIX.len()..];
        let name = chain.to_string();
        let sig = MARSHALS.get(name.as_str()).copied().ok_or_else(|| {
            Error::parse(
                ErrorCode::SyntaxError,
                format!("unknown method `.{}`", name),
            )
            .with_loc(loc.clone())
        })?;
        if !sig.is_method {
            return Err(Error::parse(
                ErrorCode::SyntaxError,
                format!("`{}` is not a method", name),
            )
            .with_loc(loc));
        }
        self.require_assigned(var, &words[idx].text, &loc)?;
        self.compile_call(block, words, idx + 1, end, &name, sig, Some(var))
    }

    /// Column with a dot-chain: `.ever/.never/.is/.row` plus window
    /// chains, materialized as a filter descriptor.
    fn column_chain(
        &mut self,
        block: usize,
        words: &[Tok],
        idx: usize,
        end: usize,
        col_id: cohort_table::schema::ColumnId,
    ) -> Result<(usize, IndexNode)> {
        let loc = loc_of(&words[idx..end.min(words.len())]);
        let col_ref = self.column_ref(col_id);
        let mut filter = FilterDesc {
            column: Some(col_ref),
            ..FilterDesc::default()
        };
        let mut node = IndexNode::Void;
        let mut literal_rhs: Option<Value> = None;
        let mut i = idx + 1;

        while i < end && words[i].text.starts_with(CHAIN_PREFIX) {
            let name = words[i].text[CHAIN_PREFIX.len()..].to_string();
            let (params, next) = chain_params(words, i + 1, &loc)?;
            match name.as_str() {
                "ever" | "never" | "is" | "row" => {
                    expect_params(&params, 1, &name, &loc)?;
                    let param = &params[0];
                    let cmp = param
                        .first()
                        .and_then(|t| comparison_op(&t.text))
                        .ok_or_else(|| {
                            Error::parse(
                                ErrorCode::SyntaxError,
                                format!("`.{}` expects `(<op> <value>)`", name),
                            )
                            .with_loc(loc.clone())
                        })?;
                    filter.comparator = Some(cmp);
                    match name.as_str() {
                        "ever" => filter.is_ever = true,
                        "never" => filter.is_never = true,
                        _ => filter.is_row = true,
                    }
                    // single-literal right sides stay indexable
                    if param.len() == 2 {
                        literal_rhs = literal_value(&param[1].text)?;
                    }
                    let (eval, _) = self.lambda_expr(&param[1..])?;
                    filter.eval_block = Some(eval);
                }
                "within" | "look_ahead" | "look_back" => {
                    expect_params(&params, 2, &name, &loc)?;
                    match name.as_str() {
                        "within" => filter.is_within = true,
                        "look_ahead" => filter.is_look_ahead = true,
                        _ => filter.is_look_back = true,
                    }
                    let (window, _) = self.lambda_expr(&params[0])?;
                    let (origin, _) = self.lambda_expr(&params[1])?;
                    filter.within_window_block = Some(window);
                    filter.within_origin_block = Some(origin);
                }
                other => {
                    return Err(Error::compile(
                        ErrorCode::BadFilterCombination,
                        format!("`.{}` cannot be applied to a column", other),
                    )
                    .with_loc(loc));
                }
            }
            i = next;
        }

        validate_column_filter(&filter, &loc)?;

        // index tree: .ever/.is/.row become a term; .never negates it.
        // Computed built-ins have no inverted index and void out.
        let indexable = !matches!(col_id, COL_ID | COL_STAMP | COL_SESSION);
        if !indexable {
            self.out.void_seen = true;
        }
        if let (true, Some(cmp), Some(value)) = (indexable, filter.comparator, literal_rhs) {
            let term = IndexNode::Term(cohort_index::IndexTerm {
                col: col_id,
                op: cmp,
                value,
            });
            node = if filter.is_never {
                IndexNode::Not(Box::new(term))
            } else {
                term
            };
        } else {
            self.out.void_seen = true;
        }

        let fidx = self.add_filter(filter);
        self.push_op(block, Op::ColumnFilter(fidx), loc);
        Ok((i, node))
    }

    /// `[a, b, c]` literal; returns the literal element values when
    /// every element is a bare literal (membership normalization).
    fn compile_array(
        &mut self,
        block: usize,
        words: &[Tok],
        idx: usize,
        end: usize,
    ) -> Result<(usize, Option<Vec<Value>>)> {
        let loc = loc_of(&words[idx..end.min(words.len())]);
        let close = match_square(words, idx, end, &loc)?;
        let elements = split_top_level(words, idx + 1, close, ",");
        let mut literals: Option<Vec<Value>> = Some(Vec::new());
        for (s, e) in &elements {
            self.compile_expr(block, words, *s, *e)?;
            match (e - s == 1).then(|| literal_value(&words[*s].text)).and_then(|r| r.ok()).flatten() {
                Some(v) => {
                    if let Some(list) = literals.as_mut() {
                        list.push(v);
                    }
                }
                None => literals = None,
            }
        }
        self.push_op(
            block,
            Op::Call {
                marshal: Marshal::MakeList,
                argc: elements.len() as u8,
            },
            loc,
        );
        Ok((close + 1, literals))
    }

    /// `{k: v, …}` literal. Bare identifier keys read as strings.
    fn compile_dict(
        &mut self,
        block: usize,
        words: &[Tok],
        idx: usize,
        end: usize,
    ) -> Result<usize> {
        let loc = loc_of(&words[idx..end.min(words.len())]);
        let close = match_curly(words, idx, end, &loc)?;
        let entries = split_top_level(words, idx + 1, close, ",");
        for (s, e) in &entries {
            let colon = seek_top_level(words, *s, *e, ":").ok_or_else(|| {
                Error::parse(ErrorCode::SyntaxError, "dict entry requires `key: value`")
                    .with_loc(loc.clone())
            })?;
            // bare identifier key → string literal
            if colon - s == 1 && is_identifier(&words[*s].text) {
                let lit = self.literal_index(Value::text(&words[*s].text));
                self.push_op(block, Op::PushLiteral(lit), loc.clone());
            } else {
                self.compile_expr(block, words, *s, colon)?;
            }
            self.compile_expr(block, words, colon + 1, *e)?;
        }
        self.push_op(
            block,
            Op::Call {
                marshal: Marshal::MakeDict,
                argc: (entries.len() * 2) as u8,
            },
            loc,
        );
        Ok(close + 1)
    }

    fn compile_expr_toks(&mut self, block: usize, toks: &[Tok]) -> Result<IndexNode> {
        if toks.is_empty() {
            return Ok(IndexNode::Void);
        }
        self.compile_expr(block, toks, 0, toks.len())
    }

    // ------------------------------------------------------------------
    // tracking tables
    // ------------------------------------------------------------------

    fn var_index(&mut self, name: &str) -> u32 {
        if let Some(pos) = self.out.user_vars.iter().position(|v| v == name) {
            return pos as u32;
        }
        self.out.user_vars.push(name.to_string());
        (self.out.user_vars.len() - 1) as u32
    }

    fn require_assigned(&self, var: u32, name: &str, loc: &SourceLoc) -> Result<()> {
        if !self.assigned.contains(&var) {
            return Err(Error::compile(
                ErrorCode::UndefinedVariable,
                format!("variable `{}` read before assignment", name),
            )
            .with_loc(loc.clone()));
        }
        Ok(())
    }

    fn literal_index(&mut self, value: Value) -> u32 {
        if let Some(pos) = self.out.literals.iter().position(|v| *v == value) {
            return pos as u32;
        }
        self.out.literals.push(value);
        (self.out.literals.len() - 1) as u32
    }

    fn column_ref(&mut self, col: cohort_table::schema::ColumnId) -> u32 {
        if let Some(pos) = self.out.columns.iter().position(|c| *c == col) {
            return pos as u32;
        }
        self.out.columns.push(col);
        (self.out.columns.len() - 1) as u32
    }

    fn column_id(&mut self, name: &str, loc: &SourceLoc) -> Result<cohort_table::schema::ColumnId> {
        self.schema
            .get_by_name(name)
            .map(|c| c.id)
            .ok_or_else(|| {
                Error::compile(
                    ErrorCode::UnknownColumn,
                    format!("unknown column `{}`", name),
                )
                .with_loc(loc.clone())
            })
    }

    fn add_filter(&mut self, filter: FilterDesc) -> u32 {
        if filter.is_default() && filter.column.is_none() {
            return 0;
        }
        self.out.filters.push(filter);
        (self.out.filters.len() - 1) as u32
    }
}

// ----------------------------------------------------------------------
// helpers
// ----------------------------------------------------------------------

fn comparison_op(text: &str) -> Option<CmpOp> {
    match text {
        "==" => Some(CmpOp::Eq),
        "!=" => Some(CmpOp::Neq),
        ">" => Some(CmpOp::Gt),
        ">=" => Some(CmpOp::Gte),
        "<" => Some(CmpOp::Lt),
        "<=" => Some(CmpOp::Lte),
        "in" | "contains" | "any" => Some(CmpOp::Eq), // membership: index side only
        _ => None,
    }
}

fn cmp_op_code(text: &str) -> Op {
    match text {
        "==" => Op::Eq,
        "!=" => Op::Neq,
        ">" => Op::Gt,
        ">=" => Op::Gte,
        "<" => Op::Lt,
        "<=" => Op::Lte,
        "in" => Op::In,
        "contains" => Op::Contains,
        _ => Op::AnyOf,
    }
}

fn combine_comparison(text: &str, cmp: CmpOp, lhs: IndexNode, rhs: IndexNode) -> IndexNode {
    match text {
        "in" => match rhs {
            IndexNode::ListLiteral(Some(items)) => IndexNode::membership(lhs, Some(&items)),
            _ => IndexNode::Void,
        },
        // `col contains "x"` / `col any [..]`: existential over the
        // column's (set) values
        "contains" | "any" => match (lhs, rhs) {
            (IndexNode::Column(col), IndexNode::Literal(value)) => {
                IndexNode::Term(cohort_index::IndexTerm {
                    col,
                    op: CmpOp::Eq,
                    value,
                })
            }
            (IndexNode::Column(col), IndexNode::ListLiteral(Some(items))) => {
                IndexNode::membership(IndexNode::Column(col), Some(&items))
            }
            _ => IndexNode::Void,
        },
        _ => IndexNode::compare(cmp, lhs, rhs),
    }
}

fn mutates_receiver(marshal: Marshal) -> bool {
    matches!(
        marshal,
        Marshal::Append
            | Marshal::Pop
            | Marshal::Clear
            | Marshal::Add
            | Marshal::Remove
            | Marshal::Update
    )
}

/// Literal token → value (`None` when the token is not a literal).
fn literal_value(text: &str) -> Result<Option<Value>> {
    if is_string_literal(text) {
        return Ok(Some(Value::text(strip_quotes(text))));
    }
    if time::is_shorthand(text) {
        return Ok(Some(Value::Int(time::expand_shorthand(text)?)));
    }
    if is_float_literal(text) {
        return Ok(text.parse::<f64>().ok().map(Value::Float));
    }
    if is_digitish(text) {
        return Ok(text.parse::<i64>().ok().map(Value::Int));
    }
    match text {
        "true" | "True" => Ok(Some(Value::Bool(true))),
        "false" | "False" => Ok(Some(Value::Bool(false))),
        "nil" | "None" => Ok(Some(Value::Nil)),
        _ => Ok(None),
    }
}

/// Find a top-level plain or compound assignment operator.
fn find_assignment(words: &[Tok]) -> Option<(usize, Option<Op>)> {
    let mut depth = 0i32;
    for (i, tok) in words.iter().enumerate() {
        match tok.text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            "=" if depth == 0 => return Some((i, None)),
            "+=" if depth == 0 => return Some((i, Some(Op::Add))),
            "-=" if depth == 0 => return Some((i, Some(Op::Sub))),
            "*=" if depth == 0 => return Some((i, Some(Op::Mul))),
            "/=" if depth == 0 => return Some((i, Some(Op::Div))),
            _ => {}
        }
    }
    None
}

/// Split `words[start..end]` on a top-level separator.
fn split_top_level(words: &[Tok], start: usize, end: usize, sep: &str) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut seg_start = start;
    for i in start..end {
        match words[i].text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            s if s == sep && depth == 0 => {
                out.push((seg_start, i));
                seg_start = i + 1;
            }
            _ => {}
        }
    }
    if seg_start < end {
        out.push((seg_start, end));
    }
    out
}

fn seek_top_level(words: &[Tok], start: usize, end: usize, what: &str) -> Option<usize> {
    let mut depth = 0i32;
    for i in start..end {
        match words[i].text.as_str() {
            "(" | "[" | "{" => depth += 1,
            ")" | "]" | "}" => depth -= 1,
            s if s == what && depth == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

fn match_delim(
    words: &[Tok],
    open_at: usize,
    end: usize,
    open: &str,
    close: &str,
    loc: &SourceLoc,
) -> Result<usize> {
    let mut depth = 0i32;
    for i in open_at..end {
        let t = words[i].text.as_str();
        if t == open {
            depth += 1;
        } else if t == close {
            depth -= 1;
            if depth == 0 {
                return Ok(i);
            }
        }
    }
    Err(Error::parse(
        ErrorCode::UnmatchedBracket,
        format!("`{}` without matching `{}`", open, close),
    )
    .with_loc(loc.clone()))
}

fn match_paren(words: &[Tok], open_at: usize, end: usize, loc: &SourceLoc) -> Result<usize> {
    match_delim(words, open_at, end, "(", ")", loc)
}

fn match_square(words: &[Tok], open_at: usize, end: usize, loc: &SourceLoc) -> Result<usize> {
    match_delim(words, open_at, end, "[", "]", loc)
}

fn match_curly(words: &[Tok], open_at: usize, end: usize, loc: &SourceLoc) -> Result<usize> {
    match_delim(words, open_at, end, "{", "}", loc)
}

/// Parse `( p1, p2, … )` after a chain or call name; returns the param
/// token slices and the index past the `)`.
fn chain_params(words: &[Tok], open_at: usize, loc: &SourceLoc) -> Result<(Vec<Vec<Tok>>, usize)> {
    if words.get(open_at).map(|t| t.text.as_str()) != Some("(") {
        return Err(
            Error::parse(ErrorCode::SyntaxError, "expected `(` after chain").with_loc(loc.clone())
        );
    }
    let close = match_paren(words, open_at, words.len(), loc)?;
    let params = split_top_level(words, open_at + 1, close, ",")
        .into_iter()
        .map(|(s, e)| words[s..e].to_vec())
        .collect();
    Ok((params, close + 1))
}

/// Parse consecutive `[expr]` groups; returns the inner ranges.
fn split_subscripts(
    words: &[Tok],
    start: usize,
    end: usize,
    loc: &SourceLoc,
) -> Result<Vec<(usize, usize)>> {
    let mut out = Vec::new();
    let mut i = start;
    while i < end && words[i].text == "[" {
        let close = match_square(words, i, end, loc)?;
        out.push((i + 1, close));
        i = close + 1;
    }
    if out.is_empty() {
        return Err(
            Error::parse(ErrorCode::SyntaxError, "expected a subscript").with_loc(loc.clone())
        );
    }
    Ok(out)
}

fn expect_params(params: &[Vec<Tok>], n: usize, chain: &str, loc: &SourceLoc) -> Result<()> {
    if params.len() != n && !(n == 0 && params.len() == 1 && params[0].is_empty()) {
        return Err(bad_chain_arity(chain, loc));
    }
    Ok(())
}

fn bad_chain_arity(chain: &str, loc: &SourceLoc) -> Error {
    Error::parse(
        ErrorCode::SyntaxError,
        format!("wrong number of parameters to `.{}`", chain),
    )
    .with_loc(loc.clone())
}

fn validate_each_row_filter(filter: &FilterDesc, loc: &SourceLoc) -> Result<()> {
    let bad = |what: &str| {
        Err(Error::compile(ErrorCode::BadFilterCombination, what.to_string()).with_loc(loc.clone()))
    };
    if filter.is_forward && filter.is_reverse {
        return bad("`.forward` and `.reverse` are mutually exclusive");
    }
    if filter.is_look_ahead && filter.is_look_back {
        return bad("`.look_ahead` and `.look_back` are mutually exclusive");
    }
    if filter.is_range && (filter.is_within || filter.is_look_ahead || filter.is_look_back) {
        return bad("`.range` cannot combine with `.within`/`.look_*`");
    }
    if filter.is_ever || filter.is_never || filter.is_row {
        return bad("column filters cannot be applied to each_row");
    }
    Ok(())
}

fn validate_column_filter(filter: &FilterDesc, loc: &SourceLoc) -> Result<()> {
    let bad = |what: &str| {
        Err(Error::compile(ErrorCode::BadFilterCombination, what.to_string()).with_loc(loc.clone()))
    };
    let modes =
        usize::from(filter.is_ever) + usize::from(filter.is_never) + usize::from(filter.is_row);
    if modes > 1 {
        return bad("`.ever`, `.never`, and `.row` are mutually exclusive");
    }
    if modes == 0 {
        return bad("column chain requires `.ever`, `.never`, or `.row`");
    }
    if filter.is_look_ahead && filter.is_look_back {
        return bad("`.look_ahead` and `.look_back` are mutually exclusive");
    }
    if filter.is_limit || filter.is_from || filter.is_continue || filter.is_next
        || filter.is_reverse || filter.is_forward || filter.is_range
    {
        return bad("iteration filters cannot be applied to a column");
    }
    Ok(())
}

/// Split an `if` body's lines into the `then` segment and the
/// `elsif`/`else` chain (marker line + following lines each).
fn split_if_chain(lines: &[LineItem]) -> (&[LineItem], Vec<(LineItem, Vec<LineItem>)>) {
    let mut markers = Vec::new();
    for (i, line) in lines.iter().enumerate() {
        if let Some(first) = line.words.first() {
            if first.text == "else" || first.text == "elsif" {
                markers.push(i);
            }
        }
    }
    if markers.is_empty() {
        return (lines, Vec::new());
    }
    let then_lines = &lines[..markers[0]];
    let mut chain = Vec::new();
    for (mi, &at) in markers.iter().enumerate() {
        let seg_end = markers.get(mi + 1).copied().unwrap_or(lines.len());
        chain.push((lines[at].clone(), lines[at + 1..seg_end].to_vec()));
    }
    (then_lines, chain)
}

fn arity_error(name: &str, min: u8, max: u8, got: u8) -> Error {
    Error::compile(
        ErrorCode::BadArity,
        format!("`{}` takes {}-{} arguments, got {}", name, min, max, got),
    )
}

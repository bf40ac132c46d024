//! The interpreter
//!
//! Executes a compiled [`Program`] against one entity's grid. Control
//! flow between blocks travels as a [`Flow`] value rather than a
//! second stack: `break n` unwinds `n` iteration frames, `continue`
//! restarts the innermost one, and `Term` ends the program.
//!
//! Runtime errors abort the evaluation and carry the source line of
//! the op that raised them.

use crate::marshal;
use crate::SegmentReader;
use cohort_core::error::{Error, ErrorCode, Result, SourceLoc};
use cohort_core::time;
use cohort_core::value::Value;
use cohort_core::TextTable;
use cohort_index::CmpOp;
use cohort_query::{FilterDesc, InlineAgg, Op, Program, BREAK_ALL, BREAK_TOP};
use cohort_result::{ResultAccumulator, RowStamp};
use cohort_table::schema::ColumnId;
use cohort_table::EntityGrid;
use smallvec::SmallVec;

/// Block exit disposition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    /// Fell off the end (`Ret`)
    Normal,
    /// Unwinding `n` iteration frames
    Break(u32),
    /// Restart the innermost iteration frame
    Continue,
    /// `Term`: end of program
    Term,
}

/// One entity evaluation.
pub struct Interpreter<'a> {
    program: &'a Program,
    grid: &'a EntityGrid,
    texts: &'a TextTable,
    segments: &'a dyn SegmentReader,
    accumulator: Option<&'a mut ResultAccumulator>,
    pub(crate) stack: Vec<Value>,
    pub(crate) vars: Vec<Value>,
    pub(crate) cursor: usize,
    active_filter: u32,
    iter_depth: u32,
    pub(crate) debug_log: Vec<Value>,
}

impl<'a> Interpreter<'a> {
    /// Interpreter over one grid. `texts` is the owning partition's
    /// hash → string table.
    pub fn new(
        program: &'a Program,
        grid: &'a EntityGrid,
        texts: &'a TextTable,
        segments: &'a dyn SegmentReader,
    ) -> Self {
        Interpreter {
            program,
            grid,
            texts,
            segments,
            accumulator: None,
            stack: Vec::with_capacity(16),
            vars: vec![Value::Nil; program.user_vars.len()],
            cursor: 0,
            active_filter: 0,
            iter_depth: 0,
            debug_log: Vec::new(),
        }
    }

    /// Attach the partition's result accumulator (query mode).
    pub fn with_accumulator(mut self, accumulator: &'a mut ResultAccumulator) -> Self {
        self.accumulator = Some(accumulator);
        self
    }

    /// Evaluate the program; the return value is the final
    /// top-of-stack (the segment bit in segmentation mode).
    pub fn run(&mut self) -> Result<Value> {
        match self.exec_block(0)? {
            Flow::Normal | Flow::Term => Ok(self.stack.pop().unwrap_or(Value::Nil)),
            Flow::Break(_) => Err(Error::runtime(
                ErrorCode::TooDeepBreak,
                "break exceeds iteration depth",
            )),
            Flow::Continue => Err(Error::runtime(
                ErrorCode::TooDeepBreak,
                "continue outside iteration",
            )),
        }
    }

    /// `debug(...)` output, in call order.
    pub fn debug_log(&self) -> &[Value] {
        &self.debug_log
    }

    pub(crate) fn grid(&self) -> &EntityGrid {
        self.grid
    }

    pub(crate) fn segments(&self) -> &dyn SegmentReader {
        self.segments
    }

    // ------------------------------------------------------------------
    // block execution
    // ------------------------------------------------------------------

    fn exec_block(&mut self, block: u32) -> Result<Flow> {
        // reborrow the program at its own lifetime so op references do
        // not pin `self`
        let program = self.program;
        let mut pc = program.block_start(block);
        loop {
            let instr = &program.instrs[pc];
            let loc = &instr.loc;
            match &instr.op {
                Op::Ret => return Ok(Flow::Normal),
                Op::Term => return Ok(Flow::Term),
                Op::Break(n) => return Ok(Flow::Break(*n)),
                Op::Continue => return Ok(Flow::Continue),

                Op::PushLiteral(idx) => {
                    self.stack.push(program.literals[*idx as usize].clone());
                }
                Op::PushInt(i) => self.stack.push(Value::Int(*i)),
                Op::PushFloat(f) => self.stack.push(Value::Float(*f)),
                Op::PushTrue => self.stack.push(Value::Bool(true)),
                Op::PushFalse => self.stack.push(Value::Bool(false)),
                Op::PushNil => self.stack.push(Value::Nil),
                Op::PushColumn(col_ref) => {
                    let v = self.column_value(program.columns[*col_ref as usize]);
                    self.stack.push(v);
                }
                Op::PushColumnSet(col_ref) => {
                    let col = program.columns[*col_ref as usize];
                    let values = if self.grid.row_count() == 0 {
                        Vec::new()
                    } else {
                        self.grid.set_values(self.cursor, col)
                    };
                    self.stack.push(Value::Set(values.into_iter().collect()));
                }
                Op::PushUser(var) => {
                    self.stack.push(self.vars[*var as usize].clone());
                }
                Op::PushUserObj { var, depth } => {
                    let keys = self.pop_keys(*depth, loc)?;
                    let mut value = self.vars[*var as usize].clone();
                    for key in &keys {
                        value = value.get_index(key).map_err(|e| located(e, loc))?;
                    }
                    self.stack.push(value);
                }
                Op::PopUser(var) => {
                    let value = self.pop(loc)?;
                    self.vars[*var as usize] = value;
                }
                Op::PopUserObj { var, depth } => {
                    let value = self.pop(loc)?;
                    let keys = self.pop_keys(*depth, loc)?;
                    let var = *var as usize;
                    let mut container = std::mem::replace(&mut self.vars[var], Value::Nil);
                    assign_path(&mut container, &keys, value).map_err(|e| located(e, loc))?;
                    self.vars[var] = container;
                }

                Op::Eq => self.binary_cmp(|a, b| set_aware_eq(a, b), loc)?,
                Op::Neq => self.binary_cmp(|a, b| !set_aware_eq(a, b), loc)?,
                Op::Gt => self.binary_ord(CmpOp::Gt, loc)?,
                Op::Gte => self.binary_ord(CmpOp::Gte, loc)?,
                Op::Lt => self.binary_ord(CmpOp::Lt, loc)?,
                Op::Lte => self.binary_ord(CmpOp::Lte, loc)?,
                Op::And => {
                    let b = self.pop(loc)?;
                    let a = self.pop(loc)?;
                    self.stack.push(Value::Bool(a.is_truthy() && b.is_truthy()));
                }
                Op::Or => {
                    let b = self.pop(loc)?;
                    let a = self.pop(loc)?;
                    self.stack.push(Value::Bool(a.is_truthy() || b.is_truthy()));
                }
                Op::Add => self.binary_arith(Value::add, loc)?,
                Op::Sub => self.binary_arith(Value::sub, loc)?,
                Op::Mul => self.binary_arith(Value::mul, loc)?,
                Op::Div => self.binary_arith(Value::div, loc)?,

                Op::In => {
                    let rhs = self.pop(loc)?;
                    let lhs = self.pop(loc)?;
                    let hit = match &lhs {
                        Value::Set(members) => members.iter().any(|m| rhs.contains(m)),
                        item => rhs.contains(item),
                    };
                    self.stack.push(Value::Bool(hit));
                }
                Op::Contains => {
                    let rhs = self.pop(loc)?;
                    let lhs = self.pop(loc)?;
                    let hit = match &rhs {
                        Value::List(items) => items.iter().all(|i| lhs.contains(i)),
                        Value::Set(items) => items.iter().all(|i| lhs.contains(i)),
                        item => lhs.contains(item),
                    };
                    self.stack.push(Value::Bool(hit));
                }
                Op::AnyOf => {
                    let rhs = self.pop(loc)?;
                    let lhs = self.pop(loc)?;
                    let hit = match &rhs {
                        Value::List(items) => items.iter().any(|i| lhs.contains(i)),
                        Value::Set(items) => items.iter().any(|i| lhs.contains(i)),
                        item => lhs.contains(item),
                    };
                    self.stack.push(Value::Bool(hit));
                }

                Op::Call { marshal, argc } => {
                    marshal::dispatch(self, *marshal, *argc, loc)?;
                }
                Op::LogicFilter(idx) => self.active_filter = *idx,
                Op::ColumnFilter(idx) => {
                    let hit = self.column_filter(*idx, loc)?;
                    self.stack.push(Value::Bool(hit));
                }

                Op::IfCall {
                    body,
                    logic,
                    else_block,
                } => {
                    let cond = self.eval_lambda(*logic)?;
                    let flow = if cond.is_truthy() {
                        self.exec_block(*body)?
                    } else if let Some(else_block) = else_block {
                        self.exec_block(*else_block)?
                    } else {
                        Flow::Normal
                    };
                    if flow != Flow::Normal {
                        return Ok(flow);
                    }
                }
                Op::ForCall { body, var } => {
                    let iterable = self.pop(loc)?;
                    let items = iterable.iter_items().map_err(|e| located(e, loc))?;
                    let flow = self.run_for(*body, *var, items)?;
                    if flow != Flow::Normal {
                        return Ok(flow);
                    }
                }
                Op::EachCall { body, logic } => {
                    let filter = program.filters[self.active_filter as usize].clone();
                    self.active_filter = 0;
                    let flow = self.run_each(*body, *logic, &filter)?;
                    if flow != Flow::Normal {
                        return Ok(flow);
                    }
                }
                Op::AggCall { agg, eval, logic } => {
                    let value = self.inline_agg(*agg, *eval, *logic)?;
                    self.stack.push(value);
                }
                Op::TallyCall { argc } => {
                    let mut keys: SmallVec<[Value; 4]> = SmallVec::with_capacity(*argc as usize);
                    for _ in 0..*argc {
                        keys.push(self.pop(loc)?);
                    }
                    keys.reverse();
                    self.tally(&keys);
                }
            }
            pc += 1;
        }
    }

    /// Run a lambda block, returning its top-of-stack.
    pub(crate) fn eval_lambda(&mut self, block: u32) -> Result<Value> {
        let depth = self.stack.len();
        let flow = self.exec_block(block)?;
        debug_assert_eq!(flow, Flow::Normal);
        let value = if self.stack.len() > depth {
            self.stack.pop().unwrap_or(Value::Nil)
        } else {
            Value::Nil
        };
        self.stack.truncate(depth);
        Ok(value)
    }

    // ------------------------------------------------------------------
    // iteration
    // ------------------------------------------------------------------

    fn run_for(&mut self, body: u32, var: u32, items: Vec<Value>) -> Result<Flow> {
        self.iter_depth += 1;
        let result = (|| {
            for item in items {
                self.vars[var as usize] = item;
                match self.exec_block(body)? {
                    Flow::Normal | Flow::Continue => {}
                    other => return Ok(other),
                }
            }
            Ok(Flow::Normal)
        })();
        self.iter_depth -= 1;
        self.map_loop_flow(result?)
    }

    fn run_each(&mut self, body: u32, logic: u32, filter: &FilterDesc) -> Result<Flow> {
        let rows = self.grid.row_count() as i64;
        if rows == 0 {
            return Ok(Flow::Normal);
        }
        let reverse = filter.is_reverse;
        let (win_lo, win_hi) = self.filter_window(filter)?;
        let limit = match filter.limit_block {
            Some(block) => self.eval_lambda(block)?.as_int().unwrap_or(i64::MAX),
            None => i64::MAX,
        };

        let mut cur: i64 = if filter.is_continue {
            self.cursor as i64 + i64::from(filter.is_next)
        } else if filter.is_from {
            let block = filter.from_block.ok_or_else(|| {
                Error::internal(ErrorCode::Internal, "from filter without block")
            })?;
            self.eval_lambda(block)?.as_int().unwrap_or(0)
        } else if filter.is_next {
            self.cursor as i64 + 1
        } else if reverse {
            rows - 1
        } else {
            0
        };

        self.iter_depth += 1;
        let result = (|| {
            let mut matched = 0i64;
            while cur >= 0 && cur < rows {
                let stamp = self.grid.row(cur as usize).stamp;
                let in_window = win_lo.map(|lo| stamp >= lo).unwrap_or(true)
                    && win_hi.map(|hi| stamp <= hi).unwrap_or(true);
                if in_window {
                    self.cursor = cur as usize;
                    if self.eval_lambda(logic)?.is_truthy() {
                        matched += 1;
                        match self.exec_block(body)? {
                            Flow::Normal | Flow::Continue => {}
                            other => return Ok(other),
                        }
                        if matched >= limit {
                            break;
                        }
                    }
                }
                cur += if reverse { -1 } else { 1 };
            }
            Ok(Flow::Normal)
        })();
        self.iter_depth -= 1;
        self.map_loop_flow(result?)
    }

    /// Translate a flow escaping a loop frame into what the enclosing
    /// frame should see.
    fn map_loop_flow(&self, flow: Flow) -> Result<Flow> {
        Ok(match flow {
            Flow::Break(BREAK_ALL) => {
                if self.iter_depth == 0 {
                    Flow::Normal
                } else {
                    Flow::Break(BREAK_ALL)
                }
            }
            Flow::Break(BREAK_TOP) => {
                if self.iter_depth <= 1 {
                    Flow::Normal
                } else {
                    Flow::Break(BREAK_TOP)
                }
            }
            Flow::Break(1) => Flow::Normal,
            Flow::Break(n) => Flow::Break(n - 1),
            other => other,
        })
    }

    /// Stamp window from `.range` / `.within` / `.look_ahead` /
    /// `.look_back`.
    fn filter_window(&mut self, filter: &FilterDesc) -> Result<(Option<i64>, Option<i64>)> {
        if filter.is_range {
            let lo = self.stamp_bound(filter.range_start_block)?;
            let hi = self.stamp_bound(filter.range_end_block)?;
            return Ok((lo, hi));
        }
        if filter.is_within || filter.is_look_ahead || filter.is_look_back {
            let window = match filter.within_window_block {
                Some(block) => self.eval_lambda(block)?.as_int().unwrap_or(0),
                None => 0,
            };
            let origin = self
                .stamp_bound(filter.within_origin_block)?
                .unwrap_or(0);
            return Ok(if filter.is_look_ahead {
                (Some(origin), Some(origin + window))
            } else if filter.is_look_back {
                (Some(origin - window), Some(origin))
            } else {
                (Some(origin - window), Some(origin + window))
            });
        }
        Ok((None, None))
    }

    fn stamp_bound(&mut self, block: Option<u32>) -> Result<Option<i64>> {
        let block = match block {
            Some(block) => block,
            None => return Ok(None),
        };
        let value = self.eval_lambda(block)?;
        stamp_of(&value).map(Some)
    }

    // ------------------------------------------------------------------
    // column filters
    // ------------------------------------------------------------------

    fn column_filter(&mut self, idx: u32, loc: &SourceLoc) -> Result<bool> {
        let filter = self.program.filters[idx as usize].clone();
        let col = filter
            .column
            .map(|r| self.program.columns[r as usize])
            .ok_or_else(|| {
                located(
                    Error::internal(ErrorCode::Internal, "column filter without a column"),
                    loc,
                )
            })?;
        let cmp = filter.comparator.unwrap_or(CmpOp::Present);
        let rhs = match filter.eval_block {
            Some(block) => self.eval_lambda(block)?,
            None => Value::Nil,
        };
        let (win_lo, win_hi) = self.filter_window(&filter)?;

        if filter.is_row {
            if self.grid.row_count() == 0 {
                return Ok(false);
            }
            let stamp = self.grid.row(self.cursor).stamp;
            if win_lo.map(|lo| stamp < lo).unwrap_or(false)
                || win_hi.map(|hi| stamp > hi).unwrap_or(false)
            {
                return Ok(false);
            }
            return Ok(self.test_row(self.cursor, col, cmp, &rhs));
        }

        // .ever / .never scan the whole grid (or the stamp window)
        let mut hit = false;
        for row in 0..self.grid.row_count() {
            let stamp = self.grid.row(row).stamp;
            if win_lo.map(|lo| stamp < lo).unwrap_or(false)
                || win_hi.map(|hi| stamp > hi).unwrap_or(false)
            {
                continue;
            }
            if self.test_row(row, col, cmp, &rhs) {
                hit = true;
                break;
            }
        }
        Ok(if filter.is_never { !hit } else { hit })
    }

    /// Does `col` at `row` satisfy `cmp rhs`? Existential over the
    /// logical set for set-valued columns.
    fn test_row(&self, row: usize, col: ColumnId, cmp: CmpOp, rhs: &Value) -> bool {
        let set_valued = self
            .grid
            .map()
            .slot(col)
            .map(|slot| self.grid.map().slot_info(slot).2)
            .unwrap_or(false);
        if set_valued {
            let values = self.grid.set_values(row, col);
            match cmp {
                CmpOp::Neq => !values.iter().any(|v| v.loose_eq(rhs)),
                _ => values.iter().any(|v| cmp.test(v, rhs)),
            }
        } else {
            cmp.test(&self.grid.value(row, col), rhs)
        }
    }

    // ------------------------------------------------------------------
    // aggregation
    // ------------------------------------------------------------------

    fn inline_agg(&mut self, agg: InlineAgg, eval: u32, logic: u32) -> Result<Value> {
        let saved = self.cursor;
        let mut sum = Value::Nil;
        let mut count = 0i64;
        let mut best = Value::Nil;
        let mut first = Value::Nil;
        let mut distinct: std::collections::BTreeSet<Value> = std::collections::BTreeSet::new();

        for row in 0..self.grid.row_count() {
            self.cursor = row;
            if !self.eval_lambda(logic)?.is_truthy() {
                continue;
            }
            count += 1;
            match agg {
                InlineAgg::Count | InlineAgg::Test => continue,
                _ => {}
            }
            let value = self.eval_lambda(eval)?;
            if value.is_nil() {
                continue;
            }
            match agg {
                InlineAgg::Sum | InlineAgg::Avg => {
                    sum = match sum {
                        Value::Nil => value,
                        prev => prev.add(value)?,
                    };
                }
                InlineAgg::Min => {
                    if best.is_nil()
                        || matches!(value.loose_cmp(&best), Some(std::cmp::Ordering::Less))
                    {
                        best = value;
                    }
                }
                InlineAgg::Max => {
                    if best.is_nil()
                        || matches!(value.loose_cmp(&best), Some(std::cmp::Ordering::Greater))
                    {
                        best = value;
                    }
                }
                InlineAgg::DCount => {
                    distinct.insert(value);
                }
                InlineAgg::Row => {
                    if first.is_nil() {
                        first = value;
                    }
                }
                InlineAgg::Count | InlineAgg::Test => unreachable!(),
            }
        }
        self.cursor = saved;

        Ok(match agg {
            InlineAgg::Sum => sum,
            InlineAgg::Avg => {
                if count == 0 {
                    Value::Nil
                } else {
                    sum.div(Value::Float(count as f64))?
                }
            }
            InlineAgg::Min | InlineAgg::Max => best,
            InlineAgg::Count => Value::Int(count),
            InlineAgg::DCount => Value::Int(distinct.len() as i64),
            InlineAgg::Test => Value::Bool(count > 0),
            InlineAgg::Row => first,
        })
    }

    /// `<< g1, g2, …` — feed the accumulator at the current row.
    pub(crate) fn tally(&mut self, group: &[Value]) {
        let program = self.program;
        let selects = &program.selects;
        let (stamp, event, session) = if self.grid.row_count() == 0 {
            (0, 0, 0)
        } else {
            let row = self.grid.row(self.cursor);
            (row.stamp, row.event, self.grid.session(self.cursor))
        };
        let row = RowStamp {
            stamp,
            event,
            entity: self.grid.id_hash(),
            session,
        };

        let mut values = Vec::with_capacity(selects.len());
        let mut keys = Vec::with_capacity(selects.len());
        for select in selects {
            let value = match (select.modifier, select.column) {
                (cohort_query::AggModifier::Var, _) => program
                    .user_vars
                    .iter()
                    .position(|name| *name == select.name)
                    .map(|var| self.vars[var].clone())
                    .unwrap_or(Value::Nil),
                (_, Some(col)) => self.column_value(col),
                (_, None) => Value::Nil,
            };
            let key = match select.distinct_key {
                Some(col) => self.column_value(col),
                None => value.clone(),
            };
            values.push(value);
            keys.push(key);
        }

        let group: Vec<Value> = group.iter().map(|v| self.resolved(v)).collect();
        if let Some(acc) = self.accumulator.as_deref_mut() {
            for value in group.iter().chain(values.iter()) {
                if let Value::Text(t) = value {
                    if let Some(s) = t.as_str() {
                        acc.add_local_text(t.hash(), s);
                    }
                }
            }
            acc.tally(&group, &values, &keys, row);
        }
    }

    /// Resolve a hash-only text value through the partition table so
    /// result keys can be rendered.
    fn resolved(&self, value: &Value) -> Value {
        if let Value::Text(t) = value {
            if t.as_str().is_none() {
                if let Some(s) = self.texts.get(t.hash()) {
                    return Value::text(&s);
                }
            }
        }
        value.clone()
    }

    // ------------------------------------------------------------------
    // stack helpers
    // ------------------------------------------------------------------

    pub(crate) fn column_value(&self, col: ColumnId) -> Value {
        if self.grid.row_count() == 0 {
            return Value::Nil;
        }
        self.grid.value(self.cursor, col)
    }

    pub(crate) fn pop(&mut self, loc: &SourceLoc) -> Result<Value> {
        self.stack
            .pop()
            .ok_or_else(|| located(Error::internal(ErrorCode::Internal, "stack underflow"), loc))
    }

    fn pop_keys(&mut self, depth: u8, loc: &SourceLoc) -> Result<Vec<Value>> {
        let mut keys = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            keys.push(self.pop(loc)?);
        }
        keys.reverse();
        Ok(keys)
    }

    fn binary_cmp<F: Fn(&Value, &Value) -> bool>(&mut self, f: F, loc: &SourceLoc) -> Result<()> {
        let b = self.pop(loc)?;
        let a = self.pop(loc)?;
        self.stack.push(Value::Bool(f(&a, &b)));
        Ok(())
    }

    fn binary_ord(&mut self, cmp: CmpOp, loc: &SourceLoc) -> Result<()> {
        let b = self.pop(loc)?;
        let a = self.pop(loc)?;
        if !a.is_nil() && !b.is_nil() && a.loose_cmp(&b).is_none() {
            return Err(located(
                Error::runtime(
                    ErrorCode::TypeMismatch,
                    format!("cannot order {} and {}", a.type_name(), b.type_name()),
                ),
                loc,
            ));
        }
        self.stack.push(Value::Bool(cmp.test(&a, &b)));
        Ok(())
    }

    fn binary_arith<F: Fn(Value, Value) -> Result<Value>>(
        &mut self,
        f: F,
        loc: &SourceLoc,
    ) -> Result<()> {
        let b = self.pop(loc)?;
        let a = self.pop(loc)?;
        let out = f(a, b).map_err(|e| located(e, loc))?;
        self.stack.push(out);
        Ok(())
    }
}

/// Equality with existential semantics for logical sets.
fn set_aware_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Set(members), other) | (other, Value::Set(members))
            if !matches!(other, Value::Set(_)) =>
        {
            members.iter().any(|m| m.loose_eq(other))
        }
        _ => a.loose_eq(b),
    }
}

/// Convert a `.range` bound to a millisecond stamp: ISO strings parse,
/// numbers promote from seconds when needed.
fn stamp_of(value: &Value) -> Result<i64> {
    match value {
        Value::Text(t) => match t.as_str() {
            Some(s) => time::parse_iso_stamp(s),
            None => Err(Error::runtime(
                ErrorCode::TypeMismatch,
                "range bound text is unresolved",
            )),
        },
        other => other
            .as_int()
            .map(time::normalize_stamp)
            .ok_or_else(|| {
                Error::runtime(
                    ErrorCode::TypeMismatch,
                    format!("{} is not a stamp", other.type_name()),
                )
            }),
    }
}

fn assign_path(container: &mut Value, keys: &[Value], value: Value) -> Result<()> {
    match keys.split_first() {
        None => {
            *container = value;
            Ok(())
        }
        Some((head, rest)) => {
            if rest.is_empty() {
                return container.set_index(head.clone(), value);
            }
            let mut inner = container.get_index(head)?;
            assign_path(&mut inner, rest, value)?;
            container.set_index(head.clone(), inner)
        }
    }
}

pub(crate) fn located(err: Error, loc: &SourceLoc) -> Error {
    if err.loc.is_none() && !loc.excerpt.is_empty() {
        err.with_loc(loc.clone())
    } else {
        err
    }
}

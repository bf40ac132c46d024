//! Compiled program representation
//!
//! Middle ops map 1:1 onto these opcodes during lowering; block ids are
//! resolved to instruction offsets and filter descriptors live in a
//! side table indexed by `LogicFilter` / `ColumnFilter` operands.
//!
//! A [`Program`] is immutable once compiled and shared read-only across
//! partitions behind an `Arc`.

use cohort_core::error::SourceLoc;
use cohort_core::value::Value;
use cohort_index::{CmpOp, IndexExpr};
use cohort_table::schema::ColumnId;
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

/// Built-in functions callable from the query language.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Marshal {
    Log,
    Debug,
    Tally,
    Len,
    Round,
    Bucket,
    Fix,
    Trunc,
    UrlDecode,
    Str,
    Int,
    Float,
    Bool,
    MakeList,
    MakeDict,
    MakeSet,
    PushSubscript,
    IterGet,
    IterSet,
    IterMoveFirst,
    IterMoveLast,
    EventCount,
    SessionCount,
    Append,
    Pop,
    Clear,
    Keys,
    Add,
    Remove,
    Update,
    Find,
    Rfind,
    Split,
    Strip,
    Population,
    Intersection,
    Union,
    Difference,
    Complement,
}

/// Call signature of a marshal: arity bounds, whether it pushes a
/// value, and whether its first argument is a mutable receiver
/// (`list.append(x)` style).
#[derive(Debug, Clone, Copy)]
pub struct MarshalSig {
    /// The marshal
    pub marshal: Marshal,
    /// Minimum argument count (receiver included)
    pub min_argc: u8,
    /// Maximum argument count
    pub max_argc: u8,
    /// Leaves a value on the stack
    pub pushes_value: bool,
    /// First argument is a receiver mutated in place
    pub is_method: bool,
}

/// Marshal name table. Chain spellings (`x.append(…)`) resolve through
/// the same names.
pub static MARSHALS: Lazy<FxHashMap<&'static str, MarshalSig>> = Lazy::new(|| {
    use Marshal::*;
    let mut m = FxHashMap::default();
    let mut sig = |name, marshal, min, max, pushes, method| {
        m.insert(
            name,
            MarshalSig {
                marshal,
                min_argc: min,
                max_argc: max,
                pushes_value: pushes,
                is_method: method,
            },
        );
    };
    sig("log", Log, 0, 8, false, false);
    sig("debug", Debug, 1, 1, false, false);
    sig("tally", Tally, 1, 8, false, false);
    sig("len", Len, 1, 1, true, false);
    sig("round", Round, 1, 2, true, false);
    sig("bucket", Bucket, 2, 2, true, false);
    sig("fix", Fix, 2, 2, true, false);
    sig("trunc", Trunc, 1, 1, true, false);
    sig("url_decode", UrlDecode, 1, 1, true, false);
    sig("str", Str, 1, 1, true, false);
    sig("int", Int, 1, 1, true, false);
    sig("float", Float, 1, 1, true, false);
    sig("bool", Bool, 1, 1, true, false);
    sig("set", MakeSet, 0, 16, true, false);
    sig("iter_get", IterGet, 0, 0, true, false);
    sig("iter_set", IterSet, 1, 1, false, false);
    sig("iter_move_first", IterMoveFirst, 0, 0, false, false);
    sig("iter_move_last", IterMoveLast, 0, 0, false, false);
    sig("event_count", EventCount, 0, 0, true, false);
    sig("session_count", SessionCount, 0, 0, true, false);
    sig("append", Append, 2, 2, false, true);
    sig("pop", Pop, 1, 1, true, true);
    sig("clear", Clear, 1, 1, false, true);
    sig("keys", Keys, 1, 1, true, true);
    sig("add", Add, 2, 2, false, true);
    sig("remove", Remove, 2, 2, false, true);
    sig("update", Update, 2, 2, false, true);
    sig("find", Find, 2, 2, true, true);
    sig("rfind", Rfind, 2, 2, true, true);
    sig("split", Split, 2, 2, true, true);
    sig("strip", Strip, 1, 1, true, true);
    sig("population", Population, 1, 1, true, false);
    sig("intersection", Intersection, 2, 2, true, false);
    sig("union", Union, 2, 2, true, false);
    sig("difference", Difference, 2, 2, true, false);
    sig("complement", Complement, 1, 1, true, false);
    m
});

/// Segment-math marshals compute on cached segment bitmaps.
pub fn is_segment_math(marshal: Marshal) -> bool {
    matches!(
        marshal,
        Marshal::Population
            | Marshal::Intersection
            | Marshal::Union
            | Marshal::Difference
            | Marshal::Complement
    )
}

/// Inline aggregator kinds (`x = sum(price) where …`), desugared by the
/// compiler into a row scan producing one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlineAgg {
    /// Sum of the expression over matching rows
    Sum,
    /// Average over matching rows
    Avg,
    /// Minimum over matching rows
    Min,
    /// Maximum over matching rows
    Max,
    /// Matching row count
    Count,
    /// Distinct expression values over matching rows
    DCount,
    /// True when any row matches
    Test,
    /// Expression value at the first matching row
    Row,
}

/// Aggregation modifier of a `select` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggModifier {
    /// `+= 1`, deduped by `(key, stamp, event)`
    Count,
    /// `+= v`, deduped by `(key, stamp, event)`
    Sum,
    /// running minimum
    Min,
    /// running maximum
    Max,
    /// `(sum, count)` pair, finalized on emit
    Avg,
    /// last writer wins
    Value,
    /// set only by explicit user write
    Var,
    /// distinct entities per leaf
    DistCountPerson,
}

/// One `select` column declaration.
#[derive(Debug, Clone)]
pub struct SelectColumn {
    /// Aggregation modifier
    pub modifier: AggModifier,
    /// Source column (`None` for `var` slots)
    pub column: Option<ColumnId>,
    /// Output name (`as` alias, or the column name)
    pub name: String,
    /// Distinct-key override (`key <col>`)
    pub distinct_key: Option<ColumnId>,
}

/// Filter descriptor: the compiled form of a dot-chain attached to
/// `each_row` or a column reference. Descriptor 0 is the default
/// (unfiltered) descriptor.
#[derive(Debug, Clone, Default)]
pub struct FilterDesc {
    /// Column the filter tests (column filters only)
    pub column: Option<u32>,
    /// Comparator for `.ever` / `.never` / `.row`
    pub comparator: Option<CmpOp>,
    /// `.ever(cmp v)`
    pub is_ever: bool,
    /// `.never(cmp v)`
    pub is_never: bool,
    /// `.row(cmp v)` / `.is(cmp v)`
    pub is_row: bool,
    /// `.limit(n)`
    pub is_limit: bool,
    /// `.reverse()`
    pub is_reverse: bool,
    /// `.forward()`
    pub is_forward: bool,
    /// `.next()`
    pub is_next: bool,
    /// `.continue()`
    pub is_continue: bool,
    /// `.from(i)`
    pub is_from: bool,
    /// `.range(start, end)`
    pub is_range: bool,
    /// `.within(window, origin)`
    pub is_within: bool,
    /// `.look_ahead(window, origin)`
    pub is_look_ahead: bool,
    /// `.look_back(window, origin)`
    pub is_look_back: bool,
    /// Comparator right-hand side lambda
    pub eval_block: Option<u32>,
    /// `.limit` count lambda
    pub limit_block: Option<u32>,
    /// `.from` index lambda
    pub from_block: Option<u32>,
    /// `.range` start lambda
    pub range_start_block: Option<u32>,
    /// `.range` end lambda
    pub range_end_block: Option<u32>,
    /// `.within` / `.look_*` window lambda
    pub within_window_block: Option<u32>,
    /// `.within` / `.look_*` origin lambda
    pub within_origin_block: Option<u32>,
}

impl FilterDesc {
    /// True when no flag is set (the default descriptor).
    pub fn is_default(&self) -> bool {
        !(self.is_ever
            || self.is_never
            || self.is_row
            || self.is_limit
            || self.is_reverse
            || self.is_forward
            || self.is_next
            || self.is_continue
            || self.is_from
            || self.is_range
            || self.is_within
            || self.is_look_ahead
            || self.is_look_back)
    }
}

/// A bytecode instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    /// Push literal table entry
    PushLiteral(u32),
    /// Push integer constant
    PushInt(i64),
    /// Push float constant
    PushFloat(f64),
    /// Push `true`
    PushTrue,
    /// Push `false`
    PushFalse,
    /// Push nil
    PushNil,
    /// Push the current row's value of a referenced column
    PushColumn(u32),
    /// Push a set-valued column's logical set at the current row
    /// (emitted when the column is tested with `==`, `!=`, `in`,
    /// `contains`, or `any`)
    PushColumnSet(u32),
    /// Push a user variable's value
    PushUser(u32),
    /// Subscript read: pops `depth` keys, pushes the nested value
    PushUserObj {
        /// Variable id
        var: u32,
        /// Subscript depth
        depth: u8,
    },
    /// Pop into a user variable
    PopUser(u32),
    /// Subscript write: pops the value then `depth` keys
    PopUserObj {
        /// Variable id
        var: u32,
        /// Subscript depth
        depth: u8,
    },
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
    /// `&&`
    And,
    /// `||`
    Or,
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `in`
    In,
    /// `contains`
    Contains,
    /// `any` (collection intersection test)
    AnyOf,
    /// Call a built-in
    Call {
        /// Which marshal
        marshal: Marshal,
        /// Popped argument count
        argc: u8,
    },
    /// Make the descriptor the active iteration filter
    LogicFilter(u32),
    /// Evaluate a column filter (`.ever` / `.never` / `.row`), pushing
    /// a bool
    ColumnFilter(u32),
    /// Evaluate `logic`; run `body` when truthy, `else_block` otherwise
    IfCall {
        /// Body block id
        body: u32,
        /// Condition block id
        logic: u32,
        /// `else` / `elsif` chain block
        else_block: Option<u32>,
    },
    /// Iterate the popped collection, assigning `var` each pass
    ForCall {
        /// Body block id
        body: u32,
        /// Loop variable id
        var: u32,
    },
    /// Row iteration under the active filter
    EachCall {
        /// Body block id
        body: u32,
        /// Row predicate block id
        logic: u32,
    },
    /// Inline aggregator (`sum(expr) where cond`), pushing one value
    AggCall {
        /// Aggregation kind
        agg: InlineAgg,
        /// Value expression block
        eval: u32,
        /// Row predicate block
        logic: u32,
    },
    /// Tally: pops `argc` group keys, feeds the accumulator
    TallyCall {
        /// Group key count
        argc: u8,
    },
    /// Unwind `n` iteration frames (`u32::MAX` = all,
    /// `u32::MAX - 1` = all but outermost)
    Break(u32),
    /// Restart the innermost iteration frame
    Continue,
    /// End of block
    Ret,
    /// End of program
    Term,
}

/// `break("all")` operand.
pub const BREAK_ALL: u32 = u32::MAX;
/// `break("top")` operand.
pub const BREAK_TOP: u32 = u32::MAX - 1;

/// One instruction with its source attribution.
#[derive(Debug, Clone)]
pub struct Instr {
    /// The opcode
    pub op: Op,
    /// Source line for runtime errors
    pub loc: SourceLoc,
}

/// Section directive flags (`@segment name ttl=… refresh=…`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Section {
    /// Directive type (`segment`, …)
    pub kind: String,
    /// Section name
    pub name: String,
    /// Cache TTL in ms (≤ 0 = forever)
    pub ttl_ms: Option<i64>,
    /// Refresh window in ms
    pub refresh_ms: Option<i64>,
    /// Serve cached bits within the refresh window
    pub use_cached: bool,
    /// Recompute on ingest of referenced columns
    pub on_insert: bool,
    /// Z-order pin for the section's event
    pub z_index: Option<i32>,
    /// Free-form parameters surfaced to the caller
    pub params: std::collections::BTreeMap<String, String>,
}

/// A compiled query, shared read-only across partitions.
#[derive(Debug, Clone)]
pub struct Program {
    /// Flat instruction stream; blocks resolved to offsets
    pub instrs: Vec<Instr>,
    /// Block id → first instruction offset
    pub block_offsets: Vec<u32>,
    /// Literal pool
    pub literals: Vec<Value>,
    /// User variable names (index = variable id)
    pub user_vars: Vec<String>,
    /// Referenced columns (index = column ref id)
    pub columns: Vec<ColumnId>,
    /// Filter descriptor side table (0 = default)
    pub filters: Vec<FilterDesc>,
    /// `select` declarations
    pub selects: Vec<SelectColumn>,
    /// Extracted index expression
    pub index: IndexExpr,
    /// Section directive, when the script carried one
    pub section: Option<Section>,
    /// Program consists only of segment-math calls over literals
    pub segment_math_only: bool,
}

impl Program {
    /// First instruction offset of a block.
    pub fn block_start(&self, block: u32) -> usize {
        self.block_offsets[block as usize] as usize
    }
}

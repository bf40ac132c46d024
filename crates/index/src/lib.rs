//! Candidate pruning: bitmaps, per-column inverted indexes, and the
//! index expression
//!
//! Before the VM touches a single grid, each partition evaluates the
//! query's *index expression* — a pure boolean formula over `column OP
//! value` terms extracted at compile time — against its per-column
//! inverted indexes. The result is a bitmap over entity linear ids that
//! is always a **superset** of the true hits; when the compiler marked
//! the expression *countable*, it is exact and population queries skip
//! evaluation entirely.

#![warn(clippy::all)]

pub mod bits;
pub mod expr;
pub mod inverted;

pub use bits::IndexBits;
pub use expr::{CmpOp, IndexExpr, IndexOp, IndexTerm};
pub use inverted::BitIndex;

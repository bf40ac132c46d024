//! Result accumulation and merge
//!
//! One [`accumulator::ResultAccumulator`] lives per partition per
//! query: a hierarchical group tree of fixed-width accumulator rows,
//! per-leaf dedup sets, and a partition-local text table. Partition
//! results are combined by [`merge::merge`], which unifies text tables
//! (failing on 64-bit hash collisions), merges rows slot-by-slot with
//! per-modifier combine rules, and emits the deterministic JSON tree
//! the caller sees.

#![warn(clippy::all)]

pub mod accumulator;
pub mod merge;

pub use accumulator::{Cell, ResultAccumulator, ResultRow, RowStamp};
pub use merge::{merge, MergeOptions, ResultSet};

//! Core types for the Cohort analytics engine
//!
//! This crate defines the foundational types shared by every layer:
//! - `Value`: the dynamic tagged value the query VM operates on
//! - `Error`: the unified error model (class + code + message + location)
//! - time shorthand expansion and stamp normalization
//! - `RuntimeConfig`: per-process tunables (session gap, slice budget)
//!
//! Nothing in this crate knows about tables, grids, or the query language;
//! higher crates depend on it, never the reverse.

#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod text_table;
pub mod time;
pub mod value;

pub use config::RuntimeConfig;
pub use error::{Error, ErrorClass, ErrorCode, Result, SourceLoc};
pub use text_table::TextTable;
pub use value::{Text, Value};

/// Hash a string the way every layer of the engine does: xxh3, 64-bit,
/// stored as `i64` so it can live in a column cell.
pub fn hash_text(s: &str) -> i64 {
    xxhash_rust::xxh3::xxh3_64(s.as_bytes()) as i64
}

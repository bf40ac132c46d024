//! Segment engine
//!
//! A segment is a named boolean bitmap over a partition's entity
//! linear ids, produced by a query program: at the end of each entity's
//! evaluation the top-of-stack boolean becomes that entity's bit.
//!
//! This crate owns the cache and lifecycle around those bitmaps:
//!
//! - TTL (`≤ 0` = forever) and refresh windows; `use_cached` serves the
//!   cached bits while they are fresh
//! - shortcuts: a *countable* program copies the index bitmap without
//!   executing, and a segment-math-only program computes directly on
//!   cached bitmaps
//! - dirty marking when ingest touches a referenced column
//! - enter/exit delta emission into a per-partition message queue
//!   drained by the collaborator
//!
//! The per-entity evaluation loop itself lives in the engine crate;
//! the store here is handed the finished bits.

#![warn(clippy::all)]

pub mod math;
pub mod store;

pub use math::evaluate_segment_math;
pub use store::{Segment, SegmentChange, SegmentDelta, SegmentStore};

//! Table layer: column catalog, z-order, and the per-entity event grid
//!
//! This crate owns the storage-facing data model:
//! - [`schema`]: column name ↔ id catalog with type and set-valued flags
//! - [`zorder`]: per-table `event → small int` tie-break ordering
//! - [`grid`]: one entity's rows in column-oriented form, sorted by
//!   `(stamp, z_order, event)`, with set expansion and synthesized
//!   sessions
//! - [`ingest`]: JSON event intake producing canonical grid rows
//!
//! Grids are built on demand from an entity's stored bytes, evaluated
//! against, and discarded; only the owning partition's ingest path
//! mutates them.

#![warn(clippy::all)]

pub mod grid;
pub mod ingest;
pub mod schema;
pub mod zorder;

pub use grid::{EntityGrid, GridMap, Row, NIL_CELL};
pub use ingest::insert_event;
pub use schema::{Column, ColumnId, ColumnType, Schema, COL_EVENT, COL_ID, COL_SESSION, COL_STAMP};
pub use zorder::ZOrderMap;

//! # cohortdb
//!
//! Embedded analytics engine for per-entity event streams: events
//! tagged to a stable entity id are stored column-oriented and
//! partitioned, and queried with a small analytical language built
//! around per-entity row iteration (`each_row`), filter chains
//! (`.ever`, `.never`, `.range`, `.within`, …), grouped tallies, and
//! named segments.
//!
//! ```no_run
//! use cohortdb::{Database, RuntimeConfig, ColumnType};
//!
//! let db = Database::new(RuntimeConfig::default());
//! let table = db.create_table("shop").unwrap();
//! table.add_column("fruit", ColumnType::Text, false).unwrap();
//! table.add_column("price", ColumnType::Double, false).unwrap();
//!
//! table.insert_json(r#"[
//!   {"id": "u1", "stamp": 1458820830, "event": "purchase",
//!    "_": {"fruit": "orange", "price": 5.55}}
//! ]"#).unwrap();
//!
//! let result = table.query(r#"
//!     select
//!       count id
//!       sum price
//!     end
//!     each_row where event == "purchase"
//!       << fruit
//!     end
//! "#).unwrap();
//! println!("{}", result);
//! ```
//!
//! The crate is the embeddable core: the HTTP façade, cluster routing,
//! and on-disk persistence are host concerns layered on top of
//! [`Database`], [`Table`], and the segment APIs.

#![warn(clippy::all)]

pub use cohort_core::{Error, ErrorClass, ErrorCode, Result, RuntimeConfig, Value};
pub use cohort_engine::{Database, QueryControl, QueryOptions, SegmentOutcome, Table};
pub use cohort_query::{compile, Program, Section};
pub use cohort_segment::{SegmentChange, SegmentDelta};
pub use cohort_table::schema::ColumnType;

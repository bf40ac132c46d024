//! Partition: the unit of entity ownership
//!
//! A partition owns a disjoint set of entities — their stored blobs,
//! the dense linear-id assignment, the hash → string table covering
//! every text value in its rows, the per-column bit index, and the
//! segment cache. Nothing here is shared across partitions; the merge
//! step is the only place partition outputs meet.

use cohort_core::error::{Error, ErrorCode, Result};
use cohort_core::value::Value;
use cohort_core::TextTable;
use cohort_index::BitIndex;
use cohort_query::Program;
use cohort_result::ResultAccumulator;
use cohort_segment::SegmentStore;
use cohort_table::grid::{EntityGrid, GridMap};
use cohort_table::ingest::{insert_event, payload_columns};
use cohort_table::schema::{ColumnType, Schema, COL_EVENT};
use cohort_table::ZOrderMap;
use cohort_vm::Interpreter;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// One entity's stored state.
#[derive(Debug)]
struct EntityRecord {
    id: String,
    blob: Vec<u8>,
}

/// One partition of a table.
#[derive(Debug)]
pub struct Partition {
    /// Partition index within its table
    pub id: usize,
    session_gap_ms: i64,
    linear_ids: FxHashMap<String, usize>,
    entities: Vec<EntityRecord>,
    texts: TextTable,
    bit_index: BitIndex,
    segments: SegmentStore,
}

impl Partition {
    /// Empty partition.
    pub fn new(id: usize, session_gap_ms: i64) -> Self {
        Partition {
            id,
            session_gap_ms,
            linear_ids: FxHashMap::default(),
            entities: Vec::new(),
            texts: TextTable::new(),
            bit_index: BitIndex::new(),
            segments: SegmentStore::new(),
        }
    }

    /// Number of entities owned.
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Entity id for a linear id.
    pub fn entity_id(&self, linear: usize) -> Option<&str> {
        self.entities.get(linear).map(|e| e.id.as_str())
    }

    /// The partition's segment cache.
    pub fn segments(&self) -> &SegmentStore {
        &self.segments
    }

    /// Mutable segment cache (store results, drain messages).
    pub fn segments_mut(&mut self) -> &mut SegmentStore {
        &mut self.segments
    }

    /// The partition's bit index.
    pub fn bit_index(&self) -> &BitIndex {
        &self.bit_index
    }

    /// Ingest one event for the entity it names. The caller has
    /// already routed the event here and holds the table's z-order
    /// map.
    pub fn ingest(
        &mut self,
        schema: &Schema,
        zorder: &mut ZOrderMap,
        event: &serde_json::Value,
    ) -> Result<()> {
        let id = event
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::schema(ErrorCode::UnknownColumn, "event is missing `id`")
            })?
            .to_string();

        let linear = match self.linear_ids.get(&id) {
            Some(linear) => *linear,
            None => {
                let linear = self.entities.len();
                self.linear_ids.insert(id.clone(), linear);
                self.entities.push(EntityRecord {
                    id: id.clone(),
                    blob: Vec::new(),
                });
                self.bit_index.note_entity(linear);
                linear
            }
        };

        // rebuild the grid from its stored image, insert, re-encode
        let map = Arc::new(GridMap::map_table(schema, None));
        let mut grid = EntityGrid::new(map, &id, self.session_gap_ms);
        if !self.entities[linear].blob.is_empty() {
            grid.mount(self.entities[linear].blob.clone());
            grid.prepare(schema)?;
        }
        insert_event(&mut grid, schema, zorder, &mut self.texts, event)?;
        self.entities[linear].blob = grid.encode();

        // note the grid's cells; bitmap sets are idempotent so the
        // whole grid is re-noted. `event` lives in the row key, not a
        // cell, and is indexed alongside.
        for row_i in 0..grid.row_count() {
            let row = grid.row(row_i);
            self.bit_index
                .note(linear, COL_EVENT, ColumnType::Text, row.event);
            for (slot, cell) in row.cells.iter().enumerate() {
                let (col, ctype, _) = grid.map().slot_info(slot);
                self.bit_index.note(linear, col, ctype, *cell);
            }
        }

        let touched = payload_columns(schema, event);
        self.segments.mark_dirty_for_columns(&touched);
        self.segments.set_entity_count(self.entities.len());
        Ok(())
    }

    /// Candidate entities for a compiled program.
    pub fn candidates(&self, program: &Program) -> Vec<usize> {
        program.index.evaluate(&self.bit_index).ones().collect()
    }

    /// Materialize one entity's grid under the program's projection.
    fn build_grid(&self, linear: usize, schema: &Schema, program: &Program) -> Result<EntityGrid> {
        let record = self.entities.get(linear).ok_or_else(|| {
            Error::resource(
                ErrorCode::PartitionMigrated,
                format!("linear id {} not owned here", linear),
            )
        })?;
        let map = Arc::new(GridMap::map_table(schema, Some(&program.columns)));
        let mut grid = EntityGrid::new(map, &record.id, self.session_gap_ms);
        if !record.blob.is_empty() {
            grid.mount(record.blob.clone());
            grid.prepare(schema)?;
        }
        Ok(grid)
    }

    /// Evaluate one entity in query mode, feeding the accumulator.
    pub fn evaluate_entity(
        &self,
        linear: usize,
        schema: &Schema,
        program: &Program,
        accumulator: &mut ResultAccumulator,
    ) -> Result<()> {
        let grid = self.build_grid(linear, schema, program)?;
        let mut interp =
            Interpreter::new(program, &grid, &self.texts, &self.segments).with_accumulator(accumulator);
        interp.run()?;
        Ok(())
    }

    /// Evaluate one entity in segmentation mode: the final top-of-stack
    /// boolean is the entity's bit.
    pub fn evaluate_entity_bit(
        &self,
        linear: usize,
        schema: &Schema,
        program: &Program,
    ) -> Result<bool> {
        let grid = self.build_grid(linear, schema, program)?;
        let mut interp = Interpreter::new(program, &grid, &self.texts, &self.segments);
        Ok(interp.run()?.is_truthy())
    }

    /// Run the debug-oriented single-entity evaluation used by tests:
    /// returns the interpreter's `debug(...)` log.
    pub fn debug_entity(
        &self,
        entity_id: &str,
        schema: &Schema,
        program: &Program,
    ) -> Result<Vec<Value>> {
        let linear = *self.linear_ids.get(entity_id).ok_or_else(|| {
            Error::resource(
                ErrorCode::PartitionMigrated,
                format!("entity `{}` not owned here", entity_id),
            )
        })?;
        let grid = self.build_grid(linear, schema, program)?;
        let mut interp = Interpreter::new(program, &grid, &self.texts, &self.segments);
        interp.run()?;
        Ok(interp.debug_log().to_vec())
    }
}

//! Per-entity event grid
//!
//! One grid holds one entity's rows in column-oriented form: a fixed-
//! width array of 64-bit cells per row, plus the row key `(stamp,
//! z_order, event)` the grid is sorted by. Cells encode by column type
//! (ints raw, doubles by bit pattern, bools 0/1, text by hash); absent
//! cells hold [`NIL_CELL`].
//!
//! Set-valued columns are stored expanded: one logical event with a
//! set of k values occupies k physical rows differing only in that
//! column. [`EntityGrid::set_values`] collapses them back when the VM
//! asks for the logical set.
//!
//! The `session` column is synthesized, never stored: two successive
//! rows share a session iff their stamps are within the configured gap;
//! session numbers are monotonic per entity starting at 1.
//!
//! A grid is `mount`ed on an entity's stored bytes and materialized by
//! `prepare`, which is idempotent. Evaluation reads only through the
//! projection computed by [`GridMap::map_table`].

use crate::schema::{
    ColumnId, ColumnType, Schema, COL_EVENT, COL_ID, COL_SESSION, COL_STAMP, FIRST_USER_COL,
};
use cohort_core::error::{Error, ErrorCode, Result};
use cohort_core::value::Value;
use cohort_core::TextTable;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Cell sentinel for an absent value.
pub const NIL_CELL: i64 = i64::MIN;

const BLOB_MAGIC: u32 = 0x4347_5244; // "CGRD"
const BLOB_VERSION: u8 = 1;

/// Projection of the schema onto the columns a query touches.
///
/// Built once per compiled query and shared across entity evaluations;
/// the grid stores cells only for projected columns.
#[derive(Debug, Clone)]
pub struct GridMap {
    slots: Vec<(ColumnId, ColumnType, bool)>,
    slot_of: FxHashMap<ColumnId, usize>,
}

impl GridMap {
    /// Project `columns_of_interest` (user columns only; built-ins are
    /// always available). `None` projects every live user column.
    pub fn map_table(schema: &Schema, columns_of_interest: Option<&[ColumnId]>) -> GridMap {
        let mut ids: Vec<ColumnId> = match columns_of_interest {
            Some(cols) => cols
                .iter()
                .copied()
                .filter(|id| *id >= FIRST_USER_COL)
                .collect(),
            None => schema
                .live_columns()
                .filter(|c| c.id >= FIRST_USER_COL)
                .map(|c| c.id)
                .collect(),
        };
        ids.sort_unstable();
        ids.dedup();

        let mut slots = Vec::with_capacity(ids.len());
        let mut slot_of = FxHashMap::default();
        for id in ids {
            if let Some(col) = schema.get_by_id(id) {
                if !col.deleted {
                    slot_of.insert(id, slots.len());
                    slots.push((id, col.ctype, col.set_valued));
                }
            }
        }
        GridMap { slots, slot_of }
    }

    /// Number of projected cells per row.
    pub fn width(&self) -> usize {
        self.slots.len()
    }

    /// Slot index for a column id.
    pub fn slot(&self, col: ColumnId) -> Option<usize> {
        self.slot_of.get(&col).copied()
    }

    /// `(id, type, set_valued)` for a slot.
    pub fn slot_info(&self, slot: usize) -> (ColumnId, ColumnType, bool) {
        self.slots[slot]
    }

    /// Column ids in slot order.
    pub fn column_ids(&self) -> impl Iterator<Item = ColumnId> + '_ {
        self.slots.iter().map(|(id, _, _)| *id)
    }
}

/// One physical row: the sort key plus the packed cells.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Stamp in ms
    pub stamp: i64,
    /// Z-order tie-break
    pub z: i32,
    /// Event name hash
    pub event: i64,
    /// One cell per projected slot
    pub cells: Vec<i64>,
}

impl Row {
    fn key(&self) -> (i64, i32, i64) {
        (self.stamp, self.z, self.event)
    }
}

/// One entity's rows, sorted by `(stamp, z_order, event)`.
#[derive(Debug, Clone)]
pub struct EntityGrid {
    map: Arc<GridMap>,
    entity_id: String,
    id_hash: i64,
    session_gap_ms: i64,
    rows: Vec<Row>,
    sessions: Vec<i64>,
    blob: Option<Vec<u8>>,
    prepared: bool,
}

impl EntityGrid {
    /// Empty grid for `entity_id` under the given projection.
    pub fn new(map: Arc<GridMap>, entity_id: &str, session_gap_ms: i64) -> Self {
        EntityGrid {
            map,
            entity_id: entity_id.to_string(),
            id_hash: cohort_core::hash_text(entity_id),
            session_gap_ms,
            rows: Vec::new(),
            sessions: Vec::new(),
            blob: None,
            prepared: true,
        }
    }

    /// Attach to an entity's stored bytes without decoding them.
    pub fn mount(&mut self, blob: Vec<u8>) {
        self.blob = Some(blob);
        self.prepared = false;
    }

    /// Decode the mounted bytes and materialize rows. Idempotent.
    pub fn prepare(&mut self, schema: &Schema) -> Result<()> {
        if self.prepared {
            return Ok(());
        }
        let blob = self.blob.as_ref().ok_or_else(|| {
            Error::internal(ErrorCode::CorruptBlob, "prepare without a mounted blob")
        })?;
        let (rows, col_ids) = decode_blob(blob)?;

        // every live column id the blob references must exist
        for id in &col_ids {
            if schema.get_by_id(*id).is_none() {
                return Err(Error::internal(
                    ErrorCode::SchemaMismatch,
                    format!("blob references unknown column id {}", id),
                ));
            }
        }

        // re-project blob slots onto the query's projection
        let mut projected = Vec::with_capacity(rows.len());
        for row in rows {
            let mut cells = vec![NIL_CELL; self.map.width()];
            for (blob_slot, id) in col_ids.iter().enumerate() {
                if let Some(slot) = self.map.slot(*id) {
                    cells[slot] = row.cells[blob_slot];
                }
            }
            projected.push(Row { cells, ..row });
        }
        self.rows = projected;
        self.prepared = true;
        self.recompute_sessions();
        Ok(())
    }

    /// Serialize the grid to its stored byte form.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.rows.len() * (20 + self.map.width() * 8));
        out.extend_from_slice(&BLOB_MAGIC.to_le_bytes());
        out.push(BLOB_VERSION);
        let ids: Vec<ColumnId> = self.map.column_ids().collect();
        out.extend_from_slice(&(ids.len() as u16).to_le_bytes());
        for id in &ids {
            out.extend_from_slice(&id.to_le_bytes());
        }
        out.extend_from_slice(&(self.rows.len() as u32).to_le_bytes());
        for row in &self.rows {
            out.extend_from_slice(&row.stamp.to_le_bytes());
            out.extend_from_slice(&row.z.to_le_bytes());
            out.extend_from_slice(&row.event.to_le_bytes());
            for cell in &row.cells {
                out.extend_from_slice(&cell.to_le_bytes());
            }
        }
        out
    }

    /// Insert a physical row, keeping the grid sorted. Equal keys keep
    /// insertion order, which keeps set-expanded rows adjacent.
    pub fn insert_row(&mut self, row: Row) {
        debug_assert_eq!(row.cells.len(), self.map.width());
        let at = self.rows.partition_point(|r| r.key() <= row.key());
        self.rows.insert(at, row);
        self.recompute_sessions();
    }

    /// Number of physical rows.
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Borrow a row.
    pub fn row(&self, i: usize) -> &Row {
        &self.rows[i]
    }

    /// The entity id string.
    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The entity id hash.
    pub fn id_hash(&self) -> i64 {
        self.id_hash
    }

    /// The projection this grid was materialized under.
    pub fn map(&self) -> &GridMap {
        &self.map
    }

    /// Value of `col` at `row_i`, decoding by column type. Built-ins
    /// resolve from the row key, the synthesized session, or the entity
    /// id. Absent cells are nil.
    pub fn value(&self, row_i: usize, col: ColumnId) -> Value {
        match col {
            COL_ID => Value::text(&self.entity_id),
            COL_STAMP => Value::Int(self.rows[row_i].stamp),
            COL_EVENT => Value::text_hash(self.rows[row_i].event),
            COL_SESSION => Value::Int(self.sessions[row_i]),
            _ => match self.map.slot(col) {
                Some(slot) => {
                    let (_, ctype, _) = self.map.slot_info(slot);
                    decode_cell(self.rows[row_i].cells[slot], ctype)
                }
                None => Value::Nil,
            },
        }
    }

    /// The logical set for a set-valued column at `row_i`: the distinct
    /// cell values across the adjacent expanded rows sharing this row's
    /// key.
    pub fn set_values(&self, row_i: usize, col: ColumnId) -> Vec<Value> {
        let slot = match self.map.slot(col) {
            Some(s) => s,
            None => return Vec::new(),
        };
        let (_, ctype, set_valued) = self.map.slot_info(slot);
        if !set_valued {
            let v = decode_cell(self.rows[row_i].cells[slot], ctype);
            return if v.is_nil() { Vec::new() } else { vec![v] };
        }
        let key = self.rows[row_i].key();
        let mut start = row_i;
        while start > 0 && self.rows[start - 1].key() == key {
            start -= 1;
        }
        let mut end = row_i;
        while end + 1 < self.rows.len() && self.rows[end + 1].key() == key {
            end += 1;
        }
        let mut out = Vec::new();
        for row in &self.rows[start..=end] {
            let cell = row.cells[slot];
            if cell != NIL_CELL && !out.iter().any(|v| *v == decode_cell(cell, ctype)) {
                out.push(decode_cell(cell, ctype));
            }
        }
        out
    }

    /// Session number of a row (monotonic from 1).
    pub fn session(&self, row_i: usize) -> i64 {
        self.sessions[row_i]
    }

    /// Total sessions for this entity.
    pub fn session_count(&self) -> i64 {
        self.sessions.last().copied().unwrap_or(0)
    }

    /// The configured session gap.
    pub fn session_gap_ms(&self) -> i64 {
        self.session_gap_ms
    }

    fn recompute_sessions(&mut self) {
        self.sessions.clear();
        self.sessions.reserve(self.rows.len());
        let mut session = 0i64;
        let mut last_stamp = i64::MIN;
        for row in &self.rows {
            if session == 0 || row.stamp - last_stamp > self.session_gap_ms {
                session += 1;
            }
            last_stamp = row.stamp;
            self.sessions.push(session);
        }
    }

    /// Debug emission of the materialized rows.
    pub fn to_json(&self, texts: &TextTable) -> serde_json::Value {
        let resolve = |v: &Value| -> serde_json::Value {
            if let Value::Text(t) = v {
                if t.as_str().is_none() {
                    if let Some(s) = texts.get(t.hash()) {
                        return serde_json::Value::String(s.to_string());
                    }
                }
            }
            v.to_json()
        };
        let rows: Vec<serde_json::Value> = (0..self.row_count())
            .map(|i| {
                let mut obj = serde_json::Map::new();
                obj.insert("stamp".into(), self.rows[i].stamp.into());
                obj.insert("event".into(), resolve(&self.value(i, COL_EVENT)));
                obj.insert("session".into(), self.sessions[i].into());
                for id in self.map.column_ids() {
                    let name = format!("c{}", id);
                    obj.insert(name, resolve(&self.value(i, id)));
                }
                serde_json::Value::Object(obj)
            })
            .collect();
        serde_json::json!({ "id": self.entity_id, "rows": rows })
    }
}

/// Encode a value into a 64-bit cell for a column of `ctype`. Text
/// values must already be hashed (the ingest path interns the string).
pub fn encode_cell(value: &Value, ctype: ColumnType) -> i64 {
    match (value, ctype) {
        (Value::Nil, _) => NIL_CELL,
        (v, ColumnType::Int) => v.as_int().unwrap_or(NIL_CELL),
        (v, ColumnType::Double) => {
            let f = v.as_float().unwrap_or(f64::NAN);
            // -0.0 shares its bit pattern with the nil sentinel
            let f = if f == 0.0 { 0.0 } else { f };
            f.to_bits() as i64
        }
        (v, ColumnType::Bool) => {
            if v.is_truthy() {
                1
            } else {
                0
            }
        }
        (Value::Text(t), ColumnType::Text) => t.hash(),
        (v, ColumnType::Text) => cohort_core::hash_text(&v.to_string()),
    }
}

/// Decode a 64-bit cell for a column of `ctype`.
pub fn decode_cell(cell: i64, ctype: ColumnType) -> Value {
    if cell == NIL_CELL {
        return Value::Nil;
    }
    match ctype {
        ColumnType::Int => Value::Int(cell),
        ColumnType::Double => Value::Float(f64::from_bits(cell as u64)),
        ColumnType::Bool => Value::Bool(cell != 0),
        ColumnType::Text => Value::text_hash(cell),
    }
}

fn decode_blob(blob: &[u8]) -> Result<(Vec<Row>, Vec<ColumnId>)> {
    let mut cursor = Reader { blob, at: 0 };
    let magic = cursor.u32()?;
    if magic != BLOB_MAGIC {
        return Err(corrupt("bad magic"));
    }
    let version = cursor.u8()?;
    if version != BLOB_VERSION {
        return Err(corrupt("unsupported version"));
    }
    let col_count = cursor.u16()? as usize;
    let mut col_ids = Vec::with_capacity(col_count);
    for _ in 0..col_count {
        col_ids.push(cursor.u16()?);
    }
    let row_count = cursor.u32()? as usize;
    let mut rows = Vec::with_capacity(row_count);
    for _ in 0..row_count {
        let stamp = cursor.i64()?;
        let z = cursor.i32()?;
        let event = cursor.i64()?;
        let mut cells = Vec::with_capacity(col_count);
        for _ in 0..col_count {
            cells.push(cursor.i64()?);
        }
        rows.push(Row {
            stamp,
            z,
            event,
            cells,
        });
    }
    if cursor.at != blob.len() {
        return Err(corrupt("trailing bytes"));
    }
    Ok((rows, col_ids))
}

fn corrupt(why: &str) -> Error {
    Error::internal(ErrorCode::CorruptBlob, format!("corrupt entity blob: {}", why))
}

struct Reader<'a> {
    blob: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.at + n > self.blob.len() {
            return Err(corrupt("truncated"));
        }
        let slice = &self.blob[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }
    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }
    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }
    fn i64(&mut self) -> Result<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Schema;

    fn fruit_schema() -> Schema {
        let mut schema = Schema::new();
        schema.add("fruit", ColumnType::Text, false).unwrap();
        schema.add("price", ColumnType::Double, false).unwrap();
        schema
    }

    fn grid_for(schema: &Schema) -> EntityGrid {
        let map = Arc::new(GridMap::map_table(schema, None));
        EntityGrid::new(map, "user1@test.com", 30 * 60 * 1000)
    }

    fn push_row(grid: &mut EntityGrid, stamp: i64, z: i32, event: i64, cells: Vec<i64>) {
        grid.insert_row(Row {
            stamp,
            z,
            event,
            cells,
        });
    }

    #[test]
    fn test_rows_sorted_by_key() {
        let schema = fruit_schema();
        let mut grid = grid_for(&schema);
        let w = grid.map().width();
        push_row(&mut grid, 300, 0, 1, vec![NIL_CELL; w]);
        push_row(&mut grid, 100, 0, 2, vec![NIL_CELL; w]);
        push_row(&mut grid, 100, 0, 1, vec![NIL_CELL; w]);
        push_row(&mut grid, 200, 1, 1, vec![NIL_CELL; w]);
        push_row(&mut grid, 200, 0, 9, vec![NIL_CELL; w]);

        let keys: Vec<(i64, i32, i64)> = (0..grid.row_count())
            .map(|i| {
                let r = grid.row(i);
                (r.stamp, r.z, r.event)
            })
            .collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn test_encode_mount_prepare_round_trip() {
        let schema = fruit_schema();
        let mut grid = grid_for(&schema);
        let fruit = cohort_core::hash_text("orange");
        push_row(&mut grid, 1000, 0, 7, vec![fruit, (5.55f64).to_bits() as i64]);
        push_row(&mut grid, 2000, 0, 7, vec![fruit, (9.95f64).to_bits() as i64]);

        let blob = grid.encode();
        let mut mounted = grid_for(&schema);
        mounted.mount(blob);
        mounted.prepare(&schema).unwrap();
        mounted.prepare(&schema).unwrap(); // idempotent

        assert_eq!(mounted.row_count(), 2);
        let fruit_col = schema.get_by_name("fruit").unwrap().id;
        let price_col = schema.get_by_name("price").unwrap().id;
        assert!(mounted.value(0, fruit_col).loose_eq(&Value::text("orange")));
        assert!(mounted.value(0, price_col).loose_eq(&Value::Float(5.55)));
    }

    #[test]
    fn test_corrupt_blob_rejected() {
        let schema = fruit_schema();
        let mut grid = grid_for(&schema);
        grid.mount(vec![1, 2, 3]);
        let err = grid.prepare(&schema).unwrap_err();
        assert_eq!(err.code, ErrorCode::CorruptBlob);
    }

    #[test]
    fn test_blob_schema_mismatch() {
        let schema = fruit_schema();
        let grid = {
            let mut g = grid_for(&schema);
            let w = g.map().width();
            push_row(&mut g, 1000, 0, 7, vec![NIL_CELL; w]);
            g
        };
        let blob = grid.encode();

        // a schema that never knew those columns
        let bare = Schema::new();
        let map = Arc::new(GridMap::map_table(&bare, None));
        let mut mounted = EntityGrid::new(map, "user1@test.com", 30 * 60 * 1000);
        mounted.mount(blob);
        let err = mounted.prepare(&bare).unwrap_err();
        assert_eq!(err.code, ErrorCode::SchemaMismatch);
    }

    #[test]
    fn test_sessions_monotonic_with_gap() {
        let schema = fruit_schema();
        let mut grid = grid_for(&schema);
        let w = grid.map().width();
        let gap = grid.session_gap_ms();
        // three clusters separated by more than the gap
        for cluster in 0..3i64 {
            let base = cluster * (gap * 2);
            for i in 0..3i64 {
                push_row(&mut grid, base + i * 1000, 0, 1, vec![NIL_CELL; w]);
            }
        }
        assert_eq!(grid.session_count(), 3);
        for i in 0..grid.row_count() - 1 {
            assert!(grid.session(i) <= grid.session(i + 1));
        }
        assert_eq!(grid.session(0), 1);
    }

    #[test]
    fn test_set_values_collapse_expanded_rows() {
        let mut schema = Schema::new();
        schema.add("tags", ColumnType::Text, true).unwrap();
        let map = Arc::new(GridMap::map_table(&schema, None));
        let mut grid = EntityGrid::new(map, "u", 1000);
        let tags_col = schema.get_by_name("tags").unwrap().id;

        // one logical event, three expanded rows
        for tag in ["red", "round", "ripe"] {
            push_row(
                &mut grid,
                5000,
                0,
                42,
                vec![cohort_core::hash_text(tag)],
            );
        }
        assert_eq!(grid.row_count(), 3);
        let set = grid.set_values(1, tags_col);
        assert_eq!(set.len(), 3);
        // all expanded rows share one session
        assert_eq!(grid.session_count(), 1);
    }
}

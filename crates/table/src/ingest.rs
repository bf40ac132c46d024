//! JSON event intake
//!
//! Events arrive as
//! `{ "id": "...", "stamp": <ms>, "event": "...", "_": { col: scalar | [scalar, …] } }`.
//! Intake validates columns against the catalog (unknown columns are
//! rejected), normalizes second-resolution stamps, interns text into the
//! partition's text table, resolves the event's z-order, and expands
//! set-valued columns into their physical row copies.

use crate::grid::{encode_cell, EntityGrid, Row, NIL_CELL};
use crate::schema::{ColumnId, ColumnType, Schema};
use crate::zorder::ZOrderMap;
use cohort_core::error::{Error, ErrorCode, Result};
use cohort_core::time::normalize_stamp;
use cohort_core::value::Value;
use cohort_core::TextTable;

/// Insert one JSON event into an entity's grid.
///
/// The caller (the owning partition) has already routed the event to
/// this entity; `event["id"]` is not re-checked here.
pub fn insert_event(
    grid: &mut EntityGrid,
    schema: &Schema,
    zorder: &mut ZOrderMap,
    texts: &mut TextTable,
    event: &serde_json::Value,
) -> Result<()> {
    let stamp = event
        .get("stamp")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| bad_event("missing or non-integer `stamp`"))?;
    let stamp = normalize_stamp(stamp);

    let event_name = event
        .get("event")
        .and_then(|v| v.as_str())
        .ok_or_else(|| bad_event("missing `event`"))?;
    let event_hash = texts.intern(event_name);
    let z = zorder.add(event_name);

    let payload = match event.get("_") {
        Some(serde_json::Value::Object(fields)) => Some(fields),
        Some(_) => return Err(bad_event("`_` must be an object")),
        None => None,
    };

    // (slot, values) per supplied column; set columns may carry many
    let mut supplied: Vec<(usize, ColumnType, Vec<i64>)> = Vec::new();
    if let Some(fields) = payload {
        for (name, raw) in fields {
            let col = schema.get_by_name(name).ok_or_else(|| {
                Error::schema(
                    ErrorCode::UnknownColumn,
                    format!("unknown column `{}` in event payload", name),
                )
            })?;
            let slot = grid.map().slot(col.id).ok_or_else(|| {
                // projection excludes it — ingest always uses a full map
                Error::schema(
                    ErrorCode::UnknownColumn,
                    format!("column `{}` not in the ingest projection", name),
                )
            })?;
            let cells = match raw {
                serde_json::Value::Array(items) => {
                    if !col.set_valued {
                        return Err(Error::schema(
                            ErrorCode::UnknownColumn,
                            format!("column `{}` is not set-valued; arrays rejected", name),
                        ));
                    }
                    items
                        .iter()
                        .map(|item| cell_from_json(item, col, texts))
                        .collect::<Result<Vec<i64>>>()?
                }
                scalar => vec![cell_from_json(scalar, col, texts)?],
            };
            supplied.push((slot, col.ctype, cells));
        }
    }

    // canonical template row, then expand set columns (cartesian when an
    // event carries more than one multi-valued column)
    let width = grid.map().width();
    let mut template = vec![NIL_CELL; width];
    for (slot, _, cells) in &supplied {
        template[*slot] = cells[0];
    }

    let mut rows = vec![template];
    for (slot, _, cells) in &supplied {
        if cells.len() > 1 {
            let mut expanded = Vec::with_capacity(rows.len() * cells.len());
            for row in &rows {
                for cell in cells {
                    let mut copy = row.clone();
                    copy[*slot] = *cell;
                    expanded.push(copy);
                }
            }
            rows = expanded;
        }
    }

    for cells in rows {
        grid.insert_row(Row {
            stamp,
            z,
            event: event_hash,
            cells,
        });
    }
    Ok(())
}

fn cell_from_json(raw: &serde_json::Value, col: &crate::schema::Column, texts: &mut TextTable) -> Result<i64> {
    let value = Value::from_json(raw);
    if matches!(value, Value::List(_) | Value::Dict(_) | Value::Set(_)) {
        return Err(bad_event(format!(
            "column `{}` value must be a scalar",
            col.name
        )));
    }
    if col.ctype == ColumnType::Text {
        if let Value::Text(t) = &value {
            if let Some(s) = t.as_str() {
                texts.intern(s);
            }
        } else {
            texts.intern(&value.to_string());
        }
    }
    Ok(encode_cell(&value, col.ctype))
}

fn bad_event(why: impl Into<String>) -> Error {
    Error::schema(ErrorCode::UnknownColumn, format!("bad event: {}", why.into()))
}

/// Column ids referenced by an event payload; ingest-side dirty marking
/// for segments uses this without inserting.
pub fn payload_columns(schema: &Schema, event: &serde_json::Value) -> Vec<ColumnId> {
    match event.get("_") {
        Some(serde_json::Value::Object(fields)) => fields
            .keys()
            .filter_map(|name| schema.get_by_name(name).map(|c| c.id))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::GridMap;
    use crate::schema::{ColumnType, Schema};
    use std::sync::Arc;

    fn setup() -> (Schema, EntityGrid, ZOrderMap, TextTable) {
        let mut schema = Schema::new();
        schema.add("fruit", ColumnType::Text, false).unwrap();
        schema.add("price", ColumnType::Double, false).unwrap();
        schema.add("tags", ColumnType::Text, true).unwrap();
        let map = Arc::new(GridMap::map_table(&schema, None));
        let grid = EntityGrid::new(map, "user1@test.com", 30 * 60 * 1000);
        (schema, grid, ZOrderMap::new(), TextTable::new())
    }

    fn purchase(stamp: i64, fruit: &str, price: f64) -> serde_json::Value {
        serde_json::json!({
            "id": "user1@test.com",
            "stamp": stamp,
            "event": "purchase",
            "_": { "fruit": fruit, "price": price }
        })
    }

    #[test]
    fn test_basic_insert() {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        insert_event(&mut grid, &schema, &mut zorder, &mut texts, &purchase(1_458_820_830, "orange", 5.55)).unwrap();
        assert_eq!(grid.row_count(), 1);
        // second-resolution stamp was promoted
        assert_eq!(grid.row(0).stamp, 1_458_820_830_000);
        let fruit = schema.get_by_name("fruit").unwrap().id;
        assert!(grid.value(0, fruit).loose_eq(&Value::text("orange")));
        // event name is resolvable from the text table
        assert_eq!(texts.get(grid.row(0).event).as_deref(), Some("purchase"));
    }

    #[test]
    fn test_unknown_column_rejected() {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        let event = serde_json::json!({
            "id": "u", "stamp": 1000, "event": "x",
            "_": { "mystery": 1 }
        });
        let err = insert_event(&mut grid, &schema, &mut zorder, &mut texts, &event).unwrap_err();
        assert_eq!(err.code, ErrorCode::UnknownColumn);
    }

    #[test]
    fn test_array_on_scalar_column_rejected() {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        let event = serde_json::json!({
            "id": "u", "stamp": 1000, "event": "x",
            "_": { "fruit": ["a", "b"] }
        });
        assert!(insert_event(&mut grid, &schema, &mut zorder, &mut texts, &event).is_err());
    }

    #[test]
    fn test_set_expansion() {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        let event = serde_json::json!({
            "id": "u", "stamp": 1000, "event": "label",
            "_": { "tags": ["red", "round", "ripe"] }
        });
        insert_event(&mut grid, &schema, &mut zorder, &mut texts, &event).unwrap();
        assert_eq!(grid.row_count(), 3);
        let tags = schema.get_by_name("tags").unwrap().id;
        // rows differ only in the set column
        assert_eq!(grid.row(0).stamp, grid.row(2).stamp);
        assert_eq!(grid.row(0).event, grid.row(2).event);
        assert_eq!(grid.set_values(0, tags).len(), 3);
    }

    #[test]
    fn test_zorder_breaks_same_stamp_ties() {
        let (schema, mut grid, mut zorder, mut texts) = setup();
        // "first_seen" registered before "purchase" so it sorts first
        zorder.add("first_seen");
        zorder.add("purchase");
        insert_event(&mut grid, &schema, &mut zorder, &mut texts, &serde_json::json!({
            "id": "u", "stamp": 1000, "event": "purchase", "_": {}
        })).unwrap();
        insert_event(&mut grid, &schema, &mut zorder, &mut texts, &serde_json::json!({
            "id": "u", "stamp": 1000, "event": "first_seen", "_": {}
        })).unwrap();
        assert_eq!(texts.get(grid.row(0).event).as_deref(), Some("first_seen"));
        assert_eq!(texts.get(grid.row(1).event).as_deref(), Some("purchase"));
    }
}

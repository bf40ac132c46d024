//! Column catalog (schema)
//!
//! Maps column name ↔ id, carries the value type and the set-valued
//! flag, and validates names. Ids are dense and stable: deletion
//! tombstones a slot, and ids are never reused within a table's
//! lifetime.
//!
//! `id`, `stamp`, `event`, and `session` are implicit built-ins holding
//! the first four slots; `session` is computed by the grid, never
//! stored.

use cohort_core::error::{Error, ErrorCode, Result};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use std::collections::HashSet;

/// Dense, stable column identifier.
pub type ColumnId = u16;

/// Built-in: entity id.
pub const COL_ID: ColumnId = 0;
/// Built-in: event stamp (ms).
pub const COL_STAMP: ColumnId = 1;
/// Built-in: event name (text hash).
pub const COL_EVENT: ColumnId = 2;
/// Built-in: synthesized session number.
pub const COL_SESSION: ColumnId = 3;

/// First id handed to a user column.
pub const FIRST_USER_COL: ColumnId = 4;

/// Maximum column name length.
const MAX_NAME_LEN: usize = 64;

/// Query-language keywords; not usable as column names.
static RESERVED_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "if", "else", "elsif", "for", "each_row", "select", "end", "where", "break", "continue",
        "in", "contains", "any", "true", "false", "nil", "set", "as", "key",
    ]
    .into_iter()
    .collect()
});

/// Is this word a query-language keyword?
pub fn is_reserved_word(word: &str) -> bool {
    RESERVED_WORDS.contains(word)
}

/// Value type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ColumnType {
    /// 64-bit integer
    Int,
    /// 64-bit float
    Double,
    /// Boolean
    Bool,
    /// Text (stored as 64-bit hash)
    Text,
}

/// One catalog entry.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Column {
    /// Dense, stable id
    pub id: ColumnId,
    /// Unique name
    pub name: String,
    /// Value type
    pub ctype: ColumnType,
    /// Multi-valued: one logical event expands to N physical rows
    pub set_valued: bool,
    /// Tombstoned; id never reused
    pub deleted: bool,
}

/// The column catalog for one table.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<Column>,
    by_name: FxHashMap<String, ColumnId>,
}

impl Schema {
    /// A catalog holding only the four built-ins.
    pub fn new() -> Self {
        let mut schema = Schema {
            columns: Vec::new(),
            by_name: FxHashMap::default(),
        };
        for (name, ctype) in [
            ("id", ColumnType::Text),
            ("stamp", ColumnType::Int),
            ("event", ColumnType::Text),
            ("session", ColumnType::Int),
        ] {
            let id = schema.columns.len() as ColumnId;
            schema.columns.push(Column {
                id,
                name: name.to_string(),
                ctype,
                set_valued: false,
                deleted: false,
            });
            schema.by_name.insert(name.to_string(), id);
        }
        schema
    }

    /// Look up by id; tombstoned slots still resolve (the blob reader
    /// needs them to skip dead cells).
    pub fn get_by_id(&self, id: ColumnId) -> Option<&Column> {
        self.columns.get(id as usize)
    }

    /// Look up a live column by name.
    pub fn get_by_name(&self, name: &str) -> Option<&Column> {
        self.by_name
            .get(name)
            .and_then(|id| self.columns.get(*id as usize))
            .filter(|c| !c.deleted)
    }

    /// Is `name` a live column?
    pub fn is_column(&self, name: &str) -> bool {
        self.get_by_name(name).is_some()
    }

    /// Is `name` a live set-valued column?
    pub fn is_set_column(&self, name: &str) -> bool {
        self.get_by_name(name).map(|c| c.set_valued).unwrap_or(false)
    }

    /// Add a column, assigning the next dense id.
    pub fn add(&mut self, name: &str, ctype: ColumnType, set_valued: bool) -> Result<ColumnId> {
        validate_name(name)?;
        if self.by_name.contains_key(name) {
            return Err(Error::schema(
                ErrorCode::DuplicateName,
                format!("column `{}` already exists", name),
            ));
        }
        let id = self.columns.len() as ColumnId;
        self.columns.push(Column {
            id,
            name: name.to_string(),
            ctype,
            set_valued,
            deleted: false,
        });
        self.by_name.insert(name.to_string(), id);
        Ok(id)
    }

    /// Upsert a column at an explicit id, used by the ingest-side schema
    /// sync. Intermediate slots are filled with tombstones so ids stay
    /// dense.
    pub fn set_column(
        &mut self,
        id: ColumnId,
        name: &str,
        ctype: ColumnType,
        set_valued: bool,
    ) -> Result<()> {
        validate_name(name)?;
        if let Some(existing) = self.by_name.get(name) {
            if *existing != id {
                return Err(Error::schema(
                    ErrorCode::DuplicateName,
                    format!("column `{}` already exists at id {}", name, existing),
                ));
            }
        }
        while self.columns.len() <= id as usize {
            let fill = self.columns.len() as ColumnId;
            self.columns.push(Column {
                id: fill,
                name: format!("__tombstone_{}", fill),
                ctype: ColumnType::Int,
                set_valued: false,
                deleted: true,
            });
        }
        let slot = &mut self.columns[id as usize];
        if !slot.deleted {
            self.by_name.remove(&slot.name);
        }
        *slot = Column {
            id,
            name: name.to_string(),
            ctype,
            set_valued,
            deleted: false,
        };
        self.by_name.insert(name.to_string(), id);
        Ok(())
    }

    /// Tombstone a column. Built-ins cannot be deleted.
    pub fn delete(&mut self, id: ColumnId) -> Result<()> {
        if id < FIRST_USER_COL {
            return Err(Error::schema(
                ErrorCode::InvalidName,
                "built-in columns cannot be deleted",
            ));
        }
        let col = self.columns.get_mut(id as usize).ok_or_else(|| {
            Error::schema(ErrorCode::UnknownColumn, format!("no column with id {}", id))
        })?;
        col.deleted = true;
        self.by_name.remove(&col.name);
        Ok(())
    }

    /// Total slots, tombstones included.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Iterate live columns.
    pub fn live_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.deleted)
    }
}

impl Default for Schema {
    fn default() -> Self {
        Schema::new()
    }
}

/// Validate a column name: ASCII letters/digits/underscore, first char a
/// letter or underscore, length ≤ 64, not a reserved word.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(Error::schema(
            ErrorCode::InvalidName,
            format!("column name `{}` must be 1–{} characters", name, MAX_NAME_LEN),
        ));
    }
    let mut chars = name.chars();
    let first = chars.next().unwrap();
    if !(first.is_ascii_alphabetic() || first == '_') {
        return Err(Error::schema(
            ErrorCode::InvalidName,
            format!("column name `{}` must start with a letter or underscore", name),
        ));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(Error::schema(
            ErrorCode::InvalidName,
            format!("column name `{}` has characters outside [A-Za-z0-9_]", name),
        ));
    }
    if is_reserved_word(name) {
        return Err(Error::schema(
            ErrorCode::ReservedWord,
            format!("`{}` is a reserved word", name),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_present() {
        let schema = Schema::new();
        assert_eq!(schema.get_by_name("id").unwrap().id, COL_ID);
        assert_eq!(schema.get_by_name("stamp").unwrap().id, COL_STAMP);
        assert_eq!(schema.get_by_name("event").unwrap().id, COL_EVENT);
        assert_eq!(schema.get_by_name("session").unwrap().id, COL_SESSION);
    }

    #[test]
    fn test_add_assigns_dense_ids() {
        let mut schema = Schema::new();
        let a = schema.add("fruit", ColumnType::Text, false).unwrap();
        let b = schema.add("price", ColumnType::Double, false).unwrap();
        assert_eq!(a, FIRST_USER_COL);
        assert_eq!(b, FIRST_USER_COL + 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut schema = Schema::new();
        schema.add("fruit", ColumnType::Text, false).unwrap();
        let err = schema.add("fruit", ColumnType::Int, false).unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateName);
    }

    #[test]
    fn test_delete_tombstones_without_reuse() {
        let mut schema = Schema::new();
        let a = schema.add("fruit", ColumnType::Text, false).unwrap();
        schema.delete(a).unwrap();
        assert!(schema.get_by_name("fruit").is_none());
        // id slot survives for the blob reader
        assert!(schema.get_by_id(a).unwrap().deleted);
        // a fresh column gets a fresh id
        let b = schema.add("fruit", ColumnType::Text, false).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_name("fruit_2").is_ok());
        assert!(validate_name("_hidden").is_ok());
        assert!(validate_name("9lives").is_err());
        assert!(validate_name("bad-name").is_err());
        assert!(validate_name("").is_err());
        assert!(validate_name(&"x".repeat(65)).is_err());
        let err = validate_name("select").unwrap_err();
        assert_eq!(err.code, ErrorCode::ReservedWord);
    }

    #[test]
    fn test_builtin_delete_rejected() {
        let mut schema = Schema::new();
        assert!(schema.delete(COL_STAMP).is_err());
    }
}

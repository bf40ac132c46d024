//! Database: the table registry
//!
//! The embedding host builds one [`Database`] per process, hands it a
//! [`RuntimeConfig`], and reaches tables through it. Tables are shared
//! behind `Arc`; the registry itself is a concurrent map.

use crate::table::Table;
use cohort_core::error::{Error, ErrorCode, Result};
use cohort_core::RuntimeConfig;
use cohort_table::schema::validate_name;
use dashmap::DashMap;
use std::sync::Arc;

/// Per-process table registry.
pub struct Database {
    config: RuntimeConfig,
    tables: DashMap<String, Arc<Table>>,
}

impl Database {
    /// Database with the given runtime configuration.
    pub fn new(config: RuntimeConfig) -> Self {
        Database {
            config,
            tables: DashMap::new(),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Create a table. Table names follow column-name rules.
    pub fn create_table(&self, name: &str) -> Result<Arc<Table>> {
        validate_name(name)?;
        if self.tables.contains_key(name) {
            return Err(Error::schema(
                ErrorCode::DuplicateName,
                format!("table `{}` already exists", name),
            ));
        }
        let table = Arc::new(Table::new(name, self.config.clone()));
        self.tables.insert(name.to_string(), table.clone());
        tracing::info!(table = name, "table created");
        Ok(table)
    }

    /// Fetch a table.
    pub fn table(&self, name: &str) -> Option<Arc<Table>> {
        self.tables.get(name).map(|t| t.clone())
    }

    /// Fetch or create.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<Table>> {
        if let Some(table) = self.table(name) {
            return Ok(table);
        }
        self.create_table(name)
    }

    /// Drop a table.
    pub fn drop_table(&self, name: &str) -> bool {
        self.tables.remove(name).is_some()
    }

    /// Table names, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_fetch() {
        let db = Database::new(RuntimeConfig::single());
        db.create_table("events").unwrap();
        assert!(db.table("events").is_some());
        assert!(db.table("other").is_none());
        assert_eq!(db.table_names(), vec!["events"]);
    }

    #[test]
    fn test_duplicate_table_rejected() {
        let db = Database::new(RuntimeConfig::single());
        db.create_table("events").unwrap();
        assert!(db.create_table("events").is_err());
    }

    #[test]
    fn test_invalid_table_name_rejected() {
        let db = Database::new(RuntimeConfig::single());
        assert!(db.create_table("bad name").is_err());
        assert!(db.create_table("select").is_err());
    }
}

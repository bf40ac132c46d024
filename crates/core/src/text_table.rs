//! Partition-local hash → string table
//!
//! Text values live in grid cells and group keys as 64-bit hashes; the
//! owning partition keeps the only mapping back to the strings. Tables
//! are unified at merge time, where a collision (same hash, different
//! strings) is detected and fails the query.

use crate::error::{Error, ErrorCode, Result};
use crate::hash_text;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Hash → string mapping local to one partition (or one result set).
#[derive(Debug, Clone, Default)]
pub struct TextTable {
    entries: FxHashMap<i64, Arc<str>>,
}

impl TextTable {
    /// Empty table.
    pub fn new() -> Self {
        TextTable::default()
    }

    /// Intern a string, returning its hash.
    pub fn intern(&mut self, s: &str) -> i64 {
        let hash = hash_text(s);
        self.entries.entry(hash).or_insert_with(|| Arc::from(s));
        hash
    }

    /// Record a known hash → string pair.
    pub fn insert(&mut self, hash: i64, s: &str) {
        self.entries.entry(hash).or_insert_with(|| Arc::from(s));
    }

    /// Resolve a hash.
    pub fn get(&self, hash: i64) -> Option<Arc<str>> {
        self.entries.get(&hash).cloned()
    }

    /// Number of distinct strings.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no strings are interned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate `(hash, string)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (i64, &Arc<str>)> {
        self.entries.iter().map(|(h, s)| (*h, s))
    }

    /// Absorb another table, detecting 64-bit collisions: the same hash
    /// bound to two different strings is an internal error.
    pub fn unify(&mut self, other: &TextTable) -> Result<()> {
        for (hash, s) in other.iter() {
            match self.entries.get(&hash) {
                Some(existing) if existing.as_ref() != s.as_ref() => {
                    return Err(Error::internal(
                        ErrorCode::HashCollision,
                        format!(
                            "hash {:#x} binds both {:?} and {:?}",
                            hash, existing, s
                        ),
                    ));
                }
                Some(_) => {}
                None => {
                    self.entries.insert(hash, s.clone());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_and_resolve() {
        let mut table = TextTable::new();
        let h = table.intern("banana");
        assert_eq!(table.get(h).as_deref(), Some("banana"));
        assert_eq!(table.intern("banana"), h);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_unify_merges_and_detects_collisions() {
        let mut a = TextTable::new();
        a.intern("apple");
        let mut b = TextTable::new();
        b.intern("pear");
        a.unify(&b).unwrap();
        assert_eq!(a.len(), 2);

        // forge a collision
        let mut forged = TextTable::new();
        forged.insert(crate::hash_text("apple"), "not apple");
        let err = a.unify(&forged).unwrap_err();
        assert_eq!(err.code, ErrorCode::HashCollision);
    }
}

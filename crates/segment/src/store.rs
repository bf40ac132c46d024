//! Per-partition segment cache
//!
//! Bits are owned by the partition; there is no cross-partition
//! sharing, so nothing here locks. The store records, per segment, the
//! cache policy from the `@segment` section, the previous snapshot for
//! delta emission, and the column ids the program referenced (ingest
//! marks dependents dirty through them).

use cohort_index::IndexBits;
use cohort_query::Section;
use cohort_table::schema::ColumnId;
use cohort_vm::SegmentReader;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Enter/exit direction of a delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SegmentChange {
    /// Bit newly set
    Enter,
    /// Bit newly cleared
    Exit,
}

/// One emitted segment membership change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDelta {
    /// Segment name
    pub segment: String,
    /// Direction
    pub change: SegmentChange,
    /// Entity id string
    pub entity_id: String,
}

/// One cached segment.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Segment name
    pub name: String,
    /// Current bits
    pub bits: IndexBits,
    /// Cache TTL in ms (≤ 0 = forever)
    pub ttl_ms: i64,
    /// How long cached bits count as fresh
    pub refresh_ms: i64,
    /// Stamp of the last recompute
    pub last_refresh_ms: i64,
    /// Population at last recompute
    pub cached_population: u64,
    /// Previous snapshot (delta emission)
    pub previous_bits: Option<IndexBits>,
    /// Ingest touched a referenced column since last refresh
    pub dirty: bool,
    /// Columns the program references
    pub columns: Vec<ColumnId>,
}

/// The partition's segment cache plus its outgoing message queue.
#[derive(Debug, Default)]
pub struct SegmentStore {
    segments: FxHashMap<String, Segment>,
    messages: Vec<SegmentDelta>,
    entity_count: usize,
}

impl SegmentStore {
    /// Empty store.
    pub fn new() -> Self {
        SegmentStore::default()
    }

    /// Keep the complement bound aligned with the partition's entity
    /// table.
    pub fn set_entity_count(&mut self, n: usize) {
        self.entity_count = n;
    }

    /// Cached bits are served without recompute when inside the
    /// refresh window and not dirty.
    pub fn is_fresh(&self, name: &str, now_ms: i64) -> bool {
        match self.segments.get(name) {
            Some(segment) => {
                !segment.dirty
                    && segment.refresh_ms > 0
                    && now_ms - segment.last_refresh_ms < segment.refresh_ms
            }
            None => false,
        }
    }

    /// TTL expiry check (≤ 0 never expires).
    pub fn is_expired(&self, name: &str, now_ms: i64) -> bool {
        match self.segments.get(name) {
            Some(segment) => {
                segment.ttl_ms > 0 && now_ms - segment.last_refresh_ms > segment.ttl_ms
            }
            None => true,
        }
    }

    /// Borrow a cached segment.
    pub fn get(&self, name: &str) -> Option<&Segment> {
        self.segments.get(name)
    }

    /// Cached population, if present.
    pub fn population(&self, name: &str) -> Option<u64> {
        self.segments.get(name).map(|s| s.cached_population)
    }

    /// Store freshly computed bits, emitting enter/exit deltas against
    /// the previous snapshot. `resolve` maps a linear id back to its
    /// entity id string for the delta payload.
    pub fn store_result<F>(
        &mut self,
        name: &str,
        bits: IndexBits,
        section: Option<&Section>,
        columns: &[ColumnId],
        now_ms: i64,
        resolve: F,
    ) -> usize
    where
        F: Fn(usize) -> Option<String>,
    {
        let population = bits.population();
        let previous = self.segments.get(name).map(|s| s.bits.clone());

        let mut emitted = 0;
        if let Some(previous) = &previous {
            for lin in 0..self.entity_count {
                let before = previous.state(lin);
                let after = bits.state(lin);
                if before == after {
                    continue;
                }
                if let Some(entity_id) = resolve(lin) {
                    self.messages.push(SegmentDelta {
                        segment: name.to_string(),
                        change: if after {
                            SegmentChange::Enter
                        } else {
                            SegmentChange::Exit
                        },
                        entity_id,
                    });
                    emitted += 1;
                }
            }
        } else {
            // first computation: everything set is an enter
            for lin in bits.ones() {
                if let Some(entity_id) = resolve(lin) {
                    self.messages.push(SegmentDelta {
                        segment: name.to_string(),
                        change: SegmentChange::Enter,
                        entity_id,
                    });
                    emitted += 1;
                }
            }
        }

        tracing::debug!(segment = name, population, emitted, "segment stored");

        self.segments.insert(
            name.to_string(),
            Segment {
                name: name.to_string(),
                bits,
                ttl_ms: section.and_then(|s| s.ttl_ms).unwrap_or(0),
                refresh_ms: section.and_then(|s| s.refresh_ms).unwrap_or(0),
                last_refresh_ms: now_ms,
                cached_population: population,
                previous_bits: previous,
                dirty: false,
                columns: columns.to_vec(),
            },
        );
        emitted
    }

    /// Ingest touched `columns`: mark dependent segments dirty.
    pub fn mark_dirty_for_columns(&mut self, columns: &[ColumnId]) {
        for segment in self.segments.values_mut() {
            if segment.columns.iter().any(|c| columns.contains(c)) {
                segment.dirty = true;
            }
        }
    }

    /// Segments currently marked dirty with `on_insert` semantics are
    /// the caller's recompute list.
    pub fn dirty_segments(&self) -> Vec<String> {
        self.segments
            .values()
            .filter(|s| s.dirty)
            .map(|s| s.name.clone())
            .collect()
    }

    /// Drop a segment (DELETE).
    pub fn invalidate(&mut self, name: &str) -> bool {
        self.segments.remove(name).is_some()
    }

    /// Drop segments past their TTL.
    pub fn sweep_expired(&mut self, now_ms: i64) {
        self.segments
            .retain(|_, s| !(s.ttl_ms > 0 && now_ms - s.last_refresh_ms > s.ttl_ms));
    }

    /// Drain the pending enter/exit messages.
    pub fn drain_messages(&mut self) -> Vec<SegmentDelta> {
        std::mem::take(&mut self.messages)
    }

    /// Names of cached segments.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.segments.keys().cloned().collect();
        names.sort();
        names
    }
}

impl SegmentReader for SegmentStore {
    fn segment_bits(&self, name: &str) -> Option<IndexBits> {
        self.segments.get(name).map(|s| s.bits.clone())
    }

    fn entity_count(&self) -> usize {
        self.entity_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve(lin: usize) -> Option<String> {
        Some(format!("user{}", lin))
    }

    #[test]
    fn test_first_store_emits_enters() {
        let mut store = SegmentStore::new();
        store.set_entity_count(5);
        let bits: IndexBits = [1, 2, 3].into_iter().collect();
        let emitted = store.store_result("segA", bits, None, &[], 1000, resolve);
        assert_eq!(emitted, 3);
        let messages = store.drain_messages();
        assert!(messages
            .iter()
            .all(|m| m.change == SegmentChange::Enter && m.segment == "segA"));
        assert_eq!(store.population("segA"), Some(3));
    }

    #[test]
    fn test_recompute_emits_diffs() {
        let mut store = SegmentStore::new();
        store.set_entity_count(5);
        store.store_result("segA", [1, 2].into_iter().collect(), None, &[], 1000, resolve);
        store.drain_messages();

        store.store_result("segA", [2, 4].into_iter().collect(), None, &[], 2000, resolve);
        let mut messages = store.drain_messages();
        messages.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].entity_id, "user1");
        assert_eq!(messages[0].change, SegmentChange::Exit);
        assert_eq!(messages[1].entity_id, "user4");
        assert_eq!(messages[1].change, SegmentChange::Enter);
    }

    #[test]
    fn test_refresh_window() {
        let mut store = SegmentStore::new();
        store.set_entity_count(2);
        let section = Section {
            refresh_ms: Some(1000),
            ttl_ms: Some(10_000),
            ..Section::default()
        };
        store.store_result(
            "segA",
            [0].into_iter().collect(),
            Some(&section),
            &[],
            5000,
            resolve,
        );
        assert!(store.is_fresh("segA", 5500));
        assert!(!store.is_fresh("segA", 6500));
        assert!(!store.is_expired("segA", 14_000));
        assert!(store.is_expired("segA", 16_000));
    }

    #[test]
    fn test_dirty_marking() {
        let mut store = SegmentStore::new();
        store.set_entity_count(2);
        store.store_result("segA", IndexBits::new(), None, &[4, 5], 1000, resolve);
        store.store_result("segB", IndexBits::new(), None, &[9], 1000, resolve);
        store.mark_dirty_for_columns(&[5]);
        assert_eq!(store.dirty_segments(), vec!["segA".to_string()]);
        assert!(!store.is_fresh("segA", 1001));
    }
}

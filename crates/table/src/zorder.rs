//! Z-order: per-table event → tie-break integer
//!
//! Rows sharing a stamp sort by z-order before event hash. The mapping
//! is append-only (collaborator persists it as `zorder.meta`); events
//! without an entry sort after all known events.

use rustc_hash::FxHashMap;

/// Z-order assigned to events not present in the map.
pub const Z_UNKNOWN: i32 = i32::MAX;

/// Append-only `event name → small int` ordering table.
#[derive(Debug, Clone, Default)]
pub struct ZOrderMap {
    entries: FxHashMap<String, i32>,
    next: i32,
}

impl ZOrderMap {
    /// Empty map.
    pub fn new() -> Self {
        ZOrderMap::default()
    }

    /// Assign the next slot to `event` if absent; returns its z-order.
    pub fn add(&mut self, event: &str) -> i32 {
        if let Some(z) = self.entries.get(event) {
            return *z;
        }
        let z = self.next;
        self.entries.insert(event.to_string(), z);
        self.next += 1;
        z
    }

    /// Pin `event` to an explicit slot (from a `z_index` section flag).
    pub fn set(&mut self, event: &str, z: i32) {
        self.entries.insert(event.to_string(), z);
        if z >= self.next {
            self.next = z + 1;
        }
    }

    /// Z-order for `event`; unknown events sort last.
    pub fn get(&self, event: &str) -> i32 {
        self.entries.get(event).copied().unwrap_or(Z_UNKNOWN)
    }

    /// Number of known events.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no events are known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_order() {
        let mut z = ZOrderMap::new();
        assert_eq!(z.add("signup"), 0);
        assert_eq!(z.add("purchase"), 1);
        assert_eq!(z.add("signup"), 0);
    }

    #[test]
    fn test_unknown_sorts_last() {
        let mut z = ZOrderMap::new();
        z.add("known");
        assert!(z.get("unknown") > z.get("known"));
        assert_eq!(z.get("unknown"), Z_UNKNOWN);
    }

    #[test]
    fn test_explicit_pin() {
        let mut z = ZOrderMap::new();
        z.set("checkout", 10);
        assert_eq!(z.get("checkout"), 10);
        // next implicit assignment lands after the pin
        assert_eq!(z.add("browse"), 11);
    }
}

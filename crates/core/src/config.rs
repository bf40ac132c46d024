//! Per-process runtime configuration
//!
//! The engine takes an explicit [`RuntimeConfig`] handle instead of
//! module-global state; the embedding host builds one at startup and
//! threads it through table and partition construction.

use crate::time::MS_MINUTE;

/// Tunables shared by every table and partition in the process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Two successive rows belong to the same session iff their stamps
    /// are within this many milliseconds (default 30 minutes).
    pub session_gap_ms: i64,
    /// Cooperative scheduling slice: a worker yields a query after
    /// spending at least this long on it.
    pub slice_ms: u64,
    /// Worker threads in the pool.
    pub workers: usize,
    /// Partitions per table.
    pub partitions: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            session_gap_ms: 30 * MS_MINUTE,
            slice_ms: 10,
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            partitions: 8,
        }
    }
}

impl RuntimeConfig {
    /// Config with a single partition and worker, used by tests.
    pub fn single() -> Self {
        RuntimeConfig {
            workers: 1,
            partitions: 1,
            ..RuntimeConfig::default()
        }
    }
}

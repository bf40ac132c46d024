//! Table: catalog, z-order, partitions, and the query/segment drivers
//!
//! The column catalog is read-mostly: queries take the read lock just
//! long enough to compile and snapshot the schema; schema changes take
//! the write lock. Partitions are routed by entity-id hash and locked
//! individually; the z-order map is table-wide and append-only.

use crate::control::QueryControl;
use crate::partition::Partition;
use crate::scheduler::{LoopState, OpenLoop, WorkerPool};
use cohort_core::error::{Error, ErrorCode, Result};
use cohort_core::value::Value;
use cohort_core::{hash_text, RuntimeConfig};
use cohort_index::IndexBits;
use cohort_query::{compile_with_params, Program};
use cohort_result::{merge, MergeOptions, ResultAccumulator, ResultSet};
use cohort_segment::{evaluate_segment_math, SegmentDelta};
use cohort_table::schema::{ColumnId, ColumnType, Schema};
use cohort_table::ZOrderMap;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Wall-clock budget for the whole query
    pub deadline: Option<Duration>,
    /// Sort sibling groups by this select column (descending)
    pub sort_by: Option<String>,
    /// `{{name}}` substitutions
    pub params: BTreeMap<String, Value>,
}

/// Result of a segment computation.
#[derive(Debug)]
pub struct SegmentOutcome {
    /// Segment name (from the `@segment` directive)
    pub name: String,
    /// Total population across partitions
    pub population: u64,
    /// Enter/exit deltas emitted by this computation
    pub deltas: Vec<SegmentDelta>,
}

/// One event table.
pub struct Table {
    name: String,
    config: RuntimeConfig,
    schema: RwLock<Schema>,
    zorder: Mutex<ZOrderMap>,
    partitions: Vec<Mutex<Partition>>,
    pool: WorkerPool,
}

impl Table {
    /// Create a table with the configured partition count.
    pub fn new(name: &str, config: RuntimeConfig) -> Self {
        let partitions = (0..config.partitions.max(1))
            .map(|id| Mutex::new(Partition::new(id, config.session_gap_ms)))
            .collect();
        let pool = WorkerPool::new(config.workers, config.slice_ms);
        Table {
            name: name.to_string(),
            config,
            schema: RwLock::new(Schema::new()),
            zorder: Mutex::new(ZOrderMap::new()),
            partitions,
            pool,
        }
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The runtime configuration this table was built with.
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ------------------------------------------------------------------
    // schema
    // ------------------------------------------------------------------

    /// Add a column.
    pub fn add_column(&self, name: &str, ctype: ColumnType, set_valued: bool) -> Result<ColumnId> {
        self.schema.write().add(name, ctype, set_valued)
    }

    /// Tombstone a column.
    pub fn delete_column(&self, id: ColumnId) -> Result<()> {
        self.schema.write().delete(id)
    }

    /// Id of a live column.
    pub fn column_id(&self, name: &str) -> Option<ColumnId> {
        self.schema.read().get_by_name(name).map(|c| c.id)
    }

    /// Snapshot of the catalog (read lock held only for the clone).
    pub fn schema_snapshot(&self) -> Schema {
        self.schema.read().clone()
    }

    // ------------------------------------------------------------------
    // ingest
    // ------------------------------------------------------------------

    /// Ingest one event, routing by entity-id hash.
    pub fn insert(&self, event: &serde_json::Value) -> Result<()> {
        let id = event
            .get("id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::schema(ErrorCode::UnknownColumn, "event is missing `id`"))?;
        let route = (hash_text(id) as u64 % self.partitions.len() as u64) as usize;
        let schema = self.schema.read();
        let mut zorder = self.zorder.lock();
        self.partitions[route]
            .lock()
            .ingest(&schema, &mut zorder, event)
    }

    /// Ingest a JSON array (or single object) of events.
    pub fn insert_json(&self, raw: &str) -> Result<usize> {
        let parsed: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            Error::schema(ErrorCode::UnknownColumn, format!("bad event JSON: {}", e))
        })?;
        match parsed {
            serde_json::Value::Array(events) => {
                for event in &events {
                    self.insert(event)?;
                }
                Ok(events.len())
            }
            single => {
                self.insert(&single)?;
                Ok(1)
            }
        }
    }

    // ------------------------------------------------------------------
    // queries
    // ------------------------------------------------------------------

    /// Compile a script against the current catalog.
    pub fn compile(&self, code: &str) -> Result<Program> {
        cohort_query::compile(&self.schema.read(), code)
    }

    /// Run a query with default options.
    pub fn query(&self, code: &str) -> Result<serde_json::Value> {
        self.query_with(code, &QueryOptions::default())
    }

    /// Run a query: compile, prune candidates per partition, evaluate
    /// entities under the worker pool, merge partition results.
    pub fn query_with(&self, code: &str, options: &QueryOptions) -> Result<serde_json::Value> {
        let schema = self.schema_snapshot();
        let program = Arc::new(compile_with_params(&schema, code, &options.params)?);
        let control = QueryControl::new(options.deadline.map(|d| Instant::now() + d));

        let outputs: Vec<Mutex<Option<ResultSet>>> =
            self.partitions.iter().map(|_| Mutex::new(None)).collect();

        let loops: Vec<QueryLoop<'_>> = self
            .partitions
            .iter()
            .zip(outputs.iter())
            .map(|(partition, out)| QueryLoop {
                partition,
                schema: &schema,
                program: program.as_ref(),
                control: &control,
                candidates: None,
                next: 0,
                accumulator: Some(ResultAccumulator::new(&program.selects)),
                out,
            })
            .collect();

        for outcome in self.pool.run(loops) {
            // a failed partition fails the query; no partial results
            outcome?;
        }

        let results: Vec<ResultSet> = outputs
            .into_iter()
            .filter_map(|slot| slot.into_inner())
            .collect();

        let sort_by_slot = options
            .sort_by
            .as_ref()
            .and_then(|name| program.selects.iter().position(|s| s.name == *name));
        merge(results, &MergeOptions { sort_by_slot })
    }

    /// Run a script against one entity and return its `debug(...)`
    /// log. Test and troubleshooting path.
    pub fn debug_entity(&self, entity_id: &str, code: &str) -> Result<Vec<Value>> {
        let schema = self.schema_snapshot();
        let program = cohort_query::compile(&schema, code)?;
        let route = (hash_text(entity_id) as u64 % self.partitions.len() as u64) as usize;
        self.partitions[route]
            .lock()
            .debug_entity(entity_id, &schema, &program)
    }

    // ------------------------------------------------------------------
    // segments
    // ------------------------------------------------------------------

    /// Compute (or serve from cache) the segment a script defines.
    pub fn segment(&self, code: &str) -> Result<SegmentOutcome> {
        let schema = self.schema_snapshot();
        let program = Arc::new(cohort_query::compile(&schema, code)?);
        let section = program.section.clone();
        let name = section
            .as_ref()
            .map(|s| s.name.clone())
            .ok_or_else(|| {
                Error::compile(
                    ErrorCode::SyntaxError,
                    "segment scripts require an `@segment <name>` directive",
                )
            })?;
        let now_ms = chrono::Utc::now().timestamp_millis();
        let control = QueryControl::unbounded();

        let loops: Vec<SegmentLoop<'_>> = self
            .partitions
            .iter()
            .map(|partition| SegmentLoop {
                partition,
                schema: &schema,
                program: program.as_ref(),
                control: &control,
                name: &name,
                now_ms,
                candidates: None,
                next: 0,
                bits: IndexBits::new(),
            })
            .collect();

        let outcomes = self.pool.run(loops);
        for outcome in outcomes {
            outcome?;
        }

        let mut population = 0u64;
        let mut deltas = Vec::new();
        for partition in &self.partitions {
            let mut partition = partition.lock();
            population += partition.segments().population(&name).unwrap_or(0);
            deltas.extend(partition.segments_mut().drain_messages());
        }

        tracing::info!(table = %self.name, segment = %name, population, "segment computed");
        Ok(SegmentOutcome {
            name,
            population,
            deltas,
        })
    }

    /// Cached population of a segment, if every partition has it.
    pub fn segment_population(&self, name: &str) -> Option<u64> {
        let mut total = 0u64;
        for partition in &self.partitions {
            total += partition.lock().segments().population(name)?;
        }
        Some(total)
    }

    /// Invalidate a segment everywhere.
    pub fn delete_segment(&self, name: &str) -> bool {
        let mut any = false;
        for partition in &self.partitions {
            any |= partition.lock().segments_mut().invalidate(name);
        }
        any
    }
}

// ----------------------------------------------------------------------
// open loops
// ----------------------------------------------------------------------

struct QueryLoop<'a> {
    partition: &'a Mutex<Partition>,
    schema: &'a Schema,
    program: &'a Program,
    control: &'a QueryControl,
    candidates: Option<Vec<usize>>,
    next: usize,
    accumulator: Option<ResultAccumulator>,
    out: &'a Mutex<Option<ResultSet>>,
}

impl OpenLoop for QueryLoop<'_> {
    fn run_slice(&mut self, budget: Duration) -> Result<LoopState> {
        let started = Instant::now();
        let partition = self.partition.lock();
        if self.candidates.is_none() {
            self.candidates = Some(partition.candidates(self.program));
        }
        let candidates = self.candidates.as_ref().expect("just seeded");
        let accumulator = self.accumulator.as_mut().expect("taken only on Done");

        while self.next < candidates.len() {
            self.control.checkpoint()?;
            partition.evaluate_entity(candidates[self.next], self.schema, self.program, accumulator)?;
            self.next += 1;
            if started.elapsed() >= budget {
                return Ok(LoopState::Yielded);
            }
        }
        drop(partition);
        *self.out.lock() = Some(
            self.accumulator
                .take()
                .expect("taken only on Done")
                .into_result_set(),
        );
        Ok(LoopState::Done)
    }
}

struct SegmentLoop<'a> {
    partition: &'a Mutex<Partition>,
    schema: &'a Schema,
    program: &'a Program,
    control: &'a QueryControl,
    name: &'a str,
    now_ms: i64,
    candidates: Option<Vec<usize>>,
    next: usize,
    bits: IndexBits,
}

impl SegmentLoop<'_> {
    fn store(&mut self, partition: &mut Partition, bits: IndexBits) {
        let ids: Vec<Option<String>> = (0..partition.entity_count())
            .map(|lin| partition.entity_id(lin).map(str::to_owned))
            .collect();
        let columns = self.program.columns.clone();
        let section = self.program.section.clone();
        partition.segments_mut().store_result(
            self.name,
            bits,
            section.as_ref(),
            &columns,
            self.now_ms,
            |lin| ids.get(lin).cloned().flatten(),
        );
    }
}

impl OpenLoop for SegmentLoop<'_> {
    fn run_slice(&mut self, budget: Duration) -> Result<LoopState> {
        let started = Instant::now();
        let mut partition = self.partition.lock();

        // cached bits within the refresh window are served as-is
        let use_cached = self
            .program
            .section
            .as_ref()
            .map(|s| s.use_cached)
            .unwrap_or(false);
        if use_cached && partition.segments().is_fresh(self.name, self.now_ms) {
            return Ok(LoopState::Done);
        }

        // segment math computes straight from cached bitmaps
        if self.program.segment_math_only {
            let bits = evaluate_segment_math(self.program, partition.segments())?;
            self.store(&mut partition, bits);
            return Ok(LoopState::Done);
        }

        // a countable index answers the segment without execution
        if self.program.index.countable {
            let bits = self.program.index.evaluate(partition.bit_index());
            self.store(&mut partition, bits);
            return Ok(LoopState::Done);
        }

        if self.candidates.is_none() {
            self.candidates = Some(partition.candidates(self.program));
        }
        let candidates = self.candidates.as_ref().expect("just seeded");

        while self.next < candidates.len() {
            self.control.checkpoint()?;
            let linear = candidates[self.next];
            if partition.evaluate_entity_bit(linear, self.schema, self.program)? {
                self.bits.set(linear);
            }
            self.next += 1;
            if started.elapsed() >= budget {
                return Ok(LoopState::Yielded);
            }
        }
        let bits = std::mem::take(&mut self.bits);
        self.store(&mut partition, bits);
        Ok(LoopState::Done)
    }
}

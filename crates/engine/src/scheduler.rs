//! Worker pool and cooperative open loops
//!
//! A query (or segment computation) is sliced into [`OpenLoop`]s, one
//! per partition. The pool pins each partition's loop to one worker;
//! a worker polls its loops round-robin, giving each a `slice_ms`
//! budget per poll so long scans never starve the other loops sharing
//! the worker. Loops suspend only at entity boundaries — `run_slice`
//! returns `Yielded` with its resume position held in the loop.

use cohort_core::error::Result;
use std::time::Duration;

/// Disposition of one slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Budget spent; call again
    Yielded,
    /// Loop finished
    Done,
}

/// A resumable unit of partition work.
pub trait OpenLoop: Send {
    /// Run for at most `budget`, suspending between entities.
    fn run_slice(&mut self, budget: Duration) -> Result<LoopState>;
}

/// Bounded worker pool executing open loops.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    slice: Duration,
}

impl WorkerPool {
    /// Pool with `workers` threads and the given slice budget.
    pub fn new(workers: usize, slice_ms: u64) -> Self {
        WorkerPool {
            workers: workers.max(1),
            slice: Duration::from_millis(slice_ms.max(1)),
        }
    }

    /// Run a set of loops to completion. Loops are pinned to workers
    /// round-robin; each worker polls its share cooperatively. Returns
    /// one result per loop, in input order.
    pub fn run<L: OpenLoop>(&self, loops: Vec<L>) -> Vec<Result<()>> {
        let worker_count = self.workers.min(loops.len().max(1));
        let slice = self.slice;

        // pin loops to workers round-robin
        let mut assignments: Vec<Vec<(usize, L)>> = (0..worker_count).map(|_| Vec::new()).collect();
        for (i, l) in loops.into_iter().enumerate() {
            assignments[i % worker_count].push((i, l));
        }

        let mut outcomes: Vec<Result<()>> = Vec::new();
        std::thread::scope(|scope| {
            let handles: Vec<_> = assignments
                .into_iter()
                .map(|mine| {
                    scope.spawn(move || {
                        let mut mine: Vec<(usize, L, Option<Result<()>>)> =
                            mine.into_iter().map(|(i, l)| (i, l, None)).collect();
                        loop {
                            let mut pending = false;
                            for (_, open_loop, outcome) in mine.iter_mut() {
                                if outcome.is_some() {
                                    continue;
                                }
                                match open_loop.run_slice(slice) {
                                    Ok(LoopState::Yielded) => pending = true,
                                    Ok(LoopState::Done) => *outcome = Some(Ok(())),
                                    Err(e) => *outcome = Some(Err(e)),
                                }
                            }
                            if !pending {
                                break;
                            }
                            std::thread::yield_now();
                        }
                        mine.into_iter()
                            .map(|(i, _, outcome)| (i, outcome.unwrap_or(Ok(()))))
                            .collect::<Vec<_>>()
                    })
                })
                .collect();

            let mut collected: Vec<(usize, Result<()>)> = Vec::new();
            for handle in handles {
                collected.extend(handle.join().expect("worker panicked"));
            }
            collected.sort_by_key(|(i, _)| *i);
            outcomes = collected.into_iter().map(|(_, r)| r).collect();
        });
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountLoop {
        left: usize,
        hits: Arc<AtomicUsize>,
    }

    impl OpenLoop for CountLoop {
        fn run_slice(&mut self, _budget: Duration) -> Result<LoopState> {
            if self.left == 0 {
                return Ok(LoopState::Done);
            }
            self.left -= 1;
            self.hits.fetch_add(1, Ordering::Relaxed);
            Ok(LoopState::Yielded)
        }
    }

    #[test]
    fn test_all_loops_complete() {
        let hits = Arc::new(AtomicUsize::new(0));
        let loops: Vec<CountLoop> = (0..5)
            .map(|i| CountLoop {
                left: i + 1,
                hits: hits.clone(),
            })
            .collect();
        let pool = WorkerPool::new(2, 1);
        let outcomes = pool.run(loops);
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|r| r.is_ok()));
        assert_eq!(hits.load(Ordering::Relaxed), 1 + 2 + 3 + 4 + 5);
    }

    struct FailLoop;
    impl OpenLoop for FailLoop {
        fn run_slice(&mut self, _budget: Duration) -> Result<LoopState> {
            Err(cohort_core::Error::resource(
                cohort_core::ErrorCode::Cancelled,
                "stop",
            ))
        }
    }

    #[test]
    fn test_failed_loop_reports_in_order() {
        let pool = WorkerPool::new(1, 1);
        let outcomes = pool.run(vec![FailLoop, FailLoop]);
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes[0].is_err());
    }
}

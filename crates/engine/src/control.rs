//! Query cancellation and deadlines
//!
//! Every open loop calls [`QueryControl::checkpoint`] between
//! entities. Cancellation is cooperative and observed within one
//! slice; on trip the partition discards its partial result and the
//! query fails with the transient error.

use cohort_core::error::{Error, ErrorCode, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Shared per-query control block.
#[derive(Debug)]
pub struct QueryControl {
    deadline: Option<Instant>,
    cancelled: AtomicBool,
}

impl QueryControl {
    /// Control with an optional deadline.
    pub fn new(deadline: Option<Instant>) -> Self {
        QueryControl {
            deadline,
            cancelled: AtomicBool::new(false),
        }
    }

    /// No deadline, never cancelled (tests, internal work).
    pub fn unbounded() -> Self {
        QueryControl::new(None)
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Has anyone cancelled?
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Slice checkpoint: fails with `Cancelled` or `DeadlineExceeded`.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(Error::resource(ErrorCode::Cancelled, "query cancelled"));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(Error::resource(
                    ErrorCode::DeadlineExceeded,
                    "query deadline passed",
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_cancel_trips_checkpoint() {
        let control = QueryControl::unbounded();
        assert!(control.checkpoint().is_ok());
        control.cancel();
        let err = control.checkpoint().unwrap_err();
        assert_eq!(err.code, ErrorCode::Cancelled);
        assert!(err.is_transient());
    }

    #[test]
    fn test_deadline_trips_checkpoint() {
        let control = QueryControl::new(Some(Instant::now() - Duration::from_millis(1)));
        let err = control.checkpoint().unwrap_err();
        assert_eq!(err.code, ErrorCode::DeadlineExceeded);
    }
}

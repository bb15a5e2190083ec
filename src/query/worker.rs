//! # Concurrency Manager
//!
//! Parallel per-record evaluation: `[0, N)` is partitioned into contiguous
//! ranges, one per worker, and workers run on scoped threads. The manager
//! holds a set-once error slot; the first error wins and every other worker
//! observes it cooperatively between records and aborts early. Cancellation
//! is observed the same way, and again by the caller once the workers have
//! joined.
//!
//! Worker count is capped by the record count and the configured CPU
//! budget. A budget of one, or a single record, short-circuits to an inline
//! sequential loop on the calling thread.

use crate::error::{QueryError, QueryResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation shared by every evaluator and executor entry
/// point of one session.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<CancellationInner>,
}

#[derive(Debug, Default)]
struct CancellationInner {
    cancelled: AtomicBool,
    cause: Mutex<String>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self, cause: &str) {
        *self.inner.cause.lock() = cause.to_string();
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Errors with ContextDone when cancellation has been requested.
    pub fn check(&self) -> QueryResult<()> {
        if self.is_cancelled() {
            Err(QueryError::ContextDone {
                cause: self.inner.cause.lock().clone(),
            })
        } else {
            Ok(())
        }
    }
}

pub struct TaskManager {
    total: usize,
    number: usize,
    has_error: AtomicBool,
    error: Mutex<Option<QueryError>>,
}

impl TaskManager {
    pub fn new(total: usize, cpu: usize) -> Self {
        Self {
            total,
            number: cpu.min(total).max(1),
            has_error: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    /// The contiguous index range assigned to one worker. Remainder records
    /// go to the trailing workers one each.
    pub fn record_range(&self, worker: usize) -> (usize, usize) {
        let base = self.total / self.number;
        let remainder = self.total % self.number;
        let extra_before = worker.saturating_sub(self.number - remainder);
        let start = worker * base + extra_before;
        let mut len = base;
        if self.number - remainder <= worker {
            len += 1;
        }
        (start, start + len)
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    /// Set-once: the first error wins, later ones are dropped.
    pub fn set_error(&self, err: QueryError) {
        let mut slot = self.error.lock();
        if slot.is_none() {
            *slot = Some(err);
            self.has_error.store(true, Ordering::SeqCst);
        }
    }

    pub fn take_error(&self) -> Option<QueryError> {
        self.error.lock().take()
    }
}

/// Runs `f` for every index in `[0, total)`, in parallel when the CPU
/// budget allows. `f` must only write to its own output slot.
pub fn run<F>(total: usize, cpu: usize, cancel: &CancellationToken, f: F) -> QueryResult<()>
where
    F: Fn(usize) -> QueryResult<()> + Sync,
{
    if total == 0 {
        return Ok(());
    }

    let manager = TaskManager::new(total, cpu);
    if manager.number() <= 1 {
        for i in 0..total {
            cancel.check()?;
            f(i)?;
        }
        return Ok(());
    }

    std::thread::scope(|scope| {
        for worker in 0..manager.number() {
            let manager = &manager;
            let f = &f;
            scope.spawn(move || {
                let (start, end) = manager.record_range(worker);
                for i in start..end {
                    if manager.has_error() || cancel.is_cancelled() {
                        break;
                    }
                    if let Err(err) = f(i) {
                        manager.set_error(err);
                        break;
                    }
                }
            });
        }
    });

    if let Some(err) = manager.take_error() {
        return Err(err);
    }
    cancel.check()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn ranges_partition_the_whole_input() {
        let manager = TaskManager::new(10, 3);
        assert_eq!(manager.number(), 3);
        let mut covered = Vec::new();
        for w in 0..manager.number() {
            let (start, end) = manager.record_range(w);
            covered.extend(start..end);
        }
        assert_eq!(covered, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn worker_count_is_capped_by_records() {
        assert_eq!(TaskManager::new(2, 8).number(), 2);
        assert_eq!(TaskManager::new(0, 8).number(), 1);
    }

    #[test]
    fn run_visits_every_index_once() {
        let counter = AtomicUsize::new(0);
        run(1000, 4, &CancellationToken::new(), |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1000);
    }

    #[test]
    fn first_error_wins() {
        let err = run(100, 4, &CancellationToken::new(), |i| {
            if i % 10 == 9 {
                Err(QueryError::Io {
                    message: format!("worker error {}", i),
                })
            } else {
                Ok(())
            }
        })
        .unwrap_err();
        assert!(matches!(err, QueryError::Io { .. }));
    }

    #[test]
    fn cancellation_surfaces_context_done() {
        let cancel = CancellationToken::new();
        cancel.cancel("test cause");
        let err = run(10, 2, &cancel, |_| Ok(())).unwrap_err();
        assert_eq!(
            err.to_string(),
            "query execution has been terminated: test cause"
        );
    }
}

//! Task dispatch and completion tracking.
//!
//! Partitions are spread across a fixed rayon pool; the pool's own
//! range-stealing balances load. The only synchronization point visible to
//! callers is [`UploadTicket::join`].

use crate::error::{Result, UploadError};
use crate::task::UploadTask;
use parking_lot::{Condvar, Mutex};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::Arc;

/// Split `[0, count)` into consecutive chunks of `granularity` partitions.
///
/// The last chunk may be short. With granularity 1 every partition is its
/// own chunk.
pub(crate) fn split_ranges(count: usize, granularity: usize) -> Vec<Range<usize>> {
    debug_assert!(count > 0);
    let granularity = granularity.max(1);

    (0..count)
        .step_by(granularity)
        .map(|start| start..count.min(start + granularity))
        .collect()
}

#[derive(Debug)]
struct TicketInner {
    result: Mutex<Option<Result<()>>>,
    completed: Condvar,
}

/// Handle to an in-flight upload task.
///
/// The destination resource must not be read or used until [`join`]
/// returns `Ok`. Consuming `self` makes the one-joiner-per-task rule a
/// type-level guarantee.
///
/// [`join`]: UploadTicket::join
#[derive(Debug)]
pub struct UploadTicket {
    inner: Arc<TicketInner>,
}

impl UploadTicket {
    fn new() -> (Self, Arc<TicketInner>) {
        let inner = Arc::new(TicketInner {
            result: Mutex::new(None),
            completed: Condvar::new(),
        });
        (
            Self {
                inner: inner.clone(),
            },
            inner,
        )
    }

    /// Block until every partition of the task has finished.
    ///
    /// Returns the first partition error if any chunk failed; the
    /// destination contents are unspecified in that case.
    pub fn join(self) -> Result<()> {
        let mut result = self.inner.result.lock();
        while result.is_none() {
            self.inner.completed.wait(&mut result);
        }
        result.take().unwrap_or(Ok(()))
    }
}

impl TicketInner {
    fn complete(&self, outcome: Result<()>) {
        *self.result.lock() = Some(outcome);
        self.completed.notify_all();
    }
}

/// Dispatch a task onto the worker pool and return its ticket.
///
/// Every partition runs to completion even when another partition has
/// already failed (there is no cancellation); the ticket records the first
/// error encountered.
pub(crate) fn dispatch(pool: &rayon::ThreadPool, task: Arc<dyn UploadTask>) -> UploadTicket {
    let (ticket, inner) = UploadTicket::new();
    let ranges = split_ranges(task.partition_count(), task.min_granularity());

    pool.spawn(move || {
        let first_error: Mutex<Option<UploadError>> = Mutex::new(None);

        ranges.into_par_iter().for_each(|range| {
            let outcome = match rayon::current_thread_index() {
                Some(worker) => task.run(range, worker),
                None => Err(UploadError::OutsideWorkerPool),
            };
            if let Err(e) = outcome {
                tracing::error!("Upload partition failed: {e}");
                first_error.lock().get_or_insert(e);
            }
        });

        let outcome = match first_error.into_inner() {
            Some(e) => Err(e),
            None => Ok(()),
        };
        // Release the task (and whatever engine state it holds) before
        // signaling, so a joiner that tears down right after `join` never
        // observes a lingering task reference.
        drop(task);
        inner.complete(outcome);
    });

    ticket
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingTask {
        partitions: usize,
        granularity: usize,
        worker_ceiling: usize,
        executed: Mutex<Vec<Range<usize>>>,
        runs: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl RecordingTask {
        fn new(partitions: usize, granularity: usize, worker_ceiling: usize) -> Self {
            Self {
                partitions,
                granularity,
                worker_ceiling,
                executed: Mutex::new(Vec::new()),
                runs: AtomicUsize::new(0),
                fail_on: None,
            }
        }
    }

    impl UploadTask for RecordingTask {
        fn partition_count(&self) -> usize {
            self.partitions
        }

        fn min_granularity(&self) -> usize {
            self.granularity
        }

        fn run(&self, range: Range<usize>, worker: usize) -> Result<()> {
            assert!(worker < self.worker_ceiling);
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.is_some_and(|start| start == range.start) {
                return Err(UploadError::InvalidUpload("synthetic failure".to_string()));
            }
            self.executed.lock().push(range);
            Ok(())
        }
    }

    fn test_pool(threads: usize) -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .build()
            .unwrap()
    }

    #[test]
    fn split_ranges_granularity_one() {
        let ranges = split_ranges(3, 1);
        assert_eq!(ranges, vec![0..1, 1..2, 2..3]);
    }

    #[test]
    fn split_ranges_row_scenario() {
        // 300 rows at granularity 150: exactly two row ranges
        let ranges = split_ranges(300, 150);
        assert_eq!(ranges, vec![0..150, 150..300]);
    }

    #[test]
    fn split_ranges_short_tail() {
        let ranges = split_ranges(10, 4);
        assert_eq!(ranges, vec![0..4, 4..8, 8..10]);
    }

    #[test]
    fn every_partition_runs_exactly_once() {
        for threads in [1, 2, 4] {
            let pool = test_pool(threads);
            let task = Arc::new(RecordingTask::new(37, 5, threads));

            dispatch(&pool, task.clone()).join().unwrap();

            let mut executed = task.executed.lock().clone();
            executed.sort_by_key(|r| r.start);
            assert_eq!(executed, split_ranges(37, 5));
        }
    }

    #[test]
    fn join_returns_first_error_and_remaining_partitions_still_run() {
        let pool = test_pool(2);
        let mut task = RecordingTask::new(8, 1, 2);
        task.fail_on = Some(3);
        let task = Arc::new(task);

        let err = dispatch(&pool, task.clone()).join().unwrap_err();
        assert!(matches!(err, UploadError::InvalidUpload(_)));

        // No cancellation: all 8 chunks executed despite the failure
        assert_eq!(task.runs.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn task_is_released_before_join_returns() {
        struct HoldingTask {
            _held: Arc<()>,
        }

        impl UploadTask for HoldingTask {
            fn partition_count(&self) -> usize {
                4
            }

            fn run(&self, _range: Range<usize>, _worker: usize) -> Result<()> {
                Ok(())
            }
        }

        // `held` stands in for the shared engine state every real task
        // carries: once join returns, destroy must be able to see a unique
        // reference, so the dispatched task cannot outlive its ticket.
        let pool = test_pool(2);
        let held = Arc::new(());

        for _ in 0..100 {
            let task = Arc::new(HoldingTask { _held: held.clone() });
            dispatch(&pool, task).join().unwrap();
            assert_eq!(
                Arc::strong_count(&held),
                1,
                "task still alive after join returned"
            );
        }
    }

    #[test]
    fn concurrent_tickets_complete_independently() {
        let pool = test_pool(4);
        let tasks: Vec<_> = (0..4)
            .map(|_| Arc::new(RecordingTask::new(16, 2, 4)))
            .collect();

        let tickets: Vec<_> = tasks
            .iter()
            .map(|task| dispatch(&pool, task.clone() as Arc<dyn UploadTask>))
            .collect();

        for ticket in tickets {
            ticket.join().unwrap();
        }
        for task in &tasks {
            assert_eq!(task.runs.load(Ordering::SeqCst), 8);
        }
    }
}

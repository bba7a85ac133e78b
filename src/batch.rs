//! Batch execution of client sessions with joint-completion tracking.
//!
//! [`CompletionBarrier`] releases a waiting driver thread once a known count
//! of concurrent operations has finished. The increment and the
//! compare-and-notify happen under the same lock the driver waits on, so a
//! completion can never slip between the driver's check and its wait.
//!
//! [`BatchCoordinator`] submits N independent tasks to a bounded worker pool
//! (tasks queue when the pool is smaller than N), runs one [`ClientSession`]
//! per task, and counts every task toward the barrier whether it succeeded,
//! failed, or panicked. A failing session is logged and never poisons the
//! batch.

use crate::codec::Message;
use crate::error::{Error, Result};
use crate::net::{DriverHandle, Endpoint};
use crate::session::ClientSession;
use crossbeam_channel::unbounded;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Releases a waiter once `total` completions have been recorded.
pub struct CompletionBarrier {
    total: usize,
    completed: Mutex<usize>,
    done: Condvar,
}

impl CompletionBarrier {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: Mutex::new(0),
            done: Condvar::new(),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        *self.completed.lock().expect("barrier lock poisoned")
    }

    /// Record one completion. The notify happens under the lock, on the
    /// completion that reaches the total.
    pub fn complete(&self) {
        let mut completed = self.completed.lock().expect("barrier lock poisoned");
        *completed += 1;
        debug_assert!(*completed <= self.total, "more completions than tasks");
        if *completed == self.total {
            self.done.notify_all();
        }
    }

    /// A guard that records the completion when dropped, so a panicking
    /// task still counts.
    pub fn guard(self: &Arc<Self>) -> CompletionGuard {
        CompletionGuard {
            barrier: Arc::clone(self),
        }
    }

    /// Block until all completions arrive. Returns immediately when
    /// `total == 0` or everything already completed.
    pub fn wait(&self) {
        let mut completed = self.completed.lock().expect("barrier lock poisoned");
        while *completed < self.total {
            completed = self
                .done
                .wait(completed)
                .expect("barrier lock poisoned");
        }
    }

    /// Like [`wait`](Self::wait) but bounded; a lost task cannot hang the
    /// driver forever.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline_err = || Error::Timeout {
            op: "batch wait",
            millis: timeout.as_millis() as u64,
        };

        let mut completed = self.completed.lock().expect("barrier lock poisoned");
        while *completed < self.total {
            let (guard, wait_result) = self
                .done
                .wait_timeout(completed, timeout)
                .expect("barrier lock poisoned");
            completed = guard;
            if wait_result.timed_out() && *completed < self.total {
                return Err(deadline_err());
            }
        }
        Ok(())
    }
}

/// Counts its barrier exactly once, on drop.
pub struct CompletionGuard {
    barrier: Arc<CompletionBarrier>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.barrier.complete();
    }
}

/// One unit of batch work: consumed by exactly one worker, terminal after
/// success or failure.
struct BatchTask {
    id: usize,
    endpoint: Endpoint,
    payload: Message,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    pub total: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.total - self.failed
    }
}

/// Runs N sessions concurrently and blocks the caller until all N complete.
pub struct BatchCoordinator {
    handle: DriverHandle,
    workers: usize,
    wait_timeout: Duration,
}

impl BatchCoordinator {
    pub fn new(handle: DriverHandle, workers: usize, wait_timeout: Duration) -> Self {
        Self {
            handle,
            workers: workers.max(1),
            wait_timeout,
        }
    }

    /// Run `n` sessions against `endpoint`, each sending
    /// `message_factory(task_id)` (task ids are `0..n`). Blocks until every
    /// task has completed, successfully or not, and reports the failure
    /// count. Individual failures are logged, never fatal.
    pub fn run_batch<F>(&self, endpoint: &Endpoint, n: usize, message_factory: F) -> Result<BatchReport>
    where
        F: Fn(usize) -> String,
    {
        let barrier = Arc::new(CompletionBarrier::new(n));
        let failed = Arc::new(AtomicUsize::new(0));

        let (task_tx, task_rx) = unbounded::<BatchTask>();
        for id in 0..n {
            let payload = Message::from(message_factory(id).as_str());
            task_tx
                .send(BatchTask {
                    id,
                    endpoint: endpoint.clone(),
                    payload,
                })
                .expect("task queue open while filling");
        }
        drop(task_tx);

        let worker_count = self.workers.min(n);
        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let task_rx = task_rx.clone();
            let barrier = Arc::clone(&barrier);
            let failed = Arc::clone(&failed);
            let handle = self.handle.clone();

            let worker = std::thread::Builder::new()
                .name(format!("batch-{worker_id}"))
                .spawn(move || {
                    while let Ok(task) = task_rx.recv() {
                        // Dropped at the end of the iteration; counts the
                        // task even if the session panics.
                        let _completion = barrier.guard();
                        let session = ClientSession::new(handle.clone());
                        match session.run(&task.endpoint, &task.payload.as_text()) {
                            Ok(()) => debug!(task = task.id, "session completed"),
                            Err(e) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                warn!(task = task.id, error = %e, "session failed");
                            }
                        }
                    }
                })
                .expect("failed to spawn batch worker");
            workers.push(worker);
        }
        drop(task_rx);

        barrier.wait_timeout(self.wait_timeout)?;
        for worker in workers {
            let _ = worker.join();
        }

        let report = BatchReport {
            total: n,
            failed: failed.load(Ordering::Relaxed),
        };
        info!(
            total = report.total,
            succeeded = report.succeeded(),
            failed = report.failed,
            "batch completed"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_barrier_zero_tasks_returns_immediately() {
        let barrier = CompletionBarrier::new(0);
        // Must not block at all.
        barrier.wait();
        barrier.wait_timeout(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn test_barrier_completions_before_wait() {
        let barrier = Arc::new(CompletionBarrier::new(3));
        for _ in 0..3 {
            barrier.complete();
        }
        // All signals arrived before the driver started waiting.
        barrier.wait();
        assert_eq!(barrier.completed(), 3);
    }

    #[test]
    fn test_barrier_completions_after_wait_starts() {
        let barrier = Arc::new(CompletionBarrier::new(2));
        let b = Arc::clone(&barrier);
        let completer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            b.complete();
            thread::sleep(Duration::from_millis(50));
            b.complete();
        });
        barrier.wait();
        assert_eq!(barrier.completed(), 2);
        completer.join().unwrap();
    }

    #[test]
    fn test_barrier_stress_no_missed_wakeup() {
        // Many completer threads racing the waiter; a missed notify would
        // hang the wait_timeout below.
        const TASKS: usize = 10_000;
        const THREADS: usize = 8;

        let barrier = Arc::new(CompletionBarrier::new(TASKS));
        let mut completers = Vec::new();
        for t in 0..THREADS {
            let b = Arc::clone(&barrier);
            completers.push(thread::spawn(move || {
                let share = TASKS / THREADS + usize::from(t < TASKS % THREADS);
                for _ in 0..share {
                    b.complete();
                }
            }));
        }

        barrier.wait_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(barrier.completed(), TASKS);
        for c in completers {
            c.join().unwrap();
        }
    }

    #[test]
    fn test_barrier_wait_timeout_expires_when_tasks_lost() {
        let barrier = CompletionBarrier::new(1);
        let err = barrier.wait_timeout(Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_guard_counts_on_panic() {
        let barrier = Arc::new(CompletionBarrier::new(1));
        let b = Arc::clone(&barrier);
        let t = thread::spawn(move || {
            let _guard = b.guard();
            panic!("task blew up");
        });
        assert!(t.join().is_err());
        barrier.wait_timeout(Duration::from_secs(1)).unwrap();
    }
}

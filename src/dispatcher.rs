//! Worker pool that runs message handlers off the I/O threads.
//!
//! I/O threads hand decoded messages to the dispatcher and return to the
//! poll loop immediately; application-level handling (logging, or whatever a
//! caller installs) runs on a fixed set of dispatch workers. The queue is
//! bounded, with the overflow policy chosen in config: `Block` applies
//! backpressure to the producer, `Drop` discards the message and counts it.
//!
//! A failing handler never kills its worker and never touches the connection
//! that delivered the message: the failure is logged per task and the worker
//! moves on.

use crate::codec::Message;
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Deserialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// What to do when the dispatch queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Block the producer until a slot frees up.
    Block,
    /// Discard the message and increment the drop counter.
    Drop,
}

/// Receives decoded messages from the transport.
pub trait MessageHandler: Send + Sync + 'static {
    fn on_message(&self, conn_id: usize, message: Message) -> Result<()>;
}

impl<F> MessageHandler for F
where
    F: Fn(usize, Message) -> Result<()> + Send + Sync + 'static,
{
    fn on_message(&self, conn_id: usize, message: Message) -> Result<()> {
        self(conn_id, message)
    }
}

/// Default handler: log each received payload.
pub struct LogHandler;

impl MessageHandler for LogHandler {
    fn on_message(&self, conn_id: usize, message: Message) -> Result<()> {
        info!(conn_id, text = %message, "received");
        Ok(())
    }
}

struct Task {
    conn_id: usize,
    message: Message,
}

/// Cloneable submitter handed to I/O threads.
#[derive(Clone)]
pub struct DispatcherHandle {
    tx: Sender<Task>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl DispatcherHandle {
    /// Enqueue a message for handling. Under `Drop` this never blocks; under
    /// `Block` a full queue stalls the caller until a worker catches up.
    pub fn submit(&self, conn_id: usize, message: Message) {
        match self.policy {
            OverflowPolicy::Block => {
                // Only fails if the pool has shut down; late messages are
                // dropped with the rest.
                if self.tx.send(Task { conn_id, message }).is_err() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            OverflowPolicy::Drop => match self.tx.try_send(Task { conn_id, message }) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                    let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    warn!(conn_id, total_dropped = total, "dispatch queue full, message dropped");
                }
            },
        }
    }
}

/// Fixed-size pool of dispatch workers over a bounded queue.
#[derive(Debug)]
pub struct Dispatcher {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
    policy: OverflowPolicy,
    dropped: Arc<AtomicU64>,
}

impl Dispatcher {
    pub fn new(
        workers: usize,
        queue_capacity: usize,
        policy: OverflowPolicy,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        let (tx, rx) = bounded::<Task>(queue_capacity);
        let mut handles = Vec::with_capacity(workers);

        // Worker names come from a per-pool sequence, nothing process-wide.
        for worker_id in 0..workers.max(1) {
            let rx = rx.clone();
            let handler = Arc::clone(&handler);
            let handle = std::thread::Builder::new()
                .name(format!("dispatch-{worker_id}"))
                .spawn(move || worker_loop(worker_id, rx, handler))
                .expect("failed to spawn dispatch worker");
            handles.push(handle);
        }

        Self {
            tx: Some(tx),
            workers: handles,
            policy,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            tx: self.tx.as_ref().expect("dispatcher already shut down").clone(),
            policy: self.policy,
            dropped: Arc::clone(&self.dropped),
        }
    }

    /// Messages discarded under the `Drop` overflow policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Drain queued tasks, then stop the workers. Producers must have
    /// released their handles for the drain to terminate.
    pub fn shutdown(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > 0 {
            warn!(dropped, "dispatcher shut down with dropped messages");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // No join here: outstanding handles elsewhere may still feed the
        // queue, and the workers exit on their own once the last sender
        // drops. The explicit shutdown() path is the one that joins.
        self.tx.take();
    }
}

fn worker_loop(worker_id: usize, rx: Receiver<Task>, handler: Arc<dyn MessageHandler>) {
    debug!(worker = worker_id, "dispatch worker started");
    // recv() drains remaining tasks after the last sender drops, then errors.
    while let Ok(task) = rx.recv() {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            handler.on_message(task.conn_id, task.message)
        }));
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let e = match e {
                    Error::Handler(_) => e,
                    other => Error::Handler(other.to_string()),
                };
                warn!(worker = worker_id, conn_id = task.conn_id, error = %e, "handler failed");
            }
            Err(_) => {
                warn!(
                    worker = worker_id,
                    conn_id = task.conn_id,
                    "handler panicked, worker continues"
                );
            }
        }
    }
    debug!(worker = worker_id, "dispatch worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::TextCodec;
    use std::sync::Mutex;
    use std::time::Duration;

    fn collect_handler(sink: Arc<Mutex<Vec<(usize, String)>>>) -> Arc<dyn MessageHandler> {
        Arc::new(move |conn_id: usize, message: Message| -> Result<()> {
            sink.lock().unwrap().push((conn_id, message.to_string()));
            Ok(())
        })
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("condition not reached in time");
    }

    #[test]
    fn test_submit_reaches_handler() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(2, 16, OverflowPolicy::Block, collect_handler(sink.clone()));

        let handle = dispatcher.handle();
        handle.submit(7, TextCodec::decode(b"hello"));

        wait_for(|| sink.lock().unwrap().len() == 1);
        assert_eq!(sink.lock().unwrap()[0], (7, "hello".to_string()));

        drop(handle);
        dispatcher.shutdown();
    }

    #[test]
    fn test_failing_handler_does_not_stop_subsequent_tasks() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let sink2 = sink.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |conn_id: usize, message: Message| -> Result<()> {
            if message.as_bytes() == b"bad" {
                return Err(Error::Handler("refused".into()));
            }
            sink2.lock().unwrap().push((conn_id, message.to_string()));
            Ok(())
        });

        let dispatcher = Dispatcher::new(1, 16, OverflowPolicy::Block, handler);
        let handle = dispatcher.handle();
        handle.submit(1, TextCodec::decode(b"bad"));
        handle.submit(1, TextCodec::decode(b"good"));

        wait_for(|| sink.lock().unwrap().len() == 1);
        assert_eq!(sink.lock().unwrap()[0].1, "good");

        drop(handle);
        dispatcher.shutdown();
    }

    #[test]
    fn test_panicking_handler_does_not_kill_worker() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let sink2 = sink.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |conn_id: usize, message: Message| -> Result<()> {
            if message.as_bytes() == b"boom" {
                panic!("handler blew up");
            }
            sink2.lock().unwrap().push((conn_id, message.to_string()));
            Ok(())
        });

        let dispatcher = Dispatcher::new(1, 16, OverflowPolicy::Block, handler);
        let handle = dispatcher.handle();
        handle.submit(1, TextCodec::decode(b"boom"));
        handle.submit(1, TextCodec::decode(b"after"));

        wait_for(|| sink.lock().unwrap().len() == 1);
        assert_eq!(sink.lock().unwrap()[0].1, "after");

        drop(handle);
        dispatcher.shutdown();
    }

    #[test]
    fn test_drop_policy_counts_overflow() {
        // One worker parked on a slow task, capacity 1: the third submit
        // cannot fit and must be dropped.
        let gate = Arc::new(Mutex::new(()));
        let guard = gate.lock().unwrap();

        let gate2 = gate.clone();
        let handler: Arc<dyn MessageHandler> = Arc::new(move |_: usize, _: Message| -> Result<()> {
            let _unused = gate2.lock().unwrap();
            Ok(())
        });

        let dispatcher = Dispatcher::new(1, 1, OverflowPolicy::Drop, handler);
        let handle = dispatcher.handle();
        handle.submit(1, TextCodec::decode(b"first"));
        // Give the worker time to pick up the first task and block.
        std::thread::sleep(Duration::from_millis(50));
        handle.submit(1, TextCodec::decode(b"queued"));
        handle.submit(1, TextCodec::decode(b"overflow"));

        wait_for(|| dispatcher.dropped() >= 1);
        drop(guard);

        drop(handle);
        dispatcher.shutdown();
    }

    #[test]
    fn test_shutdown_drains_queued_tasks() {
        let sink = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = Dispatcher::new(1, 64, OverflowPolicy::Block, collect_handler(sink.clone()));

        let handle = dispatcher.handle();
        for i in 0..20 {
            handle.submit(i, TextCodec::decode(format!("m{i}").as_bytes()));
        }
        drop(handle);
        dispatcher.shutdown();

        assert_eq!(sink.lock().unwrap().len(), 20);
    }
}

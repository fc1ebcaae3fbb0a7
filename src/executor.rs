//! Execution of delegated handshake work off the pipeline threads.
//!
//! Delegated tasks are CPU-bound (certificate verification, key
//! computation) and must not run inside a pipeline's serialized work
//! function, where they would stall both directions. The pump only needs
//! a "run this somewhere else" primitive, so the injection point is a
//! one-method trait; any scheduler can stand behind it.
//!
//! [`TaskPool`] is the provided implementation: a fixed number of worker
//! tasks fed over channels with round-robin distribution, so a burst of
//! handshakes does not spawn a task per job and compete with the rest of
//! the runtime for scheduler time.

use log::debug;
use tokio::sync::mpsc;

use std::sync::atomic::{AtomicUsize, Ordering};

/// A unit of work to run off the pipeline threads.
pub type Job = Box<dyn FnOnce() + Send>;

/// Anything that can run a [`Job`] on some other thread, eventually.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, job: Job);
}

/// A fixed pool of tokio worker tasks processing jobs in submission
/// order per worker, round-robin across workers.
pub struct TaskPool {
    senders: Vec<mpsc::UnboundedSender<Job>>,
    /// Counter for round-robin distribution
    next_worker: AtomicUsize,
}

impl TaskPool {
    /// Create a pool with `num_workers` workers. Must be called from
    /// within a tokio runtime.
    pub fn new(num_workers: usize) -> Self {
        assert!(num_workers > 0, "must have at least one worker");

        let mut senders = Vec::with_capacity(num_workers);
        for worker_id in 0..num_workers {
            let (tx, rx) = mpsc::unbounded_channel::<Job>();
            senders.push(tx);
            tokio::spawn(worker_loop(worker_id, rx));
        }

        Self {
            senders,
            next_worker: AtomicUsize::new(0),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.senders.len()
    }
}

impl TaskExecutor for TaskPool {
    fn execute(&self, job: Job) {
        let worker_idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.senders.len();
        if self.senders[worker_idx].send(job).is_err() {
            debug!("task pool worker {worker_idx} is gone, dropping job");
        }
    }
}

async fn worker_loop(worker_id: usize, mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        job();
        // Handshake jobs can compute for a while; give other tasks a
        // chance between jobs.
        tokio::task::yield_now().await;
    }
    debug!("task pool worker {worker_id} shutting down: channel closed");
}

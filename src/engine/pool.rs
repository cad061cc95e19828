//! Bounded worker pool for judgment dispatch.
//!
//! Pairwise judgment evaluation is an embarrassingly parallel batch: every
//! job is independent and only the merged result matters. The pool bounds
//! concurrency so a batch respects backend rate limits, and the bounded
//! queue applies backpressure to the submitting thread instead of growing
//! without limit.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of named worker threads draining a bounded job queue.
///
/// Dropping the pool closes the queue; workers drain what was accepted and
/// exit, and the drop blocks until they have joined.
pub(crate) struct WorkerPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Starts `workers` threads with a queue of `queue_capacity` jobs.
    pub(crate) fn start(name: &'static str, workers: usize, queue_capacity: usize) -> Self {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let thread_name = format!("{name}-{idx}");
            let handle = thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        job();
                    }
                })
                .expect("failed to spawn crosstalk worker");
            handles.push(handle);
        }

        Self {
            tx: Some(tx),
            workers: handles,
        }
    }

    /// Submits a job, blocking while the queue is full.
    ///
    /// Returns `false` if the pool has already shut down.
    pub(crate) fn submit<F>(&self, job: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.tx {
            Some(tx) => tx.send(Box::new(job)).is_ok(),
            None => false,
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Close the queue: workers drain accepted jobs then exit.
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_every_submitted_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::start("test-pool", 4, 8);
            for _ in 0..100 {
                let counter = Arc::clone(&counter);
                assert!(pool.submit(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
            // Drop joins the workers after the queue drains.
        }
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn zero_workers_clamps_to_one() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = WorkerPool::start("test-pool", 0, 0);
            let counter = Arc::clone(&counter);
            assert!(pool.submit(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}

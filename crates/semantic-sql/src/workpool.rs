//! Small fire-and-forget worker pool backing the cache's L2 writer (C10) and
//! the prewarm sidecar's per-spec value fan-out (C13).
//!
//! Every submission captures the caller's context (C15) so it survives the
//! thread-pool boundary — without this, a cache write queued from inside a
//! dispatcher call would lose track of which caller triggered it.

use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::caller_context;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Sender<Job>,
}

impl WorkerPool {
    pub fn new(name: &'static str, workers: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        for idx in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("{name}-{idx}"))
                .spawn(move || loop {
                    let job = {
                        let rx = receiver.lock().unwrap();
                        rx.recv()
                    };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                })
                .expect("failed to spawn worker thread");
        }
        WorkerPool { sender }
    }

    /// Submits `job` for background execution, re-installing the submitting
    /// thread's caller context inside the worker before running it.
    pub fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let captured = caller_context::capture();
        let _ = self.sender.send(Box::new(move || {
            caller_context::run_with_captured(captured, job);
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn submitted_jobs_run() {
        let pool = WorkerPool::new("test-pool", 2);
        let (tx, rx) = channel();
        pool.submit(move || {
            tx.send(42).unwrap();
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 42);
    }

    #[test]
    fn caller_context_crosses_the_pool_boundary() {
        let pool = WorkerPool::new("test-pool-ctx", 1);
        let (tx, rx) = channel();
        caller_context::with_caller("pool-caller", None, || {
            pool.submit(move || {
                tx.send(caller_context::get_caller_id()).unwrap();
            });
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), Some("pool-caller".to_string()));
    }
}

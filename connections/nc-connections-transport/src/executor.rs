//! A single-threaded serial executor: a worker thread draining a bounded
//! task queue in submission order. This is the "PCP thread" / "BWU serial
//! executor" / "EndpointManager serial executor" primitive named throughout
//! spec §5 — every manager that needs a total order over its own state gets
//! one of these instead of a shared lock.

use crossbeam_channel::{bounded, Sender};
use std::thread::JoinHandle;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted closures on a single background thread, in submission
/// order. Dropping the executor (or calling [`SerialExecutor::shutdown`])
/// closes the queue and joins the worker; tasks submitted after shutdown are
/// rejected, matching the "no task submitted after `stop` executes"
/// invariant in spec §5.
pub struct SerialExecutor {
    name: &'static str,
    sender: Option<Sender<Task>>,
    worker: Option<JoinHandle<()>>,
}

impl SerialExecutor {
    pub fn new(name: &'static str) -> Self {
        let (sender, receiver) = bounded::<Task>(1024);
        let worker = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in receiver {
                    task();
                }
            })
            .expect("failed to spawn serial executor thread");
        Self {
            name,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Submits a task; returns `false` if the executor has already been
    /// shut down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match &self.sender {
            Some(sender) => sender.send(Box::new(task)).is_ok(),
            None => false,
        }
    }

    /// Submits a task and blocks until it has run, returning its result.
    pub fn submit_and_wait<T: Send + 'static>(&self, task: impl FnOnce() -> T + Send + 'static) -> Option<T> {
        let (tx, rx) = bounded(1);
        let submitted = self.submit(move || {
            let _ = tx.send(task());
        });
        if !submitted {
            return None;
        }
        rx.recv().ok()
    }

    pub fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            drop(sender);
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(executor = self.name, "serial executor thread panicked");
            }
        }
    }
}

impl Drop for SerialExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tasks_run_in_submission_order() {
        let executor = SerialExecutor::new("test-executor");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..10 {
            let order = order.clone();
            executor.submit(move || order.lock().unwrap().push(i));
        }
        let result = executor.submit_and_wait(|| ()).unwrap();
        let _ = result;
        assert_eq!(*order.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let mut executor = SerialExecutor::new("test-executor-2");
        executor.shutdown();
        let counter = Arc::new(AtomicUsize::new(0));
        let counter2 = counter.clone();
        let accepted = executor.submit(move || {
            counter2.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!accepted);
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

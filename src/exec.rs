//! Background task executor
//!
//! A fixed pool of worker threads fed through a channel. Flush and
//! compaction work is submitted here so writers never run maintenance on
//! their own thread.

use crate::{Result, StrataError};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::thread::JoinHandle;
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Handle to a submitted task; join it to observe the outcome.
pub struct TaskHandle {
    receiver: Receiver<Result<()>>,
}

impl TaskHandle {
    /// Block until the task finished and return its result.
    pub fn join(self) -> Result<()> {
        self.receiver
            .recv()
            .map_err(|_| StrataError::Internal("task executor shut down".into()))?
    }
}

/// Bounded worker pool for background maintenance tasks.
pub struct TaskExecutor {
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TaskExecutor {
    pub fn new(threads: usize) -> Self {
        let (sender, receiver) = unbounded::<Task>();
        let mut workers = Vec::with_capacity(threads);
        for worker in 0..threads {
            let receiver: Receiver<Task> = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(format!("strata-worker-{}", worker))
                .spawn(move || {
                    while let Ok(task) = receiver.recv() {
                        task();
                    }
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        }
    }

    /// Submit a task. Its result is observable through the returned
    /// handle; an unobserved failure is logged.
    pub fn execute_async<F>(&self, name: &'static str, task: F) -> Result<TaskHandle>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let (result_sender, result_receiver) = bounded(1);
        let wrapped: Task = Box::new(move || {
            debug!(task = name, "background task started");
            let result = task();
            if let Err(e) = &result {
                error!(task = name, error = %e, "background task failed");
            }
            let _ = result_sender.send(result);
        });

        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(sender) => {
                sender
                    .send(wrapped)
                    .map_err(|_| StrataError::Closed)?;
                Ok(TaskHandle {
                    receiver: result_receiver,
                })
            }
            None => Err(StrataError::Closed),
        }
    }

    /// Stop accepting tasks, drain the queue and join all workers.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            let _ = worker.join();
        }
    }
}

impl Drop for TaskExecutor {
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
    fn test_tasks_run_and_join() {
        let executor = TaskExecutor::new(2);
        let counter = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let counter = Arc::clone(&counter);
            handles.push(
                executor
                    .execute_async("count", move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap(),
            );
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_failure_is_reported() {
        let executor = TaskExecutor::new(1);
        let handle = executor
            .execute_async("fail", || Err(StrataError::Internal("boom".into())))
            .unwrap();
        assert!(matches!(handle.join(), Err(StrataError::Internal(_))));
    }

    #[test]
    fn test_shutdown_rejects_new_tasks() {
        let executor = TaskExecutor::new(1);
        executor.shutdown();
        assert!(matches!(
            executor.execute_async("late", || Ok(())),
            Err(StrataError::Closed)
        ));
    }
}

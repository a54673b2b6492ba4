//! Fixed-size worker pool with a bounded job queue.
//!
//! Requests are executed by long-lived workers consuming a FIFO queue;
//! submission awaits once the queue is full, which is the backpressure
//! point for request handlers. Jobs must not take the pool down: each one
//! runs under `catch_unwind` and a panic is logged, not propagated.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::AppError;

/// Queue capacity per worker.
const QUEUE_MULTIPLIER: usize = 2;

/// A unit of work. Results travel through channels captured by the job.
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Default worker count: twice the available parallelism, at least one.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_mul(2)
        .max(1)
}

/// Fixed pool of workers draining a bounded queue.
pub struct WorkerPool {
    tx: mpsc::Sender<Job>,
    quit: watch::Sender<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `workers` workers (0 selects the default size) over a queue of
    /// `workers * 2` slots.
    pub fn new(workers: usize) -> Self {
        let workers = if workers == 0 {
            default_workers()
        } else {
            workers
        };

        let (tx, rx) = mpsc::channel::<Job>(workers * QUEUE_MULTIPLIER);
        let (quit, _) = watch::channel(false);
        let rx = Arc::new(Mutex::new(rx));

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            let rx = Arc::clone(&rx);
            let mut quit_rx = quit.subscribe();
            handles.push(tokio::spawn(async move {
                loop {
                    let job = tokio::select! {
                        job = async { rx.lock().await.recv().await } => match job {
                            Some(job) => job,
                            None => break,
                        },
                        _ = quit_rx.changed() => break,
                    };

                    if let Err(panic) = AssertUnwindSafe(job).catch_unwind().await {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| (*s).to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(worker = id, panic = %message, "Worker panic recovered");
                    }
                }
                debug!(worker = id, "Worker exited");
            }));
        }

        Self {
            tx,
            quit,
            handles: std::sync::Mutex::new(handles),
        }
    }

    /// Enqueue a job, awaiting while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<(), AppError> {
        self.tx
            .send(job)
            .await
            .map_err(|_| AppError::Internal("worker pool is stopped".to_string()))
    }

    /// Signal quit and wait for every worker to exit. Queued jobs that no
    /// worker has picked up are dropped.
    pub async fn stop(&self) {
        let _ = self.quit.send(true);
        let handles: Vec<_> = self
            .handles
            .lock()
            .expect("pool handle lock poisoned")
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_default_workers_positive() {
        assert!(default_workers() >= 1);
    }

    #[tokio::test]
    async fn test_jobs_execute() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));

        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.submit(Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .await
            .unwrap();
        }

        // Give workers time to drain.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_jobs_run_concurrently() {
        let pool = WorkerPool::new(4);
        let (tx, mut rx) = mpsc::channel::<u32>(4);

        // Four jobs that each wait for the others to have started would
        // deadlock on a single worker; with four they all finish.
        let barrier = Arc::new(tokio::sync::Barrier::new(4));
        for i in 0..4 {
            let barrier = Arc::clone(&barrier);
            let tx = tx.clone();
            pool.submit(Box::pin(async move {
                barrier.wait().await;
                let _ = tx.send(i).await;
            }))
            .await
            .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(
                tokio::time::timeout(Duration::from_secs(2), rx.recv())
                    .await
                    .expect("jobs deadlocked")
                    .unwrap(),
            );
        }
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_panic_is_recovered() {
        let pool = WorkerPool::new(1);
        let counter = Arc::new(AtomicU32::new(0));

        pool.submit(Box::pin(async {
            panic!("job exploded");
        }))
        .await
        .unwrap();

        // The pool keeps serving after the panic.
        let c = Arc::clone(&counter);
        pool.submit(Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_joins_workers() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicU32::new(0));

        let c = Arc::clone(&counter);
        pool.submit(Box::pin(async move {
            c.fetch_add(1, Ordering::SeqCst);
        }))
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // Submissions after stop may still enqueue (the channel lives), but
        // no worker will run them; stopping twice is harmless.
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_bounded_queue_applies_backpressure() {
        // One busy worker, queue of 2: the fourth submit must wait.
        let pool = Arc::new(WorkerPool::new(1));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        pool.submit(Box::pin(async move {
            let _ = release_rx.await;
        }))
        .await
        .unwrap();
        pool.submit(Box::pin(async {})).await.unwrap();
        pool.submit(Box::pin(async {})).await.unwrap();

        let blocked = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.submit(Box::pin(async {})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        release_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("submit stayed blocked")
            .unwrap()
            .unwrap();
    }
}

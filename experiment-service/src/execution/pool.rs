// Worker Pool
// Fixed set of tokio workers draining a bounded queue of experiment jobs

use crate::config::PoolConfig;

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A unit of work, typically one execution segment of an experiment
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("execution queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("worker pool is shut down")]
    Closed,
}

/// Runs at most `workers` jobs at once; further jobs wait in a bounded queue
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl WorkerPool {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn new(config: &PoolConfig) -> Self {
        let workers = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<Job>(capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let handles = (0..workers)
            .map(|worker| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        // the lock is released before the job runs
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => {
                                debug!(worker, "job started");
                                job.await;
                                debug!(worker, "job finished");
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            capacity,
        }
    }

    /// Queue a job without waiting for space
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let sender = match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let sender = sender.ok_or(PoolError::Closed)?;

        match sender.try_send(Box::pin(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                warn!(capacity = self.capacity, "execution queue full, rejecting job");
                Err(PoolError::QueueFull(self.capacity))
            }
            Err(TrySendError::Closed(_)) => Err(PoolError::Closed),
        }
    }

    /// Stop accepting jobs and wait for queued and running jobs to finish
    pub async fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        let handles = match self.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "worker task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn pool(workers: usize, queue_capacity: usize) -> WorkerPool {
        WorkerPool::new(&PoolConfig {
            workers,
            queue_capacity,
        })
    }

    #[tokio::test]
    async fn test_runs_submitted_jobs() {
        let pool = pool(2, 8);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.shutdown().await;

        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_rejects_when_queue_full() {
        let pool = pool(1, 1);
        let (started_tx, started_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel::<()>();

        // occupy the only worker
        pool.submit(async move {
            let _ = started_tx.send(());
            let _ = release_rx.await;
        })
        .unwrap();
        started_rx.await.unwrap();

        // fills the queue
        pool.submit(async {}).unwrap();
        assert_eq!(pool.submit(async {}), Err(PoolError::QueueFull(1)));

        let _ = release_tx.send(());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let pool = pool(1, 4);
        pool.shutdown().await;
        assert_eq!(pool.submit(async {}), Err(PoolError::Closed));
    }

    #[tokio::test]
    async fn test_workers_run_concurrently() {
        let pool = pool(2, 4);
        let (a_tx, a_rx) = oneshot::channel::<()>();
        let (b_tx, b_rx) = oneshot::channel::<()>();

        // each job waits for the other, so both must be running at once
        pool.submit(async move {
            let _ = a_tx.send(());
            let _ = b_rx.await;
        })
        .unwrap();
        pool.submit(async move {
            let _ = b_tx.send(());
            let _ = a_rx.await;
        })
        .unwrap();

        tokio::time::timeout(std::time::Duration::from_secs(5), pool.shutdown())
            .await
            .unwrap();
    }
}

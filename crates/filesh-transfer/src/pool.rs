//! Fixed-size worker pool over a flume MPMC queue
//!
//! `concurrency` tokio tasks pull [`Job`]s from one shared queue, run the
//! work function under a per-job timeout and report an [`Outcome`] back to
//! the single coordinator that owns the pool. The coordinator decides about
//! retries and resubmits; workers never touch retry policy.
//!
//! Cancelling the pool token drops in-flight work at its next await point.

use filesh_core::config::TransferConfig;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{TransferError, TransferResult};

/// One unit of work: a chunk index and the attempt about to be made
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    /// Batch-wide chunk index
    pub index: u32,
    /// 1-based attempt number
    pub attempt: u32,
    /// Backoff to sleep before starting
    pub delay: Duration,
}

impl Job {
    pub fn first(index: u32, previous_attempts: u32) -> Self {
        Self {
            index,
            attempt: previous_attempts + 1,
            delay: Duration::ZERO,
        }
    }

    /// The follow-up job after this one failed
    pub fn retry(&self, delay: Duration) -> Self {
        Self {
            index: self.index,
            attempt: self.attempt + 1,
            delay,
        }
    }
}

#[derive(Debug)]
pub enum Outcome<T> {
    Done { job: Job, value: T },
    Failed { job: Job, error: TransferError },
}

pub struct WorkerPool<T> {
    jobs: flume::Sender<Job>,
    outcomes: flume::Receiver<Outcome<T>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start `concurrency` workers. `cancel` should be a token the pool may
    /// cancel on its own (a child of the transfer's token).
    pub fn spawn<W, Fut>(concurrency: usize, timeout: Duration, cancel: CancellationToken, work: W) -> Self
    where
        W: Fn(Job) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = TransferResult<T>> + Send + 'static,
    {
        let (job_tx, job_rx) = flume::unbounded::<Job>();
        let (out_tx, out_rx) = flume::unbounded::<Outcome<T>>();

        let workers = (0..concurrency.max(1))
            .map(|worker| {
                let job_rx = job_rx.clone();
                let out_tx = out_tx.clone();
                let cancel = cancel.clone();
                let work = work.clone();

                tokio::spawn(async move {
                    loop {
                        let job = tokio::select! {
                            _ = cancel.cancelled() => break,
                            job = job_rx.recv_async() => match job {
                                Ok(job) => job,
                                Err(_) => break,
                            },
                        };

                        if !job.delay.is_zero() {
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(job.delay) => {}
                            }
                        }

                        let index = job.index;
                        let result = tokio::select! {
                            _ = cancel.cancelled() => break,
                            r = tokio::time::timeout(timeout, work(job.clone())) => r,
                        };

                        let outcome = match result {
                            Ok(Ok(value)) => Outcome::Done { job, value },
                            Ok(Err(error)) => Outcome::Failed { job, error },
                            Err(_) => Outcome::Failed {
                                job,
                                error: TransferError::chunk(index, format!("timed out after {timeout:?}")),
                            },
                        };
                        if out_tx.send_async(outcome).await.is_err() {
                            break;
                        }
                    }
                    tracing::trace!(worker, "chunk worker stopped");
                })
            })
            .collect();

        Self {
            jobs: job_tx,
            outcomes: out_rx,
            workers,
            cancel,
        }
    }

    pub fn submit(&self, job: Job) -> TransferResult<()> {
        self.jobs
            .send(job)
            .map_err(|_| TransferError::Api("worker pool closed".into()))
    }

    /// Next reported outcome; `None` once the pool is cancelled.
    pub async fn next(&self) -> Option<Outcome<T>> {
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            outcome = self.outcomes.recv_async() => outcome.ok(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop accepting work and wait for the workers. With `abort`, in-flight
    /// jobs are dropped; otherwise workers exit once the queue is drained.
    pub async fn shutdown(self, abort: bool) {
        if abort {
            self.cancel.cancel();
        }
        drop(self.jobs);
        for handle in self.workers {
            if let Err(e) = handle.await {
                tracing::warn!("chunk worker panicked: {e}");
            }
        }
    }
}

/// Permanent-failure accounting for one transfer.
///
/// The batch is exhausted once more than `max_failed_chunks` chunks, or more
/// than `max_failed_ratio` of all chunks, failed permanently.
#[derive(Debug, Clone)]
pub struct FailureBudget {
    total: usize,
    max_failed_chunks: usize,
    max_failed_ratio: f64,
    failed: Vec<u32>,
}

impl FailureBudget {
    pub fn new(total: usize, cfg: &TransferConfig) -> Self {
        Self {
            total,
            max_failed_chunks: cfg.max_failed_chunks,
            max_failed_ratio: cfg.max_failed_ratio,
            failed: Vec::new(),
        }
    }

    pub fn record(&mut self, index: u32) {
        self.failed.push(index);
    }

    pub fn exhausted(&self) -> bool {
        let failed = self.failed.len();
        failed > self.max_failed_chunks
            || (self.total > 0 && failed as f64 / self.total as f64 > self.max_failed_ratio)
    }

    pub fn failed(&self) -> &[u32] {
        &self.failed
    }

    pub fn total(&self) -> usize {
        self.total
    }
}

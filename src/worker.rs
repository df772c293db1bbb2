//! Fixed-size worker pool polling the job queue.
//!
//! Two tokens control a running pool:
//! - `shutdown`: stop claiming; a worker finishes its current run, then exits.
//! - `cancel`: also abort in-flight runs at the next file boundary.
//!
//! `shutdown` is a child of `cancel`, so cancelling implies shutting down.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::pipeline::Orchestrator;
use crate::queue::{Claim, JobQueue};

/// Per-worker tally, returned when the pool is joined.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
}

pub struct WorkerPool {
    queue: JobQueue,
    orchestrator: Arc<Orchestrator>,
    workers: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: JobQueue,
        orchestrator: Arc<Orchestrator>,
        workers: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            workers: workers.max(1),
            poll_interval,
        }
    }

    /// Spawn the workers onto the current runtime.
    pub fn start(self) -> PoolHandle {
        let cancel = CancellationToken::new();
        let shutdown = cancel.child_token();

        let tasks = (0..self.workers)
            .map(|worker_id| {
                let worker = Worker {
                    id: worker_id,
                    queue: self.queue.clone(),
                    orchestrator: self.orchestrator.clone(),
                    poll_interval: self.poll_interval,
                    shutdown: shutdown.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run().instrument(info_span!("worker", worker_id)))
            })
            .collect();

        info!(workers = self.workers, poll_ms = self.poll_interval.as_millis() as u64, "worker pool started");
        PoolHandle {
            control: PoolControl { shutdown, cancel },
            tasks,
        }
    }
}

/// Cloneable stop switches for a running pool, e.g. for a signal handler.
#[derive(Clone)]
pub struct PoolControl {
    shutdown: CancellationToken,
    cancel: CancellationToken,
}

impl PoolControl {
    /// Stop claiming new work. In-flight runs continue.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Stop claiming and abort in-flight runs between files.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

pub struct PoolHandle {
    control: PoolControl,
    tasks: Vec<JoinHandle<WorkerSummary>>,
}

impl PoolHandle {
    pub fn control(&self) -> PoolControl {
        self.control.clone()
    }

    pub fn shutdown(&self) {
        self.control.shutdown();
    }

    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// Wait for every worker to exit. Returns once all in-flight runs have
    /// returned.
    pub async fn join(self) -> Vec<WorkerSummary> {
        let mut summaries = Vec::with_capacity(self.tasks.len());
        for task in self.tasks {
            match task.await {
                Ok(summary) => summaries.push(summary),
                Err(err) => warn!(error = %err, "worker task ended abnormally"),
            }
        }
        info!("worker pool stopped");
        summaries
    }
}

struct Worker {
    id: usize,
    queue: JobQueue,
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
    shutdown: CancellationToken,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self) -> WorkerSummary {
        let mut summary = WorkerSummary {
            worker_id: self.id,
            ..WorkerSummary::default()
        };
        debug!("worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.queue.claim().await {
                Ok(Claim::Claimed(repo)) => {
                    let repository_id = repo.id;
                    match self.orchestrator.run(repo, &self.cancel).await {
                        Ok(_) => summary.completed += 1,
                        Err(err) if err.is_cancelled() => summary.cancelled += 1,
                        Err(err) => {
                            summary.failed += 1;
                            debug!(repository_id, error = %err, "run ended with failure");
                        }
                    }
                    // Poll again right away; there may be more queued work.
                    continue;
                }
                Ok(Claim::NoWork) => {}
                Err(err) => warn!(error = %err, "claim failed"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        debug!(completed = summary.completed, failed = summary.failed, "worker stopped");
        summary
    }
}

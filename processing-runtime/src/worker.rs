use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::jobs::{Job, JobKind};
use crate::jobs_queue::JobsQueue;
use crate::metrics_consts::{JOBS_COMPLETED, WORKERS_BUSY};
use crate::strategy::panic_message;

/// Fixed set of workers pulling jobs from the queue until it closes
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(size: usize, queue: Arc<JobsQueue>) -> Self {
        let handles = (0..size)
            .map(|worker_id| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move { run_worker(worker_id, queue).await })
            })
            .collect();
        Self { handles }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }

    /// Waits for every worker to exit. Workers only exit once the queue is closed.
    pub async fn join(self) {
        for (worker_id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(worker_id = worker_id, "Worker panicked: {}", e);
                } else {
                    warn!(worker_id = worker_id, "Worker cancelled: {}", e);
                }
            }
        }
    }

    /// Stops workers stuck in a job
    pub fn abort(self) {
        for handle in &self.handles {
            handle.abort();
        }
        warn!(workers = self.handles.len(), "Aborted workers");
    }
}

async fn run_worker(worker_id: usize, queue: Arc<JobsQueue>) {
    info!(worker_id = worker_id, "Starting worker");

    while let Some(job) = queue.dequeue().await {
        metrics::gauge!(WORKERS_BUSY).increment(1.0);
        let started = Instant::now();
        // a panicking job must still be marked done or its partition never frees up
        let result = AssertUnwindSafe(job.run())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                error!(
                    worker_id = worker_id,
                    job_id = job.id(),
                    kind = job.kind().as_str(),
                    "Job panicked: {}",
                    panic_message(&*panic)
                );
                Err(anyhow!("job panicked: {}", panic_message(&*panic)))
            });
        metrics::gauge!(WORKERS_BUSY).decrement(1.0);

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(JOBS_COMPLETED, "kind" => job.kind().as_str(), "status" => status)
            .increment(1);

        match result {
            Ok(()) => {
                debug!(
                    worker_id = worker_id,
                    job_id = job.id(),
                    topic = job.partition().topic(),
                    partition = job.partition().partition(),
                    kind = job.kind().as_str(),
                    duration_ms = started.elapsed().as_millis(),
                    "Job finished"
                );
            }
            Err(e) => log_job_error(worker_id, &job, &e),
        }

        queue.mark_done(&job);
    }

    info!(worker_id = worker_id, "Worker stopped");
}

fn log_job_error(worker_id: usize, job: &Job, e: &anyhow::Error) {
    // consume failures were already reported to the monitor and will be retried
    if matches!(job.kind(), JobKind::Consume(_)) {
        debug!(
            worker_id = worker_id,
            job_id = job.id(),
            topic = job.partition().topic(),
            partition = job.partition().partition(),
            "Consume job failed: {e:#}"
        );
    } else {
        warn!(
            worker_id = worker_id,
            job_id = job.id(),
            topic = job.partition().topic(),
            partition = job.partition().partition(),
            kind = job.kind().as_str(),
            error = ?e,
            "Job failed"
        );
    }
}

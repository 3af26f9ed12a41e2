//! Scheduler - turns fetched batches and lifecycle events into jobs
//!
//! Dispatch order across partitions is round robin: a partition that just ran goes to the
//! back of the ring, so a hot partition cannot starve the others. Partitions enter the ring
//! in the order their first job became ready.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::error::RuntimeError;
use crate::executor::Executor;
use crate::jobs::{Job, JobKind};
use crate::jobs_queue::JobsQueue;
use crate::strategy::EnqueueDecision;
use crate::types::{MessageBatch, PartitionKey};

/// Ring of partitions with ready work
#[derive(Debug, Default)]
pub struct RoundRobin {
    ring: VecDeque<PartitionKey>,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, partition: PartitionKey) {
        debug_assert!(!self.ring.contains(&partition));
        self.ring.push_back(partition);
    }

    /// Takes the first partition, in ring order, accepted by `eligible`
    pub fn take_first<F>(&mut self, mut eligible: F) -> Option<PartitionKey>
    where
        F: FnMut(&PartitionKey) -> bool,
    {
        let position = self.ring.iter().position(|partition| eligible(partition))?;
        self.ring.remove(position)
    }

    pub fn remove(&mut self, partition: &PartitionKey) -> bool {
        match self.ring.iter().position(|p| p == partition) {
            Some(position) => {
                self.ring.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

pub struct Scheduler {
    queue: Arc<JobsQueue>,
    next_job_id: AtomicU64,
}

impl Scheduler {
    pub fn new(queue: Arc<JobsQueue>) -> Self {
        Self {
            queue,
            next_job_id: AtomicU64::new(1),
        }
    }

    pub fn queue(&self) -> &Arc<JobsQueue> {
        &self.queue
    }

    fn job(&self, kind: JobKind, executor: &Arc<Executor>) -> Job {
        let id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        Job::new(id, kind, Arc::clone(executor))
    }

    /// Runs `before_enqueue` for a fetched batch and enqueues the resulting job.
    ///
    /// Consume jobs count as in flight on the coordinator from here until a worker
    /// finishes or discards them.
    pub async fn schedule_consumption(
        &self,
        executor: &Arc<Executor>,
        batch: MessageBatch,
    ) -> anyhow::Result<()> {
        let coordinator = executor.coordinator();
        if coordinator.is_revoked() {
            return Err(RuntimeError::PartitionRevoked(executor.partition().clone()).into());
        }

        let job = match executor.before_enqueue(batch).await? {
            EnqueueDecision::Consume(batch) => {
                coordinator.on_enqueue()?;
                self.job(JobKind::Consume(batch), executor)
            }
            EnqueueDecision::Idle(batch) => self.job(JobKind::Idle(batch), executor),
        };

        debug!(
            topic = executor.partition().topic(),
            partition = executor.partition().partition(),
            job_id = job.id(),
            kind = job.kind().as_str(),
            blocking = job.is_blocking(),
            "Scheduling job"
        );
        self.queue.enqueue(job)?;
        Ok(())
    }

    /// Drops pending data jobs of the partition and queues its revoked job behind
    /// whatever is running.
    pub fn schedule_revocation(&self, executor: &Arc<Executor>) -> Result<(), RuntimeError> {
        let discarded = self.queue.revoke(executor.partition());
        debug!(
            topic = executor.partition().topic(),
            partition = executor.partition().partition(),
            discarded = discarded,
            "Scheduling revocation"
        );
        self.queue.enqueue(self.job(JobKind::Revoked, executor))
    }

    pub fn schedule_shutdown<'a>(
        &self,
        executors: impl IntoIterator<Item = &'a Arc<Executor>>,
    ) -> Result<usize, RuntimeError> {
        let mut scheduled = 0;
        for executor in executors {
            self.queue.enqueue(self.job(JobKind::Shutdown, executor))?;
            scheduled += 1;
        }
        Ok(scheduled)
    }
}

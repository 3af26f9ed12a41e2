use std::fmt;
use std::sync::Arc;

use crate::executor::Executor;
use crate::types::{MessageBatch, PartitionKey};

#[derive(Debug)]
pub enum JobKind {
    Consume(MessageBatch),
    Idle(MessageBatch),
    Revoked,
    Shutdown,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Consume(_) => "consume",
            JobKind::Idle(_) => "idle",
            JobKind::Revoked => "revoked",
            JobKind::Shutdown => "shutdown",
        }
    }
}

/// One unit of work for one partition. Created by the scheduler, run exactly once by a
/// worker or discarded.
pub struct Job {
    id: u64,
    kind: JobKind,
    blocking: bool,
    executor: Arc<Executor>,
}

impl Job {
    pub fn new(id: u64, kind: JobKind, executor: Arc<Executor>) -> Self {
        let blocking = matches!(kind, JobKind::Consume(_)) && executor.is_blocking();
        Self {
            id,
            kind,
            blocking,
            executor,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn partition(&self) -> &PartitionKey {
        self.executor.partition()
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    pub fn is_consume(&self) -> bool {
        matches!(self.kind, JobKind::Consume(_))
    }

    /// Consume and idle jobs carry data; they are dropped once the queue stops taking work
    pub fn is_data(&self) -> bool {
        matches!(self.kind, JobKind::Consume(_) | JobKind::Idle(_))
    }

    pub fn is_partition_revoked(&self) -> bool {
        self.executor.coordinator().is_revoked()
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        match &self.kind {
            JobKind::Consume(batch) => self.executor.on_consume(batch.clone()).await,
            JobKind::Idle(batch) => self.executor.on_idle(batch.clone()).await,
            JobKind::Revoked => self.executor.on_revoked().await,
            JobKind::Shutdown => self.executor.on_shutdown().await,
        }
    }

    /// Drops the job without running it, releasing its in-flight slot
    pub fn discard(self) {
        if self.is_consume() {
            self.executor.coordinator().decrement();
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("partition", self.partition())
            .field("kind", &self.kind.as_str())
            .field("blocking", &self.blocking)
            .finish()
    }
}

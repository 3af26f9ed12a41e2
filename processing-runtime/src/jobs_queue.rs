//! Jobs Queue - hands jobs to workers under the concurrency rules
//!
//! - at most one job per partition runs at a time, later jobs of the partition wait
//!   behind it in arrival order
//! - blocking jobs may hold at most `max_blocking` workers, so other partitions always
//!   keep workers to run on
//! - pending consume jobs of a revoked partition never run
//! - while draining only lifecycle jobs (revoked, shutdown) are accepted; once closed
//!   nothing is

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::error::RuntimeError;
use crate::jobs::Job;
use crate::metrics_consts::{JOBS_DISCARDED, JOBS_ENQUEUED, JOBS_QUEUE_DEPTH, JOBS_RUNNING_BLOCKING};
use crate::scheduler::RoundRobin;
use crate::types::PartitionKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueState {
    Open,
    Draining,
    Closed,
}

#[derive(Debug, Default)]
struct PartitionQueue {
    pending: VecDeque<Job>,
    running: bool,
}

#[derive(Debug)]
struct Inner {
    state: QueueState,
    partitions: HashMap<PartitionKey, PartitionQueue>,
    /// Partitions with pending jobs and nothing running
    ready: RoundRobin,
    running_blocking: usize,
    running_total: usize,
    pending_total: usize,
}

impl Inner {
    fn is_empty(&self) -> bool {
        self.pending_total == 0 && self.running_total == 0
    }

    fn pop_pending(&mut self, partition: &PartitionKey) -> Option<Job> {
        let job = self.partitions.get_mut(partition)?.pending.pop_front()?;
        self.pending_total -= 1;
        Some(job)
    }

    fn forget_if_done(&mut self, partition: &PartitionKey) {
        if self
            .partitions
            .get(partition)
            .is_some_and(|queue| !queue.running && queue.pending.is_empty())
        {
            self.partitions.remove(partition);
        }
    }
}

pub struct JobsQueue {
    inner: Mutex<Inner>,
    available: Notify,
    idle: Notify,
    max_blocking: usize,
}

impl JobsQueue {
    pub fn new(max_blocking: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: QueueState::Open,
                partitions: HashMap::new(),
                ready: RoundRobin::new(),
                running_blocking: 0,
                running_total: 0,
                pending_total: 0,
            }),
            available: Notify::new(),
            idle: Notify::new(),
            max_blocking: max_blocking.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Queues `job` behind the partition's earlier jobs.
    ///
    /// A rejected job is discarded, releasing its in-flight slot.
    pub fn enqueue(&self, job: Job) -> Result<(), RuntimeError> {
        let mut inner = self.lock();
        let rejection = match inner.state {
            QueueState::Closed => Some(RuntimeError::QueueClosed),
            QueueState::Draining if job.is_data() => {
                Some(RuntimeError::QueueDraining(job.kind().as_str()))
            }
            _ => None,
        };
        if let Some(error) = rejection {
            drop(inner);
            debug!(job_id = job.id(), partition = %job.partition(), "Job rejected: {}", error);
            metrics::counter!(JOBS_DISCARDED, "kind" => job.kind().as_str()).increment(1);
            job.discard();
            return Err(error);
        }

        let partition = job.partition().clone();
        metrics::counter!(JOBS_ENQUEUED, "kind" => job.kind().as_str()).increment(1);

        let queue = inner.partitions.entry(partition.clone()).or_default();
        let becomes_ready = !queue.running && queue.pending.is_empty();
        queue.pending.push_back(job);
        inner.pending_total += 1;
        if becomes_ready {
            inner.ready.push(partition);
        }
        metrics::gauge!(JOBS_QUEUE_DEPTH).set(inner.pending_total as f64);
        drop(inner);

        self.available.notify_waiters();
        Ok(())
    }

    /// Waits for the next runnable job. `None` once the queue is closed.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            let notified = self.available.notified();
            if let Some(next) = self.try_dequeue() {
                return next;
            }
            notified.await;
        }
    }

    /// `Some(None)` when closed, `None` when nothing can run right now
    fn try_dequeue(&self) -> Option<Option<Job>> {
        let mut inner = self.lock();
        if inner.state == QueueState::Closed {
            return Some(None);
        }

        loop {
            let blocking_full = inner.running_blocking >= self.max_blocking;
            let Inner {
                partitions, ready, ..
            } = &mut *inner;
            let partition = ready.take_first(|partition| {
                partitions
                    .get(partition)
                    .and_then(|queue| queue.pending.front())
                    .is_some_and(|job| !(job.is_blocking() && blocking_full))
            })?;

            let Some(job) = inner.pop_pending(&partition) else {
                continue;
            };

            if job.is_data() && job_partition_revoked(&job) {
                warn!(
                    job_id = job.id(),
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "Discarding job of revoked partition"
                );
                metrics::counter!(JOBS_DISCARDED, "kind" => job.kind().as_str()).increment(1);
                let more = inner
                    .partitions
                    .get(&partition)
                    .is_some_and(|queue| !queue.pending.is_empty());
                if more {
                    inner.ready.push(partition);
                } else {
                    inner.forget_if_done(&partition);
                }
                job.discard();
                if inner.is_empty() {
                    self.idle.notify_waiters();
                }
                continue;
            }

            if let Some(queue) = inner.partitions.get_mut(&partition) {
                assert!(
                    !queue.running,
                    "partition {partition} dispatched while a job of it is running"
                );
                queue.running = true;
            }
            inner.running_total += 1;
            if job.is_blocking() {
                inner.running_blocking += 1;
                metrics::gauge!(JOBS_RUNNING_BLOCKING).set(inner.running_blocking as f64);
            }
            metrics::gauge!(JOBS_QUEUE_DEPTH).set(inner.pending_total as f64);
            return Some(Some(job));
        }
    }

    /// Releases the partition of a finished job so its next job can run
    pub fn mark_done(&self, job: &Job) {
        let mut inner = self.lock();
        let partition = job.partition().clone();

        let released = inner.partitions.get_mut(&partition).and_then(|queue| {
            let was_running = std::mem::replace(&mut queue.running, false);
            was_running.then(|| !queue.pending.is_empty())
        });
        let Some(has_pending) = released else {
            drop(inner);
            panic!("job {} of {partition} marked done but was not running", job.id());
        };
        inner.running_total -= 1;
        if job.is_blocking() {
            inner.running_blocking -= 1;
            metrics::gauge!(JOBS_RUNNING_BLOCKING).set(inner.running_blocking as f64);
        }

        if has_pending {
            inner.ready.push(partition);
        } else {
            inner.forget_if_done(&partition);
        }
        let empty = inner.is_empty();
        drop(inner);

        self.available.notify_waiters();
        if empty {
            self.idle.notify_waiters();
        }
    }

    /// Discards pending data jobs of a revoked partition. Lifecycle jobs stay queued.
    pub fn revoke(&self, partition: &PartitionKey) -> usize {
        let mut inner = self.lock();
        let Some(queue) = inner.partitions.get_mut(partition) else {
            return 0;
        };

        let (discarded, kept): (Vec<Job>, Vec<Job>) =
            queue.pending.drain(..).partition(|job| job.is_data());
        queue.pending.extend(kept);
        let now_empty = queue.pending.is_empty();
        let running = queue.running;

        inner.pending_total -= discarded.len();
        if now_empty {
            if !running {
                inner.ready.remove(partition);
            }
            inner.forget_if_done(partition);
        }
        metrics::gauge!(JOBS_QUEUE_DEPTH).set(inner.pending_total as f64);
        let empty = inner.is_empty();
        drop(inner);

        let count = discarded.len();
        for job in discarded {
            metrics::counter!(JOBS_DISCARDED, "kind" => job.kind().as_str()).increment(1);
            job.discard();
        }
        if count > 0 {
            debug!(
                topic = partition.topic(),
                partition = partition.partition(),
                discarded = count,
                "Discarded pending jobs of revoked partition"
            );
        }
        if empty {
            self.idle.notify_waiters();
        }
        count
    }

    /// Stops accepting consume and idle jobs; queued work still runs
    pub fn begin_draining(&self) {
        let mut inner = self.lock();
        if inner.state == QueueState::Open {
            inner.state = QueueState::Draining;
            info!(pending = inner.pending_total, "Jobs queue draining");
        }
    }

    /// Closes the queue: pending jobs are discarded and waiting workers released
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state == QueueState::Closed {
            return;
        }
        inner.state = QueueState::Closed;
        inner.ready = RoundRobin::new();
        let pending: Vec<Job> = inner
            .partitions
            .values_mut()
            .flat_map(|queue| queue.pending.drain(..))
            .collect();
        inner.pending_total = 0;
        inner.partitions.retain(|_, queue| queue.running);
        let running = inner.running_total;
        metrics::gauge!(JOBS_QUEUE_DEPTH).set(0.0);
        drop(inner);

        info!(
            discarded = pending.len(),
            running = running,
            "Jobs queue closed"
        );
        for job in pending {
            metrics::counter!(JOBS_DISCARDED, "kind" => job.kind().as_str()).increment(1);
            job.discard();
        }
        self.available.notify_waiters();
        self.idle.notify_waiters();
    }

    /// Resolves once nothing is pending or running
    pub async fn wait_until_empty(&self) {
        loop {
            let notified = self.idle.notified();
            if self.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// True while the partition has a job running or pending
    pub fn is_busy(&self, partition: &PartitionKey) -> bool {
        self.lock().partitions.contains_key(partition)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn pending(&self) -> usize {
        self.lock().pending_total
    }

    pub fn running(&self) -> usize {
        self.lock().running_total
    }

    pub fn is_closed(&self) -> bool {
        self.lock().state == QueueState::Closed
    }
}

fn job_partition_revoked(job: &Job) -> bool {
    job.is_consume() && job.is_partition_revoked()
}

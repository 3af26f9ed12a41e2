//! Runtime - the explicit context tying the processing pieces together
//!
//! Holds the jobs queue, the scheduler, the coordinator registry and one executor per
//! assigned partition. Built once and shared as `Arc<Runtime>`; nothing here is global.
//!
//! The listener side (`run` / `poll_once`) fetches batches only for partitions with no
//! work in flight or queued, which keeps batches of one partition strictly ordered even
//! across retries. Rebalance callbacks arrive through [`RebalanceListener`].

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{BrokerClient, DeadLetterProducer, RebalanceListener};
use crate::config::Config;
use crate::consumer::PartitionEnv;
use crate::coordinator::Coordinators;
use crate::error::{ConfigError, RuntimeError};
use crate::executor::Executor;
use crate::jobs_queue::JobsQueue;
use crate::metrics_consts::{ASSIGNED_PARTITIONS, PARTITIONS_REVOKED, PARTITION_RESUMES};
use crate::monitor::{Monitor, TracingMonitor};
use crate::routes::Routes;
use crate::scheduler::Scheduler;
use crate::types::{MessageBatch, PartitionKey};
use crate::worker::WorkerPool;

pub struct RuntimeBuilder {
    config: Config,
    routes: Routes,
    client: Arc<dyn BrokerClient>,
    producer: Option<Arc<dyn DeadLetterProducer>>,
    monitor: Arc<dyn Monitor>,
}

impl RuntimeBuilder {
    pub fn new(config: Config, routes: Routes, client: Arc<dyn BrokerClient>) -> Self {
        Self {
            config,
            routes,
            client,
            producer: None,
            monitor: Arc::new(TracingMonitor),
        }
    }

    pub fn producer(mut self, producer: Arc<dyn DeadLetterProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn Monitor>) -> Self {
        self.monitor = monitor;
        self
    }

    /// Validates the configuration and starts the worker pool.
    ///
    /// Must be called from within a tokio runtime.
    pub fn build(self) -> Result<Arc<Runtime>, ConfigError> {
        self.config.validate()?;
        let routes = self.routes.resolve(&self.config, self.producer.is_some())?;

        let queue = Arc::new(JobsQueue::new(self.config.effective_max_blocking_jobs()));
        let workers = WorkerPool::spawn(self.config.concurrency, Arc::clone(&queue));
        info!(
            concurrency = self.config.concurrency,
            max_blocking_jobs = self.config.effective_max_blocking_jobs(),
            topics = routes.len(),
            "Processing runtime started"
        );

        Ok(Arc::new(Runtime {
            scheduler: Scheduler::new(Arc::clone(&queue)),
            queue,
            config: self.config,
            routes,
            client: self.client,
            producer: self.producer,
            monitor: self.monitor,
            coordinators: Arc::new(Coordinators::new()),
            executors: DashMap::new(),
            workers: Mutex::new(Some(workers)),
            shutdown: CancellationToken::new(),
        }))
    }
}

pub struct Runtime {
    config: Config,
    routes: Routes,
    client: Arc<dyn BrokerClient>,
    producer: Option<Arc<dyn DeadLetterProducer>>,
    monitor: Arc<dyn Monitor>,
    queue: Arc<JobsQueue>,
    scheduler: Scheduler,
    coordinators: Arc<Coordinators>,
    executors: DashMap<PartitionKey, Arc<Executor>>,
    workers: Mutex<Option<WorkerPool>>,
    shutdown: CancellationToken,
}

impl Runtime {
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &Arc<JobsQueue> {
        &self.queue
    }

    pub fn coordinators(&self) -> &Arc<Coordinators> {
        &self.coordinators
    }

    pub fn executor(&self, partition: &PartitionKey) -> Option<Arc<Executor>> {
        self.executors.get(partition).map(|e| Arc::clone(e.value()))
    }

    pub fn assigned(&self) -> Vec<PartitionKey> {
        let mut partitions: Vec<PartitionKey> =
            self.executors.iter().map(|e| e.key().clone()).collect();
        partitions.sort();
        partitions
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Sets up coordinator and executor for newly assigned partitions
    pub fn assign(&self, partitions: &[PartitionKey]) {
        for partition in partitions {
            if self
                .executors
                .get(partition)
                .is_some_and(|e| !e.coordinator().is_revoked())
            {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "Partition already assigned"
                );
                continue;
            }

            let Some(route) = self.routes.get(partition.topic()) else {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "{}",
                    RuntimeError::UnknownRoute(partition.topic().to_string())
                );
                continue;
            };

            let coordinator = self
                .coordinators
                .find_or_create(partition, || route.topic().pause_tracker());
            let env = PartitionEnv {
                partition: partition.clone(),
                topic: Arc::clone(route.topic()),
                coordinator,
                client: Arc::clone(&self.client),
                producer: self.producer.clone(),
                monitor: Arc::clone(&self.monitor),
            };
            let executor = Executor::new(
                env,
                Arc::clone(route.plan()),
                route.build_consumer(partition),
            );
            self.executors.insert(partition.clone(), Arc::new(executor));

            info!(
                topic = partition.topic(),
                partition = partition.partition(),
                stages = ?route.plan().stage_names(),
                "Partition assigned"
            );
        }
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.executors.len() as f64);
    }

    /// Handles loss of partitions.
    ///
    /// The revoked flag is latched right away so in-flight work stops touching offsets,
    /// pending consume jobs are dropped and the partition is resumed before the broker
    /// hands it to its next owner. The revoked job runs once the running job finished; the
    /// coordinator is dropped from the registry once nothing is in flight.
    pub async fn revoke(&self, partitions: &[PartitionKey]) {
        for partition in partitions {
            let Some((_, executor)) = self.executors.remove(partition) else {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "Revocation for partition that is not assigned"
                );
                continue;
            };
            let coordinator = Arc::clone(executor.coordinator());
            coordinator.revoke();

            if let Err(e) = self.client.resume(partition).await {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "Failed to resume revoked partition: {e:#}"
                );
            }
            coordinator.with_pause_tracker(|tracker| tracker.expire());

            if let Err(e) = self.scheduler.schedule_revocation(&executor) {
                warn!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    "Could not schedule revoked job: {}",
                    e
                );
            }
            metrics::counter!(PARTITIONS_REVOKED).increment(1);
            info!(
                topic = partition.topic(),
                partition = partition.partition(),
                in_flight = coordinator.in_flight(),
                "Partition revoked"
            );

            let coordinators = Arc::clone(&self.coordinators);
            tokio::spawn(async move {
                coordinator.wait_until_drained().await;
                coordinators.remove_if_same(&coordinator);
            });
        }
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.executors.len() as f64);
    }

    /// Schedules a fetched batch for its partition
    pub async fn dispatch(&self, batch: MessageBatch) -> anyhow::Result<()> {
        let executor = self
            .executor(batch.partition_key())
            .ok_or_else(|| RuntimeError::PartitionNotAssigned(batch.partition_key().clone()))?;
        self.scheduler.schedule_consumption(&executor, batch).await
    }

    /// Resumes partitions whose pause ran out
    pub async fn resume_expired(&self) -> usize {
        let mut resumed = 0;
        for coordinator in self.coordinators.expired_pauses() {
            let partition = coordinator.partition();
            if !self.executors.contains_key(partition) {
                continue;
            }
            match self.client.resume(partition).await {
                Ok(()) => {
                    coordinator.with_pause_tracker(|tracker| tracker.expire());
                    metrics::counter!(PARTITION_RESUMES, "reason" => "expired").increment(1);
                    debug!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        "Pause expired, partition resumed"
                    );
                    resumed += 1;
                }
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        error = ?e,
                        "Failed to resume partition after pause"
                    );
                }
            }
        }
        resumed
    }

    /// One listener pass: resume expired pauses, then fetch and schedule a batch for every
    /// assigned partition with nothing in flight. Returns the number of jobs scheduled.
    pub async fn poll_once(&self) -> usize {
        self.resume_expired().await;

        let executors: Vec<Arc<Executor>> = self
            .executors
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();

        let mut scheduled = 0;
        for executor in executors {
            let partition = executor.partition();
            let coordinator = executor.coordinator();
            if coordinator.is_revoked()
                || !coordinator.is_idle()
                || self.queue.is_busy(partition)
                || coordinator.with_pause_tracker(|tracker| tracker.is_paused())
            {
                continue;
            }

            let batch = match self.client.poll(partition).await {
                Ok(Some(batch)) => batch,
                Ok(None) => continue,
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        error = ?e,
                        "Poll failed"
                    );
                    continue;
                }
            };

            match self.scheduler.schedule_consumption(&executor, batch).await {
                Ok(()) => scheduled += 1,
                Err(e) => {
                    warn!(
                        topic = partition.topic(),
                        partition = partition.partition(),
                        "Failed to schedule batch: {e:#}"
                    );
                }
            }
        }
        scheduled
    }

    /// Listener loop. Runs until [`Runtime::shutdown`] is called or the cancellation token
    /// is cancelled.
    pub async fn run(&self) {
        info!("Listener started");
        while !self.shutdown.is_cancelled() {
            if self.poll_once().await > 0 {
                tokio::task::yield_now().await;
                continue;
            }
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.max_wait_time()) => {}
            }
        }
        info!("Listener stopped");
    }

    /// Graceful shutdown: stop the listener, let queued work finish, run the shutdown flow
    /// of every assigned partition, then stop the workers. Bounded by the shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), RuntimeError> {
        info!("Shutting down processing runtime");
        self.shutdown.cancel();
        self.queue.begin_draining();

        let timeout = self.config.shutdown_timeout();
        let drained = tokio::time::timeout(timeout, async {
            self.queue.wait_until_empty().await;

            let executors: Vec<Arc<Executor>> = self
                .executors
                .iter()
                .map(|e| Arc::clone(e.value()))
                .collect();
            match self.scheduler.schedule_shutdown(&executors) {
                Ok(count) => info!(partitions = count, "Scheduled shutdown jobs"),
                Err(e) => warn!("Could not schedule shutdown jobs: {}", e),
            }

            self.queue.wait_until_empty().await;
        })
        .await;

        self.queue.close();
        let workers = self
            .workers
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .take();

        match drained {
            Ok(()) => {
                if let Some(workers) = workers {
                    workers.join().await;
                }
                info!("Processing runtime stopped");
                Ok(())
            }
            Err(_) => {
                error!(
                    timeout_ms = timeout.as_millis(),
                    running = self.queue.running(),
                    "Shutdown timed out, aborting workers"
                );
                if let Some(workers) = workers {
                    workers.abort();
                }
                Err(RuntimeError::ShutdownTimeout(timeout))
            }
        }
    }
}

#[async_trait]
impl RebalanceListener for Runtime {
    async fn on_assigned(&self, partitions: &[PartitionKey]) {
        self.assign(partitions);
    }

    async fn on_revoked(&self, partitions: &[PartitionKey]) {
        self.revoke(partitions).await;
    }
}

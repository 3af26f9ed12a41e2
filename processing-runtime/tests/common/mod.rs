#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use processing_runtime::test_utils::{RecordingBroker, RecordingMonitor, RecordingProducer};
use processing_runtime::{
    Config, Consumer, ConsumerContext, MessageBatch, Offset, PartitionKey, Routes, Runtime,
    RuntimeBuilder, RuntimeError,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

static TRACING_INIT: Once = Once::new();
pub fn setup_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_writer(tracing_subscriber::fmt::TestWriter::new())
            .init()
    });
}

/// One call to `consume` as seen by a [`JournalConsumer`]
#[derive(Debug, Clone)]
pub struct Consumed {
    pub partition: PartitionKey,
    pub offsets: Vec<Offset>,
    pub attempt: u32,
    pub at: Instant,
    pub ok: bool,
}

/// Shared record of what the consumers of a test did
#[derive(Default)]
pub struct Journal {
    consumed: Mutex<Vec<Consumed>>,
    active: Mutex<HashSet<PartitionKey>>,
    overlapped: AtomicBool,
    revoked: AtomicUsize,
    shutdown: AtomicUsize,
    started: Notify,
    release: Notify,
    hold: AtomicBool,
    mark_consumed: AtomicBool,
    panic_in_revoked: AtomicBool,
    panic_in_shutdown: AtomicBool,
}

pub type FailWhen = Arc<dyn Fn(&MessageBatch, u32) -> bool + Send + Sync>;

impl Journal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Consumers park inside `consume` until [`Journal::release`] is called
    pub fn holding() -> Arc<Self> {
        let journal = Self::default();
        journal.hold.store(true, Ordering::SeqCst);
        Arc::new(journal)
    }

    /// Consumers mark the last message of every successful batch themselves
    pub fn marking() -> Arc<Self> {
        let journal = Self::default();
        journal.mark_consumed.store(true, Ordering::SeqCst);
        Arc::new(journal)
    }

    pub fn panic_in_revoked(&self) {
        self.panic_in_revoked.store(true, Ordering::SeqCst);
    }

    pub fn panic_in_shutdown(&self) {
        self.panic_in_shutdown.store(true, Ordering::SeqCst);
    }

    pub fn factory<F>(
        self: &Arc<Self>,
        fail_when: F,
    ) -> impl Fn(&PartitionKey) -> JournalConsumer + Send + Sync + 'static
    where
        F: Fn(&MessageBatch, u32) -> bool + Send + Sync + 'static,
    {
        let journal = Arc::clone(self);
        let fail_when: FailWhen = Arc::new(fail_when);
        move |_: &PartitionKey| JournalConsumer {
            journal: Arc::clone(&journal),
            fail_when: Arc::clone(&fail_when),
        }
    }

    pub fn consumed(&self) -> Vec<Consumed> {
        self.consumed.lock().unwrap().clone()
    }

    pub fn successes(&self) -> usize {
        self.consumed().iter().filter(|c| c.ok).count()
    }

    /// Offsets of successful batches of `partition`, in processing order
    pub fn processed(&self, partition: &PartitionKey) -> Vec<Offset> {
        self.consumed()
            .into_iter()
            .filter(|c| c.ok && &c.partition == partition)
            .flat_map(|c| c.offsets)
            .collect()
    }

    pub fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    pub fn revoked(&self) -> usize {
        self.revoked.load(Ordering::SeqCst)
    }

    pub fn shutdown(&self) -> usize {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }

    pub fn release(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.release.notify_waiters();
    }
}

pub struct JournalConsumer {
    journal: Arc<Journal>,
    fail_when: FailWhen,
}

#[async_trait]
impl Consumer for JournalConsumer {
    async fn consume(&mut self, messages: &MessageBatch, ctx: &mut ConsumerContext) -> Result<()> {
        let partition = messages.partition_key().clone();
        if !self.journal.active.lock().unwrap().insert(partition.clone()) {
            self.journal.overlapped.store(true, Ordering::SeqCst);
        }
        let at = Instant::now();
        self.journal.started.notify_one();

        if self.journal.hold.load(Ordering::SeqCst) {
            let released = self.journal.release.notified();
            if self.journal.hold.load(Ordering::SeqCst) {
                released.await;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;

        let attempt = ctx.attempt();
        let ok = !(self.fail_when)(messages, attempt);
        self.journal.active.lock().unwrap().remove(&partition);
        self.journal.consumed.lock().unwrap().push(Consumed {
            partition: partition.clone(),
            offsets: messages.iter().map(|m| m.offset()).collect(),
            attempt,
            at,
            ok,
        });

        if !ok {
            bail!("processing {partition} failed on attempt {attempt}");
        }
        if self.journal.mark_consumed.load(Ordering::SeqCst) {
            ctx.mark_as_consumed(messages.last());
        }
        Ok(())
    }

    async fn revoked(&mut self, ctx: &mut ConsumerContext) -> Result<()> {
        self.journal.revoked.fetch_add(1, Ordering::SeqCst);
        if self.journal.panic_in_revoked.load(Ordering::SeqCst) {
            panic!("revoked hook of {} blew up", ctx.partition());
        }
        Ok(())
    }

    async fn shutdown(&mut self, ctx: &mut ConsumerContext) -> Result<()> {
        self.journal.shutdown.fetch_add(1, Ordering::SeqCst);
        if self.journal.panic_in_shutdown.load(Ordering::SeqCst) {
            panic!("shutdown hook of {} blew up", ctx.partition());
        }
        Ok(())
    }
}

/// A runtime wired to recording collaborators
pub struct Harness {
    pub runtime: Arc<Runtime>,
    pub broker: Arc<RecordingBroker>,
    pub producer: Arc<RecordingProducer>,
    pub monitor: Arc<RecordingMonitor>,
    listener: Option<JoinHandle<()>>,
}

impl Harness {
    pub fn new(config: Config, routes: Routes, broker: Arc<RecordingBroker>) -> Self {
        setup_tracing();
        let producer = Arc::new(RecordingProducer::default());
        let monitor = Arc::new(RecordingMonitor::default());
        let runtime = RuntimeBuilder::new(config, routes, broker.clone())
            .producer(producer.clone())
            .monitor(monitor.clone())
            .build()
            .unwrap();
        Self {
            runtime,
            broker,
            producer,
            monitor,
            listener: None,
        }
    }

    /// Like [`Harness::new`] with the listener loop running in the background
    pub fn start(config: Config, routes: Routes, broker: Arc<RecordingBroker>) -> Self {
        let mut harness = Self::new(config, routes, broker);
        let runtime = Arc::clone(&harness.runtime);
        harness.listener = Some(tokio::spawn(async move { runtime.run().await }));
        harness
    }

    pub async fn stop(mut self) -> Result<(), RuntimeError> {
        let result = self.runtime.shutdown().await;
        if let Some(listener) = self.listener.take() {
            listener.await.unwrap();
        }
        result
    }
}

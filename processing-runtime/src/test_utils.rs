//! In-memory collaborators for tests: a broker with per-partition logs, a dead letter
//! producer and a monitor that record every call.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::Instant;

use crate::broker::{BrokerClient, DeadLetterProducer, DeadLetterRecord};
use crate::config::TopicConfig;
use crate::consumer::{Consumer, ConsumerContext, PartitionEnv};
use crate::coordinator::Coordinator;
use crate::monitor::{ErrorType, Event, EventName, Monitor};
use crate::types::{Message, MessageBatch, Offset, PartitionKey};

pub fn message(topic: &str, partition: i32, offset: Offset) -> Message {
    Message::new(
        topic,
        partition,
        offset,
        format!("payload-{offset}"),
        Utc::now(),
    )
}

/// Batch with one message per offset in `offsets`
pub fn batch(topic: &str, partition: i32, offsets: Range<Offset>) -> MessageBatch {
    MessageBatch::new(
        offsets
            .map(|offset| message(topic, partition, offset))
            .collect(),
    )
    .unwrap()
}

/// Consumer that accepts every batch
#[derive(Debug, Default)]
pub struct NoopConsumer;

#[async_trait]
impl Consumer for NoopConsumer {
    async fn consume(
        &mut self,
        _messages: &MessageBatch,
        _ctx: &mut ConsumerContext,
    ) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    Mark(PartitionKey, Offset),
    Commit(PartitionKey, Offset),
    Pause(PartitionKey, Offset, Option<Duration>),
    Resume(PartitionKey),
    Seek(PartitionKey, Offset),
}

#[derive(Debug, Default)]
struct PartitionLog {
    messages: Vec<Message>,
    position: Offset,
    paused: bool,
    marked: Vec<Offset>,
    committed: Option<Offset>,
}

/// Broker client over in-memory partition logs. Offsets equal the index in the log.
#[derive(Debug)]
pub struct RecordingBroker {
    partitions: Mutex<HashMap<PartitionKey, PartitionLog>>,
    calls: Mutex<Vec<(Instant, BrokerCall)>>,
    max_batch: usize,
    refuse_commits: Mutex<bool>,
    fail_commits: Mutex<bool>,
    fail_pauses: Mutex<bool>,
}

impl Default for RecordingBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingBroker {
    pub fn new() -> Self {
        Self::with_max_batch(100)
    }

    pub fn with_max_batch(max_batch: usize) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            max_batch,
            refuse_commits: Mutex::new(false),
            fail_commits: Mutex::new(false),
            fail_pauses: Mutex::new(false),
        }
    }

    /// Appends `count` messages to the partition's log
    pub fn produce(&self, topic: &str, partition: i32, count: usize) {
        let mut partitions = self.partitions.lock().unwrap();
        let log = partitions
            .entry(PartitionKey::new(topic, partition))
            .or_default();
        for _ in 0..count {
            let offset = log.messages.len() as Offset;
            log.messages.push(message(topic, partition, offset));
        }
    }

    pub fn refuse_commits(&self, refuse: bool) {
        *self.refuse_commits.lock().unwrap() = refuse;
    }

    /// Makes commits fail as if the broker could not be reached
    pub fn fail_commits(&self, fail: bool) {
        *self.fail_commits.lock().unwrap() = fail;
    }

    pub fn fail_pauses(&self, fail: bool) {
        *self.fail_pauses.lock().unwrap() = fail;
    }

    pub fn calls(&self) -> Vec<BrokerCall> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, call)| call.clone())
            .collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, BrokerCall)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn pauses(&self, partition: &PartitionKey) -> Vec<(Offset, Option<Duration>)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BrokerCall::Pause(p, offset, timeout) if &p == partition => Some((offset, timeout)),
                _ => None,
            })
            .collect()
    }

    pub fn marked(&self, partition: &PartitionKey) -> Vec<Offset> {
        self.partitions
            .lock()
            .unwrap()
            .get(partition)
            .map(|log| log.marked.clone())
            .unwrap_or_default()
    }

    /// Highest offset stored for commit, either marked or committed synchronously
    pub fn committed(&self, partition: &PartitionKey) -> Option<Offset> {
        let partitions = self.partitions.lock().unwrap();
        let log = partitions.get(partition)?;
        log.marked.iter().copied().chain(log.committed).max()
    }

    pub fn is_paused(&self, partition: &PartitionKey) -> bool {
        self.partitions
            .lock()
            .unwrap()
            .get(partition)
            .is_some_and(|log| log.paused)
    }

    pub fn position(&self, partition: &PartitionKey) -> Offset {
        self.partitions
            .lock()
            .unwrap()
            .get(partition)
            .map(|log| log.position)
            .unwrap_or_default()
    }

    fn record(&self, call: BrokerCall) {
        self.calls.lock().unwrap().push((Instant::now(), call));
    }

    fn with_log<R>(&self, partition: &PartitionKey, f: impl FnOnce(&mut PartitionLog) -> R) -> R {
        let mut partitions = self.partitions.lock().unwrap();
        f(partitions.entry(partition.clone()).or_default())
    }
}

#[async_trait]
impl BrokerClient for RecordingBroker {
    async fn poll(&self, partition: &PartitionKey) -> Result<Option<MessageBatch>> {
        let messages = self.with_log(partition, |log| {
            if log.paused {
                return Vec::new();
            }
            let start = usize::try_from(log.position).unwrap_or_default();
            let messages: Vec<Message> = log
                .messages
                .iter()
                .skip(start)
                .take(self.max_batch)
                .cloned()
                .collect();
            if let Some(last) = messages.last() {
                log.position = last.offset() + 1;
            }
            messages
        });

        if messages.is_empty() {
            return Ok(None);
        }
        Ok(Some(MessageBatch::new(messages)?))
    }

    fn mark_offset(&self, partition: &PartitionKey, offset: Offset) {
        self.record(BrokerCall::Mark(partition.clone(), offset));
        self.with_log(partition, |log| log.marked.push(offset));
    }

    async fn commit_offset(&self, partition: &PartitionKey, offset: Offset) -> Result<bool> {
        self.record(BrokerCall::Commit(partition.clone(), offset));
        if *self.fail_commits.lock().unwrap() {
            bail!("transport failure committing {partition}");
        }
        if *self.refuse_commits.lock().unwrap() {
            return Ok(false);
        }
        self.with_log(partition, |log| log.committed = Some(offset));
        Ok(true)
    }

    async fn pause(
        &self,
        partition: &PartitionKey,
        offset: Offset,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if *self.fail_pauses.lock().unwrap() {
            bail!("cannot pause {partition}");
        }
        self.record(BrokerCall::Pause(partition.clone(), offset, timeout));
        self.with_log(partition, |log| {
            log.paused = true;
            log.position = offset;
        });
        Ok(())
    }

    async fn resume(&self, partition: &PartitionKey) -> Result<()> {
        self.record(BrokerCall::Resume(partition.clone()));
        self.with_log(partition, |log| log.paused = false);
        Ok(())
    }

    async fn seek(&self, partition: &PartitionKey, offset: Offset) -> Result<()> {
        self.record(BrokerCall::Seek(partition.clone(), offset));
        self.with_log(partition, |log| log.position = offset);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingProducer {
    records: Mutex<Vec<DeadLetterRecord>>,
    fail: Mutex<bool>,
}

impl RecordingProducer {
    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

#[async_trait]
impl DeadLetterProducer for RecordingProducer {
    async fn produce(&self, record: DeadLetterRecord) -> Result<()> {
        if *self.fail.lock().unwrap() {
            bail!("dead letter topic {} unavailable", record.topic);
        }
        self.records.lock().unwrap().push(record);
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<Event>>,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: EventName) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.name == name)
            .count()
    }

    pub fn errors(&self, error_type: ErrorType) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.error_type() == Some(error_type))
            .count()
    }
}

impl Monitor for RecordingMonitor {
    fn instrument(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Builds a [`PartitionEnv`] wired to recording collaborators
pub struct TestEnv {
    partition: PartitionKey,
    topic: TopicConfig,
    broker: Arc<RecordingBroker>,
    producer: Option<Arc<RecordingProducer>>,
    monitor: Arc<RecordingMonitor>,
}

impl TestEnv {
    pub fn new(topic: &str, partition: i32) -> Self {
        Self {
            partition: PartitionKey::new(topic, partition),
            topic: TopicConfig::new(topic),
            broker: Arc::new(RecordingBroker::new()),
            producer: None,
            monitor: Arc::new(RecordingMonitor::default()),
        }
    }

    pub fn topic_config(mut self, topic: TopicConfig) -> Self {
        self.topic = topic;
        self
    }

    pub fn broker(mut self, broker: Arc<RecordingBroker>) -> Self {
        self.broker = broker;
        self
    }

    pub fn producer(mut self, producer: Arc<RecordingProducer>) -> Self {
        self.producer = Some(producer);
        self
    }

    pub fn monitor(mut self, monitor: Arc<RecordingMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn build(self) -> PartitionEnv {
        let coordinator = Arc::new(Coordinator::new(
            self.partition.clone(),
            self.topic.pause_tracker(),
        ));
        PartitionEnv {
            partition: self.partition,
            topic: Arc::new(self.topic),
            coordinator,
            client: self.broker,
            producer: self
                .producer
                .map(|producer| -> Arc<dyn DeadLetterProducer> { producer }),
            monitor: self.monitor,
        }
    }
}

/// Polls `condition` until it holds or `timeout` passes
pub async fn wait_for<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    condition()
}

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::{BrokerClient, DeadLetterProducer};
use crate::config::TopicConfig;
use crate::coordinator::Coordinator;
use crate::metrics_consts::{OFFSETS_MARKED, PARTITION_PAUSES, PARTITION_RESUMES, PAUSE_INTERVAL};
use crate::monitor::{ErrorType, Event, Monitor};
use crate::pause_tracker::PauseTracker;
use crate::types::{Message, MessageBatch, Offset, PartitionKey};

/// User business logic bound to one assigned partition.
///
/// One instance lives for the whole assignment, so state kept on `self` carries over
/// between batches of the same partition.
#[async_trait]
pub trait Consumer: Send + 'static {
    async fn consume(&mut self, messages: &MessageBatch, ctx: &mut ConsumerContext) -> Result<()>;

    /// Called once after the partition was taken away from this process
    async fn revoked(&mut self, _ctx: &mut ConsumerContext) -> Result<()> {
        Ok(())
    }

    /// Called once when the process shuts down while owning the partition
    async fn shutdown(&mut self, _ctx: &mut ConsumerContext) -> Result<()> {
        Ok(())
    }
}

/// Collaborators shared by everything working on one assigned partition
#[derive(Clone)]
pub struct PartitionEnv {
    pub partition: PartitionKey,
    pub topic: Arc<TopicConfig>,
    pub coordinator: Arc<Coordinator>,
    pub client: Arc<dyn BrokerClient>,
    pub producer: Option<Arc<dyn DeadLetterProducer>>,
    pub monitor: Arc<dyn Monitor>,
}

/// Per-partition state handed to user code and to the processing stages.
///
/// Offset and pause operations go to the broker client and keep the local state
/// (`seek_offset`, pause tracker) in step with what was sent.
pub struct ConsumerContext {
    env: PartitionEnv,
    messages: Option<Arc<MessageBatch>>,
    seek_offset: Option<Offset>,
}

impl ConsumerContext {
    pub fn new(env: PartitionEnv) -> Self {
        Self {
            env,
            messages: None,
            seek_offset: None,
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.env.partition
    }

    pub fn topic_config(&self) -> &TopicConfig {
        &self.env.topic
    }

    /// Batch currently being processed
    pub fn messages(&self) -> Option<&MessageBatch> {
        self.messages.as_deref()
    }

    /// Offset processing resumes from after an error
    pub fn seek_offset(&self) -> Option<Offset> {
        self.seek_offset
    }

    /// Consecutive attempts on the current data, 1 on the first try
    pub fn attempt(&self) -> u32 {
        self.env
            .coordinator
            .with_pause_tracker(|tracker| tracker.attempt())
    }

    pub fn is_revoked(&self) -> bool {
        self.env.coordinator.is_revoked()
    }

    /// Records `message` as consumed without waiting for the broker.
    ///
    /// Returns false once the partition is revoked. Marking an offset at or below one
    /// already marked is a no-op.
    pub fn mark_as_consumed(&mut self, message: &Message) -> bool {
        self.mark_through(message.offset())
    }

    /// Marks everything up to and including `offset`
    pub(crate) fn mark_through(&mut self, offset: Offset) -> bool {
        if self.is_revoked() {
            return false;
        }
        let next = offset + 1;
        if self.seek_offset.is_some_and(|seek| next <= seek) {
            return true;
        }

        self.env.client.mark_offset(&self.env.partition, next);
        self.seek_offset = Some(next);
        metrics::counter!(OFFSETS_MARKED, "topic" => self.env.partition.topic().to_string())
            .increment(1);
        true
    }

    /// Commits `message` and waits for the broker's answer.
    ///
    /// A refused commit means ownership was lost: the partition is treated as revoked
    /// and false is returned.
    pub async fn mark_as_consumed_sync(&mut self, message: &Message) -> bool {
        if self.is_revoked() {
            return false;
        }
        let next = (message.offset() + 1).max(self.seek_offset.unwrap_or(0));

        match self.env.client.commit_offset(&self.env.partition, next).await {
            Ok(true) => {
                self.seek_offset = Some(next);
                metrics::counter!(OFFSETS_MARKED, "topic" => self.env.partition.topic().to_string())
                    .increment(1);
                true
            }
            Ok(false) => {
                warn!(
                    topic = self.env.partition.topic(),
                    partition = self.env.partition.partition(),
                    offset = next,
                    "Commit refused, partition no longer owned"
                );
                self.env.coordinator.revoke();
                false
            }
            Err(e) => {
                self.env.monitor.instrument(&Event::error(
                    &self.env.partition,
                    ErrorType::Commit,
                    &e,
                ));
                false
            }
        }
    }

    /// Pauses the partition and rewinds it to `offset`.
    ///
    /// Without a timeout the current backoff interval is used. Pausing again while
    /// paused extends the pause. A manual pause is honored after the batch finishes:
    /// the runtime neither marks the batch nor resumes the partition.
    pub async fn pause(&mut self, offset: Offset, timeout: Option<Duration>) -> Result<()> {
        let (previous, remaining) = self.env.coordinator.with_pause_tracker(|tracker| {
            let previous = tracker.clone();
            tracker.pause(timeout);
            (previous, remaining_pause(tracker.paused_until()))
        });

        debug!(
            topic = self.env.partition.topic(),
            partition = self.env.partition.partition(),
            offset = offset,
            remaining_ms = remaining.as_millis(),
            "Pausing partition manually"
        );

        if let Err(e) = self
            .env
            .client
            .pause(&self.env.partition, offset, Some(remaining))
            .await
        {
            self.restore_pause_tracker(previous);
            return Err(e).with_context(|| format!("Failed to pause {}", self.env.partition));
        }

        self.env.coordinator.pause_manually();
        record_pause("manual", remaining);
        Ok(())
    }

    /// Resumes a paused partition right away
    pub async fn resume(&mut self) -> Result<()> {
        self.env
            .client
            .resume(&self.env.partition)
            .await
            .with_context(|| format!("Failed to resume {}", self.env.partition))?;
        self.env
            .coordinator
            .with_pause_tracker(|tracker| tracker.expire());
        metrics::counter!(PARTITION_RESUMES, "reason" => "manual").increment(1);
        Ok(())
    }

    /// Moves the fetch position to `offset`
    pub async fn seek(&mut self, offset: Offset) -> Result<()> {
        self.env
            .client
            .seek(&self.env.partition, offset)
            .await
            .with_context(|| format!("Failed to seek {} to {offset}", self.env.partition))
    }

    pub(crate) fn env(&self) -> &PartitionEnv {
        &self.env
    }

    pub(crate) fn coordinator(&self) -> &Arc<Coordinator> {
        &self.env.coordinator
    }

    pub(crate) fn batch(&self) -> Option<Arc<MessageBatch>> {
        self.messages.clone()
    }

    pub(crate) fn set_messages(&mut self, batch: MessageBatch) {
        self.messages = Some(Arc::new(batch));
    }

    pub(crate) fn init_seek_offset(&mut self, offset: Offset) {
        self.seek_offset.get_or_insert(offset);
    }

    pub(crate) fn set_seek_offset(&mut self, offset: Offset) {
        self.seek_offset = Some(offset);
    }

    /// Pauses with backoff at the first unprocessed offset so the data is fetched again
    /// once the pause expires.
    pub(crate) async fn retry_after_pause(&mut self) -> Result<()> {
        let Some(offset) = self
            .seek_offset
            .or_else(|| self.messages().map(|batch| batch.first().offset()))
        else {
            return Ok(());
        };

        let (previous, attempt, interval) = self.env.coordinator.with_pause_tracker(|tracker| {
            let previous = tracker.clone();
            (previous, tracker.attempt(), tracker.pause(None))
        });

        warn!(
            topic = self.env.partition.topic(),
            partition = self.env.partition.partition(),
            offset = offset,
            attempt = attempt,
            pause_ms = interval.as_millis(),
            "Batch failed, pausing partition before retry"
        );

        if let Err(e) = self
            .env
            .client
            .pause(&self.env.partition, offset, Some(interval))
            .await
        {
            self.restore_pause_tracker(previous);
            return Err(e)
                .with_context(|| format!("Failed to pause {} for retry", self.env.partition));
        }

        record_pause("retry", interval);
        Ok(())
    }

    // the broker never paused, so the tracker must not claim it did
    fn restore_pause_tracker(&self, previous: PauseTracker) {
        self.env
            .coordinator
            .with_pause_tracker(|tracker| *tracker = previous);
    }

    /// Resumes a broker pause the pause tracker does not know about
    pub(crate) async fn resume_untimed(&self, reason: &'static str) -> Result<()> {
        metrics::counter!(PARTITION_RESUMES, "reason" => reason).increment(1);
        self.env
            .client
            .resume(&self.env.partition)
            .await
            .with_context(|| format!("Failed to resume {}", self.env.partition))
    }
}

fn remaining_pause(until: Option<Instant>) -> Duration {
    until
        .map(|until| until.saturating_duration_since(Instant::now()))
        .unwrap_or_default()
}

fn record_pause(reason: &'static str, interval: Duration) {
    metrics::counter!(PARTITION_PAUSES, "reason" => reason).increment(1);
    metrics::histogram!(PAUSE_INTERVAL, "reason" => reason).record(interval.as_secs_f64());
}

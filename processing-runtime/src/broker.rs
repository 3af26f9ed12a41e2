use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::types::{Message, MessageBatch, Offset, PartitionKey};

/// Partition-level operations of the broker client.
///
/// Connection handling, fetching and commit transport live behind this trait. The runtime
/// only ever talks to partitions it has been told are assigned.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    /// Next batch for `partition`, or `None` when nothing is buffered or the partition is
    /// paused.
    async fn poll(&self, partition: &PartitionKey) -> Result<Option<MessageBatch>>;

    /// Stores `offset` as the next offset to commit. Does not wait for the broker.
    fn mark_offset(&self, partition: &PartitionKey, offset: Offset);

    /// Commits `offset` and waits for the broker. `Ok(false)` means the commit was
    /// refused, typically because the partition is no longer owned.
    async fn commit_offset(&self, partition: &PartitionKey, offset: Offset) -> Result<bool>;

    /// Stops fetching and rewinds the fetch position to `offset`. `None` pauses until an
    /// explicit resume.
    async fn pause(
        &self,
        partition: &PartitionKey,
        offset: Offset,
        timeout: Option<Duration>,
    ) -> Result<()>;

    async fn resume(&self, partition: &PartitionKey) -> Result<()>;

    async fn seek(&self, partition: &PartitionKey, offset: Offset) -> Result<()>;
}

/// Rebalance callbacks invoked by the broker client
#[async_trait]
pub trait RebalanceListener: Send + Sync {
    async fn on_assigned(&self, partitions: &[PartitionKey]);

    async fn on_revoked(&self, partitions: &[PartitionKey]);
}

/// A message republished verbatim to a dead letter topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterRecord {
    pub topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub source: PartitionKey,
    pub source_offset: Offset,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn from_message(topic: impl Into<String>, message: &Message) -> Self {
        Self {
            topic: topic.into(),
            key: message.key().cloned(),
            payload: message.raw_payload().clone(),
            source: message.partition_key(),
            source_offset: message.offset(),
            timestamp: message.timestamp(),
        }
    }
}

#[async_trait]
pub trait DeadLetterProducer: Send + Sync {
    async fn produce(&self, record: DeadLetterRecord) -> Result<()>;
}

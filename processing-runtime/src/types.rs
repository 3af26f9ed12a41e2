use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::error::RuntimeError;

/// Offsets are non-negative and grow monotonically within a partition.
pub type Offset = i64;

/// Identity of one ordered stream shard. Used as the unit of concurrency everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionKey {
    topic: String,
    partition: i32,
}

impl PartitionKey {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition)
    }
}

/// A single record fetched from a partition. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    topic: String,
    partition: i32,
    offset: Offset,
    key: Option<Bytes>,
    raw_payload: Bytes,
    timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: Offset,
        raw_payload: impl Into<Bytes>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key: None,
            raw_payload: raw_payload.into(),
            timestamp,
        }
    }

    pub fn with_key(mut self, key: impl Into<Bytes>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.key.as_ref()
    }

    pub fn raw_payload(&self) -> &Bytes {
        &self.raw_payload
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn partition_key(&self) -> PartitionKey {
        PartitionKey::new(self.topic.clone(), self.partition)
    }

    fn belongs_to(&self, key: &PartitionKey) -> bool {
        self.partition == key.partition() && self.topic == key.topic()
    }
}

/// Ordered, non-empty group of messages of one partition with strictly increasing offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    partition: PartitionKey,
    messages: Vec<Message>,
    fetched_through: Offset,
}

impl MessageBatch {
    /// Validates the batch contract and builds the batch.
    pub fn new(messages: Vec<Message>) -> Result<Self, RuntimeError> {
        let Some(first) = messages.first() else {
            return Err(RuntimeError::InvalidBatch("batch is empty".to_string()));
        };
        let partition = first.partition_key();

        if let Some(stranger) = messages.iter().find(|m| !m.belongs_to(&partition)) {
            return Err(RuntimeError::InvalidBatch(format!(
                "message at offset {} belongs to {}:{}, batch is for {partition}",
                stranger.offset(),
                stranger.topic(),
                stranger.partition()
            )));
        }

        if let Some(pair) = messages
            .windows(2)
            .find(|pair| pair[1].offset() <= pair[0].offset())
        {
            return Err(RuntimeError::InvalidBatch(format!(
                "offsets must be strictly increasing, got {} after {}",
                pair[1].offset(),
                pair[0].offset()
            )));
        }

        let fetched_through = messages[messages.len() - 1].offset();
        Ok(Self {
            partition,
            messages,
            fetched_through,
        })
    }

    pub fn partition_key(&self) -> &PartitionKey {
        &self.partition
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn first(&self) -> &Message {
        &self.messages[0]
    }

    pub fn last(&self) -> &Message {
        &self.messages[self.messages.len() - 1]
    }

    /// Offset of the last fetched message, counting messages filtered out of this batch
    pub fn fetched_through(&self) -> Offset {
        self.fetched_through
    }

    /// Message with exactly this offset, if it is part of the batch
    pub fn find(&self, offset: Offset) -> Option<&Message> {
        self.messages
            .binary_search_by_key(&offset, Message::offset)
            .ok()
            .map(|idx| &self.messages[idx])
    }

    /// First message at or after `offset`
    pub fn first_from(&self, offset: Offset) -> Option<&Message> {
        self.messages.iter().find(|m| m.offset() >= offset)
    }

    /// Keeps the messages accepted by `keep`. Returns `None` when nothing is left,
    /// since an empty batch is not a valid batch. The fetched range is preserved.
    pub fn retain<F>(&self, mut keep: F) -> Option<MessageBatch>
    where
        F: FnMut(&Message) -> bool,
    {
        let messages: Vec<Message> = self.messages.iter().filter(|m| keep(m)).cloned().collect();
        if messages.is_empty() {
            return None;
        }
        Some(Self {
            partition: self.partition.clone(),
            messages,
            fetched_through: self.fetched_through,
        })
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }
}

impl<'a> IntoIterator for &'a MessageBatch {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(topic: &str, partition: i32, offset: Offset) -> Message {
        Message::new(topic, partition, offset, format!("payload-{offset}"), Utc::now())
    }

    #[test]
    fn test_batch_accepts_ordered_messages_of_one_partition() {
        let batch = MessageBatch::new(vec![
            message("events", 0, 3),
            message("events", 0, 4),
            message("events", 0, 7),
        ])
        .unwrap();

        assert_eq!(batch.partition_key(), &PartitionKey::new("events", 0));
        assert_eq!(batch.len(), 3);
        assert_eq!(batch.first().offset(), 3);
        assert_eq!(batch.last().offset(), 7);
        assert_eq!(batch.find(4).map(Message::offset), Some(4));
        assert!(batch.find(5).is_none());
        assert_eq!(batch.first_from(5).map(Message::offset), Some(7));
    }

    #[test]
    fn test_batch_rejects_empty() {
        assert!(matches!(
            MessageBatch::new(vec![]),
            Err(RuntimeError::InvalidBatch(_))
        ));
    }

    #[test]
    fn test_batch_rejects_mixed_partitions() {
        let result = MessageBatch::new(vec![message("events", 0, 1), message("events", 1, 2)]);
        assert!(matches!(result, Err(RuntimeError::InvalidBatch(_))));

        let result = MessageBatch::new(vec![message("events", 0, 1), message("other", 0, 2)]);
        assert!(matches!(result, Err(RuntimeError::InvalidBatch(_))));
    }

    #[test]
    fn test_batch_rejects_non_increasing_offsets() {
        let result = MessageBatch::new(vec![message("events", 0, 5), message("events", 0, 5)]);
        assert!(matches!(result, Err(RuntimeError::InvalidBatch(_))));

        let result = MessageBatch::new(vec![message("events", 0, 5), message("events", 0, 2)]);
        assert!(matches!(result, Err(RuntimeError::InvalidBatch(_))));
    }

    #[test]
    fn test_retain_keeps_order_and_drops_empty_results() {
        let batch = MessageBatch::new((0..6).map(|o| message("events", 2, o)).collect()).unwrap();

        let odd = batch.retain(|m| m.offset() % 2 == 1).unwrap();
        let offsets: Vec<Offset> = odd.iter().map(Message::offset).collect();
        assert_eq!(offsets, vec![1, 3, 5]);
        assert_eq!(odd.partition_key(), batch.partition_key());

        assert!(batch.retain(|_| false).is_none());
    }

    #[test]
    fn test_retain_remembers_filtered_tail() {
        let batch = MessageBatch::new((0..6).map(|o| message("events", 2, o)).collect()).unwrap();
        assert_eq!(batch.fetched_through(), 5);

        let head = batch.retain(|m| m.offset() < 2).unwrap();
        assert_eq!(head.last().offset(), 1);
        assert_eq!(head.fetched_through(), 5);
    }

    #[test]
    fn test_partition_key_display() {
        assert_eq!(PartitionKey::new("events", 12).to_string(), "events:12");
    }
}

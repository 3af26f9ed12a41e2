use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::metrics_consts::MONITOR_EVENTS;
use crate::types::PartitionKey;

/// Lifecycle events reported to the monitoring collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventName {
    Consume,
    Consumed,
    Revoked,
    Shutdown,
    DeadLetter,
    ErrorOccurred,
}

impl EventName {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventName::Consume => "consumer.consume",
            EventName::Consumed => "consumer.consumed",
            EventName::Revoked => "consumer.revoked",
            EventName::Shutdown => "consumer.shutdown",
            EventName::DeadLetter => "consumer.dead_letter",
            EventName::ErrorOccurred => "error.occurred",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The phase an `error.occurred` event comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorType {
    Consume,
    Revoked,
    Shutdown,
    DeadLetter,
    Commit,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::Consume => "consumer.consume.error",
            ErrorType::Revoked => "consumer.revoked.error",
            ErrorType::Shutdown => "consumer.shutdown.error",
            ErrorType::DeadLetter => "consumer.dead_letter.error",
            ErrorType::Commit => "consumer.commit.error",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: EventName,
    pub partition: PartitionKey,
    /// Phase tag and rendered error chain, set for `error.occurred`
    pub error: Option<(ErrorType, String)>,
    pub message_count: Option<usize>,
    pub duration: Option<Duration>,
}

impl Event {
    pub fn new(name: EventName, partition: &PartitionKey) -> Self {
        Self {
            name,
            partition: partition.clone(),
            error: None,
            message_count: None,
            duration: None,
        }
    }

    pub fn error(partition: &PartitionKey, error_type: ErrorType, error: &anyhow::Error) -> Self {
        Self {
            error: Some((error_type, format!("{error:#}"))),
            ..Self::new(EventName::ErrorOccurred, partition)
        }
    }

    pub fn with_message_count(mut self, count: usize) -> Self {
        self.message_count = Some(count);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn error_type(&self) -> Option<ErrorType> {
        self.error.as_ref().map(|(error_type, _)| *error_type)
    }
}

/// Receives structured lifecycle events. The runtime never depends on what it does.
pub trait Monitor: Send + Sync {
    fn instrument(&self, event: &Event);
}

/// Default monitor: logs every event and counts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl Monitor for TracingMonitor {
    fn instrument(&self, event: &Event) {
        let topic = event.partition.topic();
        let partition = event.partition.partition();

        match &event.error {
            Some((error_type, message)) => {
                error!(
                    topic = topic,
                    partition = partition,
                    error_type = error_type.as_str(),
                    "Error occurred: {}",
                    message
                );
            }
            None => match event.name {
                EventName::Revoked | EventName::Shutdown | EventName::DeadLetter => {
                    info!(
                        topic = topic,
                        partition = partition,
                        event = event.name.as_str(),
                        message_count = ?event.message_count,
                        "Consumer event"
                    );
                }
                _ => {
                    debug!(
                        topic = topic,
                        partition = partition,
                        event = event.name.as_str(),
                        message_count = ?event.message_count,
                        duration_ms = ?event.duration.map(|d| d.as_millis()),
                        "Consumer event"
                    );
                }
            },
        }

        let error_type = event.error_type().map(|t| t.as_str()).unwrap_or("none");
        metrics::counter!(
            MONITOR_EVENTS,
            "event" => event.name.as_str(),
            "error_type" => error_type
        )
        .increment(1);
    }
}

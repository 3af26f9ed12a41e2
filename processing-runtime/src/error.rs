use std::time::Duration;

use thiserror::Error;

use crate::types::PartitionKey;

/// Errors raised by the runtime's own bookkeeping.
///
/// User code and broker collaborators report `anyhow::Error` instead; those never
/// show up here.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("jobs queue is closed")]
    QueueClosed,

    #[error("jobs queue is draining, {0} jobs are no longer accepted")]
    QueueDraining(&'static str),

    #[error("partition {0} has been revoked")]
    PartitionRevoked(PartitionKey),

    #[error("partition {0} is not assigned")]
    PartitionNotAssigned(PartitionKey),

    #[error("no route configured for topic {0}")]
    UnknownRoute(String),

    #[error("invalid batch: {0}")]
    InvalidBatch(String),

    #[error("shutdown did not complete within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration validation failures
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("concurrency must be greater than 0")]
    ZeroConcurrency,

    #[error("{0} must be greater than 0")]
    ZeroTimeout(&'static str),

    #[error("pause timeout ({timeout:?}) cannot exceed pause max timeout ({max_timeout:?})")]
    PauseTimeoutAboveMax {
        timeout: Duration,
        max_timeout: Duration,
    },

    #[error("max wait time ({max_wait_time:?}) must be shorter than shutdown timeout ({shutdown_timeout:?})")]
    ShutdownTimeoutTooShort {
        max_wait_time: Duration,
        shutdown_timeout: Duration,
    },

    #[error("dead letter topic for {0} cannot be the topic itself")]
    DeadLetterLoop(String),

    #[error("dead letter queue configured for {0} but no dead letter producer was provided")]
    MissingDeadLetterProducer(String),
}

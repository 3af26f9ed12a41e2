//! Partition processing runtime.
//!
//! Consumes partitioned, ordered message streams and dispatches per-partition work onto a
//! bounded worker pool while keeping strict ordering inside each partition and
//! at-least-once processing across failures, pauses and rebalances.
//!
//! Flow of one batch:
//!
//! ```text
//! Listener::poll ──► Scheduler::schedule_consumption ──► JobsQueue ──► worker
//!                         │ (before_enqueue)                            │
//!                         ▼                                             ▼
//!                    Coordinator (+1 in flight)          Executor: before_consume
//!                                                                  consume ──► Outcome
//!                                                                  Coordinator (result, -1)
//!                                                                  after_consume (mark / pause)
//! ```
//!
//! ## Error logging (anyhow)
//!
//! User code and broker collaborators report `anyhow::Error`. When logging them, use
//! formats that include the full chain so root causes are visible:
//!
//! - **Inline format:** `{e:#}` prints the full chain on one line.
//! - **Structured field:** `error = ?e` prints the chain with `Caused by:` sections.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod jobs;
pub mod jobs_queue;
pub mod metrics_consts;
pub mod monitor;
pub mod pause_tracker;
pub mod routes;
pub mod runtime;
pub mod scheduler;
pub mod strategy;
pub mod test_utils;
pub mod types;
pub mod worker;

// Re-export commonly used types for convenience
pub use broker::{BrokerClient, DeadLetterProducer, DeadLetterRecord, RebalanceListener};
pub use config::{Config, DeadLetterQueueConfig, TopicConfig};
pub use consumer::{Consumer, ConsumerContext};
pub use coordinator::Coordinator;
pub use error::{ConfigError, RuntimeError};
pub use monitor::{Event, Monitor, TracingMonitor};
pub use pause_tracker::PauseTracker;
pub use routes::Routes;
pub use runtime::{Runtime, RuntimeBuilder};
pub use strategy::{ExecutionPlan, MessageFilter, Outcome};
pub use types::{Message, MessageBatch, Offset, PartitionKey};

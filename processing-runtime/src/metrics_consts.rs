// ==== Jobs queue metrics ====
/// Counter for jobs admitted into the queue, labeled by job kind
pub const JOBS_ENQUEUED: &str = "processing_jobs_enqueued_total";

/// Counter for jobs dropped without running (revocation, shutdown, closed queue)
pub const JOBS_DISCARDED: &str = "processing_jobs_discarded_total";

/// Counter for jobs a worker finished, labeled by job kind and status
pub const JOBS_COMPLETED: &str = "processing_jobs_completed_total";

/// Gauge for jobs waiting in the queue
pub const JOBS_QUEUE_DEPTH: &str = "processing_jobs_queue_depth";

/// Gauge for blocking jobs currently running
pub const JOBS_RUNNING_BLOCKING: &str = "processing_jobs_running_blocking";

// ==== Worker metrics ====
/// Gauge for workers currently executing a job
pub const WORKERS_BUSY: &str = "processing_workers_busy";

// ==== Consumption metrics ====
/// Histogram for user consume duration in seconds
pub const CONSUME_DURATION: &str = "processing_consume_duration_seconds";

/// Counter for batches whose consume failed (error or panic)
pub const CONSUME_ERRORS: &str = "processing_consume_errors_total";

/// Counter for batches processed, labeled by outcome
pub const BATCHES_PROCESSED: &str = "processing_batches_processed_total";

/// Counter for messages whose offset was marked as consumed
pub const OFFSETS_MARKED: &str = "processing_offsets_marked_total";

// ==== Pause metrics ====
/// Counter for partition pauses, labeled by reason (retry, manual, long_running)
pub const PARTITION_PAUSES: &str = "processing_partition_pauses_total";

/// Counter for partition resumes, labeled by reason
pub const PARTITION_RESUMES: &str = "processing_partition_resumes_total";

/// Histogram for pause intervals in seconds
pub const PAUSE_INTERVAL: &str = "processing_pause_interval_seconds";

// ==== Dead letter metrics ====
/// Counter for messages republished to a dead letter topic
pub const DEAD_LETTER_DISPATCHED: &str = "processing_dead_letter_dispatched_total";

// ==== Rebalance metrics ====
/// Gauge for partitions currently assigned to this process
pub const ASSIGNED_PARTITIONS: &str = "processing_assigned_partitions";

/// Counter for partition revocations handled
pub const PARTITIONS_REVOKED: &str = "processing_partitions_revoked_total";

// ==== Monitor metrics ====
/// Counter for monitor events, labeled by event name
pub const MONITOR_EVENTS: &str = "processing_monitor_events_total";

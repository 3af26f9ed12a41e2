mod common;

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use common::{Harness, Journal};
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use processing_runtime::metrics_consts::{
    BATCHES_PROCESSED, DEAD_LETTER_DISPATCHED, OFFSETS_MARKED, PARTITION_PAUSES,
};
use processing_runtime::test_utils::{wait_for, RecordingBroker};
use processing_runtime::{Config, PartitionKey, Routes, TopicConfig};

fn snapshotter() -> &'static Snapshotter {
    // Install a global debugging recorder once per test process
    static SNAPSHOTTER: OnceLock<Snapshotter> = OnceLock::new();
    SNAPSHOTTER.get_or_init(|| {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        drop(recorder.install());
        snapshotter
    })
}

/// Sum of a counter across all label sets
fn counter(name: &str) -> u64 {
    snapshotter()
        .snapshot()
        .into_vec()
        .into_iter()
        .filter(|(key, _, _, _)| key.key().name() == name)
        .map(|(_, _, _, value)| match value {
            DebugValue::Counter(v) => v,
            _ => 0,
        })
        .sum()
}

#[tokio::test(start_paused = true)]
async fn test_dead_letter_flow_reports_metrics() {
    snapshotter();

    let journal = Journal::new();
    let routes = Routes::new().add(
        TopicConfig::new("events")
            .pause_timeout(Duration::from_millis(100))
            .dead_letter_queue("events_dlq", 1),
        journal.factory(|batch, _| batch.first().offset() == 0),
    );
    let broker = Arc::new(RecordingBroker::with_max_batch(1));
    broker.produce("events", 0, 2);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.assign(&[PartitionKey::new("events", 0)]);

    assert!(wait_for(Duration::from_secs(10), || {
        journal.processed(&PartitionKey::new("events", 0)) == vec![1]
    })
    .await);
    harness.stop().await.unwrap();

    assert_eq!(counter(DEAD_LETTER_DISPATCHED), 1);
    assert_eq!(counter(PARTITION_PAUSES), 1);
    assert_eq!(counter(BATCHES_PROCESSED), 3);
    assert_eq!(counter(OFFSETS_MARKED), 2);
}

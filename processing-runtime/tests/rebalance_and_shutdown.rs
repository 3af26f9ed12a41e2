mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, Journal};
use processing_runtime::monitor::{ErrorType, EventName};
use processing_runtime::test_utils::{batch, wait_for, RecordingBroker};
use processing_runtime::{
    Config, PartitionKey, RebalanceListener, Routes, RuntimeError, TopicConfig,
};

fn events(partition: i32) -> PartitionKey {
    PartitionKey::new("events", partition)
}

#[tokio::test(start_paused = true)]
async fn test_long_running_job_revoked_mid_consume() {
    let journal = Journal::holding();
    let routes = Routes::new().add(
        TopicConfig::new("events").long_running_job(true),
        journal.factory(|_, _| false),
    );
    let broker = Arc::new(RecordingBroker::new());
    broker.produce("events", 0, 3);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.on_assigned(&[events(0)]).await;
    journal.wait_started().await;

    // fetching stops for the whole run
    assert_eq!(harness.broker.pauses(&events(0)), vec![(3, None)]);
    assert!(harness.broker.is_paused(&events(0)));

    harness.runtime.on_revoked(&[events(0)]).await;
    assert!(!harness.broker.is_paused(&events(0)));
    assert!(harness.runtime.assigned().is_empty());
    assert!(harness
        .runtime
        .dispatch(batch("events", 0, 3..4))
        .await
        .is_err());

    journal.release();
    assert!(wait_for(Duration::from_secs(5), || journal.revoked() == 1).await);
    assert!(
        wait_for(Duration::from_secs(5), || harness
            .runtime
            .coordinators()
            .get(&events(0))
            .is_none())
        .await
    );

    // the batch finished but its offsets belong to the next owner now
    assert_eq!(journal.successes(), 1);
    assert!(harness.broker.marked(&events(0)).is_empty());
    assert!(!harness.broker.is_paused(&events(0)));
    assert_eq!(harness.monitor.count(EventName::Revoked), 1);

    harness.stop().await.unwrap();
    assert_eq!(journal.revoked(), 1);
    assert_eq!(journal.shutdown(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_long_running_job_resumes_after_success() {
    let journal = Journal::new();
    let routes = Routes::new().add(
        TopicConfig::new("events").long_running_job(true),
        journal.factory(|_, _| false),
    );
    let broker = Arc::new(RecordingBroker::with_max_batch(2));
    broker.produce("events", 0, 4);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.assign(&[events(0)]);

    assert!(
        wait_for(Duration::from_secs(5), || journal.processed(&events(0)) == vec![0, 1, 2, 3]).await
    );
    assert!(wait_for(Duration::from_secs(1), || !harness.broker.is_paused(&events(0))).await);
    assert_eq!(
        harness.broker.pauses(&events(0)),
        vec![(2, None), (4, None)]
    );
    assert_eq!(harness.broker.committed(&events(0)), Some(4));

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_long_running_job_failure_retries_behind_a_timed_pause() {
    let journal = Journal::new();
    let routes = Routes::new().add(
        TopicConfig::new("events")
            .long_running_job(true)
            .pause_timeout(Duration::from_millis(100)),
        journal.factory(|_, attempt| attempt == 1),
    );
    let broker = Arc::new(RecordingBroker::new());
    broker.produce("events", 0, 3);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.assign(&[events(0)]);

    assert!(wait_for(Duration::from_secs(5), || journal.successes() == 1).await);
    assert!(wait_for(Duration::from_secs(1), || !harness.broker.is_paused(&events(0))).await);

    // the retry pause rewinds to the batch start and replaces the untimed one
    assert_eq!(
        harness.broker.pauses(&events(0)),
        vec![
            (3, None),
            (0, Some(Duration::from_millis(100))),
            (3, None),
        ]
    );
    let attempts: Vec<_> = journal.consumed().iter().map(|c| c.attempt).collect();
    assert_eq!(attempts, vec![1, 2]);
    assert_eq!(harness.broker.committed(&events(0)), Some(3));
    assert_eq!(harness.monitor.errors(ErrorType::Consume), 1);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_revocation_drops_pending_batches() {
    let journal = Journal::holding();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let harness = Harness::new(
        Config::default_for_test(),
        routes,
        Arc::new(RecordingBroker::new()),
    );
    harness.runtime.assign(&[events(0)]);

    harness
        .runtime
        .dispatch(batch("events", 0, 0..2))
        .await
        .unwrap();
    journal.wait_started().await;
    harness
        .runtime
        .dispatch(batch("events", 0, 2..4))
        .await
        .unwrap();
    assert_eq!(harness.runtime.queue().pending(), 1);

    harness.runtime.revoke(&[events(0)]).await;
    let coordinator = harness
        .runtime
        .coordinators()
        .get(&events(0))
        .expect("coordinator kept while a job runs");
    assert!(coordinator.is_revoked());
    assert_eq!(coordinator.in_flight(), 1);

    journal.release();
    assert!(wait_for(Duration::from_secs(5), || journal.revoked() == 1).await);

    let consumed = journal.consumed();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].offsets, vec![0, 1]);
    assert!(harness.broker.marked(&events(0)).is_empty());
    assert_eq!(coordinator.in_flight(), 0);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_reassigned_partition_starts_fresh() {
    let journal = Journal::new();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let broker = Arc::new(RecordingBroker::new());
    broker.produce("events", 0, 2);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.assign(&[events(0)]);
    assert!(wait_for(Duration::from_secs(5), || journal.successes() == 1).await);
    let first = harness.runtime.coordinators().get(&events(0)).unwrap();

    harness.runtime.revoke(&[events(0)]).await;
    assert!(wait_for(Duration::from_secs(5), || journal.revoked() == 1).await);

    harness.runtime.assign(&[events(0)]);
    let second = harness.runtime.coordinators().get(&events(0)).unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_revoked());

    harness.broker.produce("events", 0, 2);
    assert!(
        wait_for(Duration::from_secs(5), || journal.processed(&events(0)) == vec![0, 1, 2, 3]).await
    );

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_unknown_topic_is_not_assigned() {
    let journal = Journal::new();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let harness = Harness::new(
        Config::default_for_test(),
        routes,
        Arc::new(RecordingBroker::new()),
    );

    harness
        .runtime
        .assign(&[events(0), PartitionKey::new("clicks", 0)]);
    assert_eq!(harness.runtime.assigned(), vec![events(0)]);

    harness.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_runs_every_partition_hook_once() {
    let journal = Journal::new();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let broker = Arc::new(RecordingBroker::new());
    broker.produce("events", 0, 2);
    broker.produce("events", 1, 2);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.assign(&[events(0), events(1)]);
    assert!(wait_for(Duration::from_secs(5), || journal.successes() == 2).await);

    let runtime = Arc::clone(&harness.runtime);
    harness.stop().await.unwrap();

    assert_eq!(journal.shutdown(), 2);
    assert!(runtime.queue().is_closed());

    // a second shutdown has nothing left to do
    runtime.shutdown().await.unwrap();
    assert_eq!(journal.shutdown(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_running_job() {
    let journal = Journal::holding();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let harness = Harness::new(
        Config::default_for_test(),
        routes,
        Arc::new(RecordingBroker::new()),
    );
    harness.runtime.assign(&[events(0)]);
    harness
        .runtime
        .dispatch(batch("events", 0, 0..2))
        .await
        .unwrap();
    journal.wait_started().await;

    let stopping = {
        let runtime = Arc::clone(&harness.runtime);
        tokio::spawn(async move { runtime.shutdown().await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!stopping.is_finished());
    assert_eq!(journal.shutdown(), 0);

    journal.release();
    stopping.await.unwrap().unwrap();

    assert_eq!(journal.successes(), 1);
    assert_eq!(harness.broker.marked(&events(0)), vec![2]);
    assert_eq!(journal.shutdown(), 1);
    assert_eq!(harness.monitor.count(EventName::Shutdown), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_gives_up_on_stuck_job() {
    let journal = Journal::holding();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let mut config = Config::default_for_test();
    config.shutdown_timeout_ms = 500;
    let harness = Harness::new(config, routes, Arc::new(RecordingBroker::new()));
    harness.runtime.assign(&[events(0)]);
    harness
        .runtime
        .dispatch(batch("events", 0, 0..2))
        .await
        .unwrap();
    journal.wait_started().await;

    let result = harness.stop().await;
    assert!(matches!(
        result,
        Err(RuntimeError::ShutdownTimeout(timeout)) if timeout == Duration::from_millis(500)
    ));
    assert_eq!(journal.shutdown(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_revoked_hook_does_not_block_shutdown() {
    let journal = Journal::new();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let broker = Arc::new(RecordingBroker::new());
    broker.produce("events", 0, 2);
    broker.produce("events", 1, 2);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.assign(&[events(0), events(1)]);
    assert!(wait_for(Duration::from_secs(5), || journal.successes() == 2).await);

    journal.panic_in_revoked();
    harness.runtime.revoke(&[events(0)]).await;
    assert!(
        wait_for(Duration::from_secs(5), || harness.monitor.errors(ErrorType::Revoked) == 1).await
    );
    assert!(wait_for(Duration::from_secs(5), || harness.runtime.queue().is_empty()).await);
    assert_eq!(journal.revoked(), 1);
    assert!(
        wait_for(Duration::from_secs(5), || harness
            .runtime
            .coordinators()
            .get(&events(0))
            .is_none())
        .await
    );

    harness.stop().await.unwrap();
    assert_eq!(journal.shutdown(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_panicking_shutdown_hook_is_reported() {
    let journal = Journal::new();
    let routes = Routes::new().add(TopicConfig::new("events"), journal.factory(|_, _| false));
    let broker = Arc::new(RecordingBroker::new());
    broker.produce("events", 0, 2);
    broker.produce("events", 1, 2);

    let harness = Harness::start(Config::default_for_test(), routes, broker);
    harness.runtime.assign(&[events(0), events(1)]);
    assert!(wait_for(Duration::from_secs(5), || journal.successes() == 2).await);

    journal.panic_in_shutdown();
    let monitor = Arc::clone(&harness.monitor);
    harness.stop().await.unwrap();

    assert_eq!(journal.shutdown(), 2);
    assert_eq!(monitor.errors(ErrorType::Shutdown), 2);
}

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::consumer::{Consumer, ConsumerContext};
use crate::metrics_consts::{BATCHES_PROCESSED, CONSUME_DURATION, CONSUME_ERRORS};
use crate::monitor::{ErrorType, Event, EventName};
use crate::strategy::{Next, Outcome, Stage};

/// Base flow: automatic offset marking on success, pause and retry on failure.
/// Always the innermost stage, so it never delegates.
pub struct DefaultStage;

#[async_trait]
impl Stage for DefaultStage {
    fn name(&self) -> &'static str {
        "default"
    }

    async fn before_consume(
        &self,
        ctx: &mut ConsumerContext,
        _next: Next<'_>,
    ) -> anyhow::Result<()> {
        let coordinator = ctx.coordinator();
        coordinator.start();
        coordinator.with_pause_tracker(|tracker| tracker.increment());

        if let Some(first) = ctx.messages().map(|batch| batch.first().offset()) {
            ctx.init_seek_offset(first);
        }
        Ok(())
    }

    async fn consume(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
        _next: Next<'_>,
    ) -> Outcome {
        if ctx.is_revoked() {
            return Outcome::Skip;
        }
        let Some(batch) = ctx.batch() else {
            return Outcome::Skip;
        };

        let partition = ctx.partition().clone();
        let monitor = Arc::clone(&ctx.env().monitor);
        monitor.instrument(
            &Event::new(EventName::Consume, &partition).with_message_count(batch.len()),
        );

        let started = Instant::now();
        let result = guard_user_hook("consume", consumer.consume(&batch, ctx)).await;
        let elapsed = started.elapsed();

        metrics::histogram!(CONSUME_DURATION, "topic" => partition.topic().to_string())
            .record(elapsed.as_secs_f64());

        match result {
            Ok(()) => {
                debug!(
                    topic = partition.topic(),
                    partition = partition.partition(),
                    first_offset = batch.first().offset(),
                    last_offset = batch.last().offset(),
                    duration_ms = elapsed.as_millis(),
                    "Batch consumed"
                );
                metrics::counter!(BATCHES_PROCESSED, "outcome" => "success").increment(1);
                monitor.instrument(
                    &Event::new(EventName::Consumed, &partition)
                        .with_message_count(batch.len())
                        .with_duration(elapsed),
                );
                Outcome::Success
            }
            Err(e) => {
                metrics::counter!(CONSUME_ERRORS, "topic" => partition.topic().to_string())
                    .increment(1);
                metrics::counter!(BATCHES_PROCESSED, "outcome" => "failure").increment(1);
                monitor.instrument(&Event::error(&partition, ErrorType::Consume, &e));
                Outcome::Failure(e)
            }
        }
    }

    async fn after_consume(
        &self,
        ctx: &mut ConsumerContext,
        _next: Next<'_>,
    ) -> anyhow::Result<()> {
        let coordinator = Arc::clone(ctx.coordinator());
        if coordinator.is_revoked() {
            debug!(
                topic = ctx.partition().topic(),
                partition = ctx.partition().partition(),
                "Partition revoked during processing, leaving offsets untouched"
            );
            return Ok(());
        }

        if coordinator.is_success() {
            coordinator.with_pause_tracker(|tracker| tracker.reset());
            if !coordinator.is_manual_pause() {
                // filtered messages after the last consumed one are done as well
                if let Some(batch) = ctx.batch() {
                    ctx.mark_through(batch.fetched_through());
                }
            }
            return Ok(());
        }

        ctx.retry_after_pause().await
    }

    async fn idle(&self, ctx: &mut ConsumerContext, _next: Next<'_>) -> anyhow::Result<()> {
        if ctx.is_revoked() {
            return Ok(());
        }
        if let Some(batch) = ctx.batch() {
            ctx.mark_through(batch.fetched_through());
        }
        Ok(())
    }

    async fn revoked(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
        _next: Next<'_>,
    ) -> anyhow::Result<()> {
        // the next owner must get an unpaused partition
        if let Err(e) = ctx.resume().await {
            warn!(
                topic = ctx.partition().topic(),
                partition = ctx.partition().partition(),
                "Failed to resume revoked partition: {e:#}"
            );
        }
        ctx.coordinator().revoke();

        let partition = ctx.partition().clone();
        let monitor = Arc::clone(&ctx.env().monitor);
        monitor.instrument(&Event::new(EventName::Revoked, &partition));

        guard_user_hook("revoked", consumer.revoked(ctx))
            .await
            .map_err(|e| {
                monitor.instrument(&Event::error(&partition, ErrorType::Revoked, &e));
                e
            })
    }

    async fn shutdown(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
        _next: Next<'_>,
    ) -> anyhow::Result<()> {
        let partition = ctx.partition().clone();
        let monitor = Arc::clone(&ctx.env().monitor);
        monitor.instrument(&Event::new(EventName::Shutdown, &partition));

        guard_user_hook("shutdown", consumer.shutdown(ctx))
            .await
            .map_err(|e| {
                monitor.instrument(&Event::error(&partition, ErrorType::Shutdown, &e));
                e
            })
    }
}

/// Runs a user hook, turning a panic into an error so the job still finishes
async fn guard_user_hook<F>(hook: &'static str, hook_future: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>> + Send,
{
    AssertUnwindSafe(hook_future)
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| Err(anyhow!("{hook} panicked: {}", panic_message(&*panic))))
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic payload"
    }
}

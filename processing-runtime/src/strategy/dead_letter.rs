use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::broker::DeadLetterRecord;
use crate::config::DeadLetterQueueConfig;
use crate::consumer::ConsumerContext;
use crate::metrics_consts::DEAD_LETTER_DISPATCHED;
use crate::monitor::{ErrorType, Event, EventName};
use crate::strategy::{Next, Stage};

/// Moves a message that keeps failing to the dead letter topic and skips it.
///
/// Retries count through the pause tracker's attempt. While it stays within
/// `max_retries` the regular pause and retry applies; the attempt after that
/// republishes the first unprocessed message and moves past it.
pub struct DeadLetterStage {
    config: DeadLetterQueueConfig,
}

impl DeadLetterStage {
    pub fn new(config: DeadLetterQueueConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Stage for DeadLetterStage {
    fn name(&self) -> &'static str {
        "dead_letter"
    }

    async fn after_consume(&self, ctx: &mut ConsumerContext, next: Next<'_>) -> anyhow::Result<()> {
        let coordinator = Arc::clone(ctx.coordinator());
        if coordinator.is_revoked() || coordinator.is_success() {
            return next.after_consume(ctx).await;
        }

        let attempt = coordinator.with_pause_tracker(|tracker| tracker.attempt());
        if attempt <= self.config.max_retries {
            return next.after_consume(ctx).await;
        }

        let Some(batch) = ctx.batch() else {
            return next.after_consume(ctx).await;
        };
        let seek_offset = ctx.seek_offset().unwrap_or(batch.first().offset());
        let Some(skippable) = batch.first_from(seek_offset).cloned() else {
            // the user marked the whole batch and still failed, nothing left to skip
            return next.after_consume(ctx).await;
        };

        let Some(producer) = ctx.env().producer.clone() else {
            warn!(
                topic = ctx.partition().topic(),
                partition = ctx.partition().partition(),
                "No dead letter producer available, retrying instead"
            );
            return next.after_consume(ctx).await;
        };

        let partition = ctx.partition().clone();
        let monitor = Arc::clone(&ctx.env().monitor);
        let record = DeadLetterRecord::from_message(&self.config.topic, &skippable);

        if let Err(e) = producer.produce(record).await {
            monitor.instrument(&Event::error(&partition, ErrorType::DeadLetter, &e));
            return next.after_consume(ctx).await;
        }

        coordinator.with_pause_tracker(|tracker| tracker.reset());

        let resume_at = skippable.offset() + 1;
        if ctx.topic_config().is_manual_offset_management() {
            ctx.set_seek_offset(resume_at);
        } else {
            ctx.mark_as_consumed(&skippable);
        }
        ctx.seek(resume_at).await?;
        ctx.resume_untimed("dead_letter").await?;

        info!(
            topic = partition.topic(),
            partition = partition.partition(),
            offset = skippable.offset(),
            dead_letter_topic = self.config.topic.as_str(),
            attempts = attempt,
            "Message dispatched to dead letter topic"
        );
        metrics::counter!(
            DEAD_LETTER_DISPATCHED,
            "topic" => partition.topic().to_string(),
            "dead_letter_topic" => self.config.topic.clone()
        )
        .increment(1);
        monitor.instrument(&Event::new(EventName::DeadLetter, &partition).with_message_count(1));
        Ok(())
    }
}

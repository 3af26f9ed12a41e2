use async_trait::async_trait;
use tracing::debug;

use crate::consumer::{ConsumerContext, PartitionEnv};
use crate::metrics_consts::PARTITION_PAUSES;
use crate::strategy::{EnqueueDecision, Next, Stage};
use crate::types::MessageBatch;

/// Long running jobs hold their worker for the whole run.
///
/// The partition is paused at the broker as soon as its batch is scheduled, so nothing
/// new is fetched while the job runs. The pause is not tracked by the pause tracker and
/// only ends when the batch succeeded, on retry expiry or on revocation.
pub struct LongRunningStage;

#[async_trait]
impl Stage for LongRunningStage {
    fn name(&self) -> &'static str {
        "long_running"
    }

    fn is_blocking(&self) -> bool {
        true
    }

    async fn before_enqueue(
        &self,
        env: &PartitionEnv,
        batch: MessageBatch,
        next: Next<'_>,
    ) -> anyhow::Result<EnqueueDecision> {
        let resume_at = batch.fetched_through() + 1;
        let decision = next.before_enqueue(env, batch).await?;

        if matches!(decision, EnqueueDecision::Consume(_)) {
            debug!(
                topic = env.partition.topic(),
                partition = env.partition.partition(),
                offset = resume_at,
                "Pausing partition for long running job"
            );
            metrics::counter!(PARTITION_PAUSES, "reason" => "long_running").increment(1);
            env.client.pause(&env.partition, resume_at, None).await?;
        }
        Ok(decision)
    }

    async fn after_consume(&self, ctx: &mut ConsumerContext, next: Next<'_>) -> anyhow::Result<()> {
        next.after_consume(ctx).await?;

        let coordinator = ctx.coordinator();
        if coordinator.is_revoked() || !coordinator.is_success() || coordinator.is_manual_pause() {
            return Ok(());
        }

        // rewind to the first unprocessed message, which may lie inside this batch
        if let Some(offset) = ctx.seek_offset() {
            ctx.seek(offset).await?;
        }
        ctx.resume_untimed("long_running").await
    }
}

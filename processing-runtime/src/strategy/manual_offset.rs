use async_trait::async_trait;

use crate::consumer::ConsumerContext;
use crate::strategy::{Next, Stage};

/// Offsets only move when user code marks them
pub struct ManualOffsetStage;

#[async_trait]
impl Stage for ManualOffsetStage {
    fn name(&self) -> &'static str {
        "manual_offset"
    }

    async fn after_consume(
        &self,
        ctx: &mut ConsumerContext,
        _next: Next<'_>,
    ) -> anyhow::Result<()> {
        let coordinator = ctx.coordinator();
        if coordinator.is_revoked() {
            return Ok(());
        }
        if coordinator.is_success() {
            coordinator.with_pause_tracker(|tracker| tracker.reset());
            return Ok(());
        }
        ctx.retry_after_pause().await
    }

    async fn idle(&self, _ctx: &mut ConsumerContext, _next: Next<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

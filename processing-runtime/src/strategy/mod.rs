//! Processing strategy as an ordered pipeline of stages.
//!
//! Every batch goes through the hook phases `before_enqueue`, `before_consume`, `consume`
//! and `after_consume`; `idle`, `revoked` and `shutdown` run on their own events. Each
//! feature is a [`Stage`] wrapping the stages after it: a hook receives [`Next`] and decides
//! whether and when to delegate inward. Stages that do not care about a hook use the
//! default, which delegates unchanged.
//!
//! The plan for a topic is resolved once, outermost first:
//!
//! ```text
//! filtering → dead_letter → long_running → manual_offset → default
//! ```
//!
//! Only the stages enabled by the topic's configuration are present; `default` always is.

mod dead_letter;
mod default;
mod filtering;
mod long_running;
mod manual_offset;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::TopicConfig;
use crate::consumer::{Consumer, ConsumerContext, PartitionEnv};
use crate::types::MessageBatch;

pub use dead_letter::DeadLetterStage;
pub use default::DefaultStage;
pub(crate) use default::panic_message;
pub use filtering::{FilteringStage, MessageFilter};
pub use long_running::LongRunningStage;
pub use manual_offset::ManualOffsetStage;

/// How a consume stage ended
#[derive(Debug)]
pub enum Outcome {
    Success,
    Failure(anyhow::Error),
    /// Nothing ran, no result is recorded
    Skip,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success)
    }
}

/// What the scheduler should enqueue for a fetched batch
#[derive(Debug)]
pub enum EnqueueDecision {
    Consume(MessageBatch),
    /// Nothing left to consume; the batch is kept for offset bookkeeping
    Idle(MessageBatch),
}

#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    /// Jobs of a plan containing a blocking stage hold their worker for the whole run
    fn is_blocking(&self) -> bool {
        false
    }

    async fn before_enqueue(
        &self,
        env: &PartitionEnv,
        batch: MessageBatch,
        next: Next<'_>,
    ) -> anyhow::Result<EnqueueDecision> {
        next.before_enqueue(env, batch).await
    }

    async fn before_consume(
        &self,
        ctx: &mut ConsumerContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        next.before_consume(ctx).await
    }

    async fn consume(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
        next: Next<'_>,
    ) -> Outcome {
        next.consume(ctx, consumer).await
    }

    async fn after_consume(&self, ctx: &mut ConsumerContext, next: Next<'_>) -> anyhow::Result<()> {
        next.after_consume(ctx).await
    }

    async fn idle(&self, ctx: &mut ConsumerContext, next: Next<'_>) -> anyhow::Result<()> {
        next.idle(ctx).await
    }

    async fn revoked(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        next.revoked(ctx, consumer).await
    }

    async fn shutdown(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        next.shutdown(ctx, consumer).await
    }
}

/// The stages inward of the current one. Past the innermost stage every hook is a no-op.
#[derive(Clone, Copy)]
pub struct Next<'a> {
    stages: &'a [Arc<dyn Stage>],
}

impl<'a> Next<'a> {
    fn split(self) -> Option<(&'a Arc<dyn Stage>, Next<'a>)> {
        self.stages
            .split_first()
            .map(|(stage, rest)| (stage, Next { stages: rest }))
    }

    pub async fn before_enqueue(
        self,
        env: &PartitionEnv,
        batch: MessageBatch,
    ) -> anyhow::Result<EnqueueDecision> {
        match self.split() {
            Some((stage, next)) => stage.before_enqueue(env, batch, next).await,
            None => Ok(EnqueueDecision::Consume(batch)),
        }
    }

    pub async fn before_consume(self, ctx: &mut ConsumerContext) -> anyhow::Result<()> {
        match self.split() {
            Some((stage, next)) => stage.before_consume(ctx, next).await,
            None => Ok(()),
        }
    }

    pub async fn consume(self, ctx: &mut ConsumerContext, consumer: &mut dyn Consumer) -> Outcome {
        match self.split() {
            Some((stage, next)) => stage.consume(ctx, consumer, next).await,
            None => Outcome::Skip,
        }
    }

    pub async fn after_consume(self, ctx: &mut ConsumerContext) -> anyhow::Result<()> {
        match self.split() {
            Some((stage, next)) => stage.after_consume(ctx, next).await,
            None => Ok(()),
        }
    }

    pub async fn idle(self, ctx: &mut ConsumerContext) -> anyhow::Result<()> {
        match self.split() {
            Some((stage, next)) => stage.idle(ctx, next).await,
            None => Ok(()),
        }
    }

    pub async fn revoked(
        self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
    ) -> anyhow::Result<()> {
        match self.split() {
            Some((stage, next)) => stage.revoked(ctx, consumer, next).await,
            None => Ok(()),
        }
    }

    pub async fn shutdown(
        self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
    ) -> anyhow::Result<()> {
        match self.split() {
            Some((stage, next)) => stage.shutdown(ctx, consumer, next).await,
            None => Ok(()),
        }
    }
}

/// Fixed, inspectable stage pipeline resolved for one topic
pub struct ExecutionPlan {
    stages: Vec<Arc<dyn Stage>>,
}

impl ExecutionPlan {
    pub fn for_topic(topic: &TopicConfig) -> Self {
        let mut stages: Vec<Arc<dyn Stage>> = Vec::new();

        if let Some(filter) = topic.message_filter() {
            stages.push(Arc::new(FilteringStage::new(Arc::clone(filter))));
        }
        if let Some(dlq) = topic.dead_letter() {
            stages.push(Arc::new(DeadLetterStage::new(dlq.clone())));
        }
        if topic.is_long_running_job() {
            stages.push(Arc::new(LongRunningStage));
        }
        if topic.is_manual_offset_management() {
            stages.push(Arc::new(ManualOffsetStage));
        }
        stages.push(Arc::new(DefaultStage));

        Self { stages }
    }

    /// Stage names, outermost first
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|stage| stage.name()).collect()
    }

    pub fn is_blocking(&self) -> bool {
        self.stages.iter().any(|stage| stage.is_blocking())
    }

    fn head(&self) -> Next<'_> {
        Next {
            stages: &self.stages,
        }
    }

    pub async fn before_enqueue(
        &self,
        env: &PartitionEnv,
        batch: MessageBatch,
    ) -> anyhow::Result<EnqueueDecision> {
        self.head().before_enqueue(env, batch).await
    }

    pub async fn before_consume(&self, ctx: &mut ConsumerContext) -> anyhow::Result<()> {
        self.head().before_consume(ctx).await
    }

    pub async fn consume(&self, ctx: &mut ConsumerContext, consumer: &mut dyn Consumer) -> Outcome {
        self.head().consume(ctx, consumer).await
    }

    pub async fn after_consume(&self, ctx: &mut ConsumerContext) -> anyhow::Result<()> {
        self.head().after_consume(ctx).await
    }

    pub async fn idle(&self, ctx: &mut ConsumerContext) -> anyhow::Result<()> {
        self.head().idle(ctx).await
    }

    pub async fn revoked(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
    ) -> anyhow::Result<()> {
        self.head().revoked(ctx, consumer).await
    }

    pub async fn shutdown(
        &self,
        ctx: &mut ConsumerContext,
        consumer: &mut dyn Consumer,
    ) -> anyhow::Result<()> {
        self.head().shutdown(ctx, consumer).await
    }
}

impl std::fmt::Debug for ExecutionPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionPlan")
            .field("stages", &self.stage_names())
            .finish()
    }
}

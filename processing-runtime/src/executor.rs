use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::consumer::{Consumer, ConsumerContext, PartitionEnv};
use crate::coordinator::Coordinator;
use crate::strategy::{EnqueueDecision, ExecutionPlan, Outcome};
use crate::types::{MessageBatch, PartitionKey};

struct ExecutorState {
    consumer: Box<dyn Consumer>,
    ctx: ConsumerContext,
    revoked_done: bool,
    shutdown_done: bool,
}

/// Binds the execution plan, the user consumer and its context to one assigned
/// partition. Jobs of the partition run through it one at a time.
pub struct Executor {
    env: PartitionEnv,
    plan: Arc<ExecutionPlan>,
    state: Mutex<ExecutorState>,
}

impl Executor {
    pub fn new(env: PartitionEnv, plan: Arc<ExecutionPlan>, consumer: Box<dyn Consumer>) -> Self {
        let ctx = ConsumerContext::new(env.clone());
        Self {
            env,
            plan,
            state: Mutex::new(ExecutorState {
                consumer,
                ctx,
                revoked_done: false,
                shutdown_done: false,
            }),
        }
    }

    pub fn partition(&self) -> &PartitionKey {
        &self.env.partition
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.env.coordinator
    }

    pub fn plan(&self) -> &ExecutionPlan {
        &self.plan
    }

    pub fn is_blocking(&self) -> bool {
        self.plan.is_blocking()
    }

    pub async fn before_enqueue(&self, batch: MessageBatch) -> anyhow::Result<EnqueueDecision> {
        self.plan.before_enqueue(&self.env, batch).await
    }

    /// Runs one batch through the consume phases.
    ///
    /// The job's result is recorded on the coordinator and its in-flight slot released
    /// before `after_consume`, whatever happened before. A consume failure is returned
    /// after the whole flow ran.
    pub async fn on_consume(&self, batch: MessageBatch) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let ExecutorState { consumer, ctx, .. } = &mut *state;
        let coordinator = &self.env.coordinator;
        ctx.set_messages(batch);

        if let Err(e) = self.plan.before_consume(ctx).await {
            coordinator.failure(&e);
            coordinator.decrement();
            return Err(e);
        }

        let outcome = self.plan.consume(ctx, consumer.as_mut()).await;
        match &outcome {
            Outcome::Success => coordinator.success(),
            Outcome::Failure(e) => coordinator.failure(e),
            Outcome::Skip => {}
        }
        coordinator.decrement();

        self.plan.after_consume(ctx).await?;

        match outcome {
            Outcome::Failure(e) => Err(e),
            Outcome::Success | Outcome::Skip => Ok(()),
        }
    }

    pub async fn on_idle(&self, batch: MessageBatch) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        state.ctx.set_messages(batch);
        self.plan.idle(&mut state.ctx).await
    }

    /// Runs the revoked flow; later calls are no-ops
    pub async fn on_revoked(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.revoked_done {
            debug!(
                topic = self.env.partition.topic(),
                partition = self.env.partition.partition(),
                "Revoked flow already ran"
            );
            return Ok(());
        }
        state.revoked_done = true;

        let ExecutorState { consumer, ctx, .. } = &mut *state;
        self.plan.revoked(ctx, consumer.as_mut()).await
    }

    /// Runs the shutdown flow; later calls are no-ops
    pub async fn on_shutdown(&self) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        if state.shutdown_done {
            return Ok(());
        }
        state.shutdown_done = true;

        let ExecutorState { consumer, ctx, .. } = &mut *state;
        self.plan.shutdown(ctx, consumer.as_mut()).await
    }

    /// Offset the consumer will resume from, for diagnostics
    pub async fn seek_offset(&self) -> Option<crate::types::Offset> {
        self.state.lock().await.ctx.seek_offset()
    }
}

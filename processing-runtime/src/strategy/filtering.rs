use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::consumer::PartitionEnv;
use crate::strategy::{EnqueueDecision, Next, Stage};
use crate::types::{Message, MessageBatch};

/// Decides which fetched messages reach user code
pub trait MessageFilter: Send + Sync {
    fn retain(&self, message: &Message) -> bool;
}

impl<F> MessageFilter for F
where
    F: Fn(&Message) -> bool + Send + Sync,
{
    fn retain(&self, message: &Message) -> bool {
        self(message)
    }
}

/// Drops filtered messages before scheduling. A batch filtered out entirely becomes an
/// idle job so its offsets still move forward.
pub struct FilteringStage {
    filter: Arc<dyn MessageFilter>,
}

impl FilteringStage {
    pub fn new(filter: Arc<dyn MessageFilter>) -> Self {
        Self { filter }
    }
}

#[async_trait]
impl Stage for FilteringStage {
    fn name(&self) -> &'static str {
        "filtering"
    }

    async fn before_enqueue(
        &self,
        env: &PartitionEnv,
        batch: MessageBatch,
        next: Next<'_>,
    ) -> anyhow::Result<EnqueueDecision> {
        match batch.retain(|message| self.filter.retain(message)) {
            Some(retained) => {
                if retained.len() < batch.len() {
                    debug!(
                        topic = env.partition.topic(),
                        partition = env.partition.partition(),
                        fetched = batch.len(),
                        retained = retained.len(),
                        "Filtered batch"
                    );
                }
                next.before_enqueue(env, retained).await
            }
            None => {
                debug!(
                    topic = env.partition.topic(),
                    partition = env.partition.partition(),
                    fetched = batch.len(),
                    "Whole batch filtered out"
                );
                Ok(EnqueueDecision::Idle(batch))
            }
        }
    }
}

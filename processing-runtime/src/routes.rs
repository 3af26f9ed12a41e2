use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{Config, TopicConfig};
use crate::consumer::Consumer;
use crate::error::ConfigError;
use crate::strategy::ExecutionPlan;
use crate::types::PartitionKey;

/// Builds one consumer per assigned partition
pub type ConsumerFactory = Arc<dyn Fn(&PartitionKey) -> Box<dyn Consumer> + Send + Sync>;

#[derive(Clone)]
pub struct Route {
    topic: Arc<TopicConfig>,
    plan: Arc<ExecutionPlan>,
    factory: ConsumerFactory,
}

impl Route {
    pub fn topic(&self) -> &Arc<TopicConfig> {
        &self.topic
    }

    pub fn plan(&self) -> &Arc<ExecutionPlan> {
        &self.plan
    }

    pub fn build_consumer(&self, partition: &PartitionKey) -> Box<dyn Consumer> {
        (self.factory)(partition)
    }
}

/// Maps topic names to their settings and consumer factory
#[derive(Clone, Default)]
pub struct Routes {
    routes: HashMap<String, Route>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes `topic` to consumers built by `factory`. A later route for the same topic
    /// replaces the earlier one.
    pub fn add<F, C>(mut self, topic: TopicConfig, factory: F) -> Self
    where
        F: Fn(&PartitionKey) -> C + Send + Sync + 'static,
        C: Consumer,
    {
        let factory: ConsumerFactory =
            Arc::new(move |partition: &PartitionKey| -> Box<dyn Consumer> {
                Box::new(factory(partition))
            });
        let plan = Arc::new(ExecutionPlan::for_topic(&topic));
        self.routes.insert(
            topic.name().to_string(),
            Route {
                topic: Arc::new(topic),
                plan,
                factory,
            },
        );
        self
    }

    pub fn get(&self, topic: &str) -> Option<&Route> {
        self.routes.get(topic)
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Applies runtime defaults to every topic and validates the result
    pub(crate) fn resolve(
        self,
        config: &Config,
        has_dead_letter_producer: bool,
    ) -> Result<Self, ConfigError> {
        let routes = self
            .routes
            .into_iter()
            .map(|(name, route)| {
                let topic = TopicConfig::clone(&route.topic).inherit(config);
                topic.validate(has_dead_letter_producer)?;
                Ok((
                    name,
                    Route {
                        topic: Arc::new(topic),
                        ..route
                    },
                ))
            })
            .collect::<Result<HashMap<_, _>, ConfigError>>()?;
        Ok(Self { routes })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::NoopConsumer as Noop;
    use std::time::Duration;

    #[test]
    fn test_resolve_inherits_and_validates() {
        let routes = Routes::new()
            .add(TopicConfig::new("events").long_running_job(true), |_| Noop)
            .add(TopicConfig::new("clicks"), |_| Noop);

        let mut config = Config::default_for_test();
        config.pause_timeout_ms = 300;
        let resolved = routes.resolve(&config, false).unwrap();

        let events = resolved.get("events").unwrap();
        assert_eq!(
            events.topic().resolved_pause_timeout(),
            Duration::from_millis(300)
        );
        assert!(events.plan().is_blocking());
        assert!(!resolved.get("clicks").unwrap().plan().is_blocking());
        assert!(resolved.get("missing").is_none());
    }

    #[test]
    fn test_resolve_requires_producer_for_dead_letter() {
        let routes = Routes::new().add(
            TopicConfig::new("events").dead_letter_queue("events_dlq", 2),
            |_| Noop,
        );
        assert_eq!(
            routes
                .resolve(&Config::default_for_test(), false)
                .err(),
            Some(ConfigError::MissingDeadLetterProducer("events".to_string()))
        );
    }
}

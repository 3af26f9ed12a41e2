use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use envconfig::Envconfig;

use crate::error::ConfigError;
use crate::pause_tracker::PauseTracker;
use crate::strategy::MessageFilter;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    // Worker pool
    #[envconfig(default = "5")]
    pub concurrency: usize,

    // 0 means concurrency - 1 (at least 1)
    #[envconfig(default = "0")]
    pub max_blocking_jobs: usize,

    // Pause defaults, inherited by topics that do not override them
    #[envconfig(default = "1000")]
    pub pause_timeout_ms: u64,

    #[envconfig(default = "30000")]
    pub pause_max_timeout_ms: u64,

    #[envconfig(default = "true")]
    pub pause_with_exponential_backoff: bool,

    // Listener
    #[envconfig(default = "1000")]
    pub max_wait_time_ms: u64,

    #[envconfig(default = "60000")]
    pub shutdown_timeout_ms: u64,
}

impl Config {
    pub fn default_for_test() -> Self {
        Config {
            concurrency: 4,
            max_blocking_jobs: 0,
            pause_timeout_ms: 1000,
            pause_max_timeout_ms: 30000,
            pause_with_exponential_backoff: true,
            max_wait_time_ms: 10,
            shutdown_timeout_ms: 5000,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.pause_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("pause_timeout"));
        }
        if self.pause_max_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout("pause_max_timeout"));
        }
        if self.pause_timeout_ms > self.pause_max_timeout_ms {
            return Err(ConfigError::PauseTimeoutAboveMax {
                timeout: self.pause_timeout(),
                max_timeout: self.pause_max_timeout(),
            });
        }
        if self.max_wait_time_ms >= self.shutdown_timeout_ms {
            return Err(ConfigError::ShutdownTimeoutTooShort {
                max_wait_time: self.max_wait_time(),
                shutdown_timeout: self.shutdown_timeout(),
            });
        }
        Ok(())
    }

    /// Number of workers blocking jobs may hold at once
    pub fn effective_max_blocking_jobs(&self) -> usize {
        let limit = if self.max_blocking_jobs == 0 {
            self.concurrency.saturating_sub(1)
        } else {
            self.max_blocking_jobs.min(self.concurrency)
        };
        limit.max(1)
    }

    pub fn pause_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_timeout_ms)
    }

    pub fn pause_max_timeout(&self) -> Duration {
        Duration::from_millis(self.pause_max_timeout_ms)
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Dead letter target for a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterQueueConfig {
    pub topic: String,
    /// Failed attempts tolerated before the offending message is dispatched
    pub max_retries: u32,
}

/// Per-topic processing settings.
///
/// Pause settings left unset inherit the runtime [`Config`] values when the topic is
/// routed.
#[derive(Clone)]
pub struct TopicConfig {
    name: String,
    manual_offset_management: bool,
    long_running_job: bool,
    dead_letter_queue: Option<DeadLetterQueueConfig>,
    pause_timeout: Option<Duration>,
    pause_max_timeout: Option<Duration>,
    pause_with_exponential_backoff: Option<bool>,
    filter: Option<Arc<dyn MessageFilter>>,
}

impl TopicConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            manual_offset_management: false,
            long_running_job: false,
            dead_letter_queue: None,
            pause_timeout: None,
            pause_max_timeout: None,
            pause_with_exponential_backoff: None,
            filter: None,
        }
    }

    pub fn manual_offset_management(mut self, enabled: bool) -> Self {
        self.manual_offset_management = enabled;
        self
    }

    pub fn long_running_job(mut self, enabled: bool) -> Self {
        self.long_running_job = enabled;
        self
    }

    pub fn dead_letter_queue(mut self, topic: impl Into<String>, max_retries: u32) -> Self {
        self.dead_letter_queue = Some(DeadLetterQueueConfig {
            topic: topic.into(),
            max_retries,
        });
        self
    }

    pub fn pause_timeout(mut self, timeout: Duration) -> Self {
        self.pause_timeout = Some(timeout);
        self
    }

    pub fn pause_max_timeout(mut self, timeout: Duration) -> Self {
        self.pause_max_timeout = Some(timeout);
        self
    }

    pub fn pause_with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.pause_with_exponential_backoff = Some(enabled);
        self
    }

    pub fn filter(mut self, filter: impl MessageFilter + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Fills unset pause settings from the runtime defaults.
    pub fn inherit(mut self, config: &Config) -> Self {
        self.pause_timeout.get_or_insert(config.pause_timeout());
        self.pause_max_timeout
            .get_or_insert(config.pause_max_timeout());
        self.pause_with_exponential_backoff
            .get_or_insert(config.pause_with_exponential_backoff);
        self
    }

    pub fn validate(&self, has_dead_letter_producer: bool) -> Result<(), ConfigError> {
        let timeout = self.resolved_pause_timeout();
        let max_timeout = self.resolved_pause_max_timeout();
        if timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout("pause_timeout"));
        }
        if timeout > max_timeout {
            return Err(ConfigError::PauseTimeoutAboveMax {
                timeout,
                max_timeout,
            });
        }
        if let Some(dlq) = &self.dead_letter_queue {
            if dlq.topic == self.name {
                return Err(ConfigError::DeadLetterLoop(self.name.clone()));
            }
            if !has_dead_letter_producer {
                return Err(ConfigError::MissingDeadLetterProducer(self.name.clone()));
            }
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_manual_offset_management(&self) -> bool {
        self.manual_offset_management
    }

    pub fn is_long_running_job(&self) -> bool {
        self.long_running_job
    }

    pub fn dead_letter(&self) -> Option<&DeadLetterQueueConfig> {
        self.dead_letter_queue.as_ref()
    }

    pub fn message_filter(&self) -> Option<&Arc<dyn MessageFilter>> {
        self.filter.as_ref()
    }

    pub fn resolved_pause_timeout(&self) -> Duration {
        self.pause_timeout.unwrap_or(Duration::from_millis(1000))
    }

    pub fn resolved_pause_max_timeout(&self) -> Duration {
        self.pause_max_timeout
            .unwrap_or(Duration::from_millis(30000))
    }

    pub fn resolved_exponential_backoff(&self) -> bool {
        self.pause_with_exponential_backoff.unwrap_or(true)
    }

    /// Fresh tracker for a newly assigned partition of this topic
    pub fn pause_tracker(&self) -> PauseTracker {
        PauseTracker::new(
            self.resolved_pause_timeout(),
            self.resolved_pause_max_timeout(),
            self.resolved_exponential_backoff(),
        )
    }
}

impl fmt::Debug for TopicConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicConfig")
            .field("name", &self.name)
            .field("manual_offset_management", &self.manual_offset_management)
            .field("long_running_job", &self.long_running_job)
            .field("dead_letter_queue", &self.dead_letter_queue)
            .field("pause_timeout", &self.pause_timeout)
            .field("pause_max_timeout", &self.pause_max_timeout)
            .field(
                "pause_with_exponential_backoff",
                &self.pause_with_exponential_backoff,
            )
            .field("filter", &self.filter.is_some())
            .finish()
    }
}

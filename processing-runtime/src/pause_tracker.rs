use std::time::Duration;

use tokio::time::Instant;

/// Per-partition pause state and retry backoff.
///
/// `attempt` counts consecutive processing attempts since the last success. Pauses are
/// additive: pausing while already paused extends the deadline from the current one
/// instead of from `now`.
#[derive(Debug, Clone)]
pub struct PauseTracker {
    attempt: u32,
    base_timeout: Duration,
    max_timeout: Duration,
    exponential_backoff: bool,
    current_timeout: Duration,
    paused_until: Option<Instant>,
}

impl PauseTracker {
    pub fn new(base_timeout: Duration, max_timeout: Duration, exponential_backoff: bool) -> Self {
        Self {
            attempt: 0,
            base_timeout,
            max_timeout,
            exponential_backoff,
            current_timeout: base_timeout,
            paused_until: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn current_timeout(&self) -> Duration {
        self.current_timeout
    }

    pub fn paused_until(&self) -> Option<Instant> {
        self.paused_until
    }

    pub fn increment(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }

    /// Pauses for `timeout`, or for the backoff interval of the current attempt when
    /// `None`. The interval is capped at the max timeout. Returns the interval applied.
    pub fn pause(&mut self, timeout: Option<Duration>) -> Duration {
        self.pause_at(Instant::now(), timeout)
    }

    fn pause_at(&mut self, now: Instant, timeout: Option<Duration>) -> Duration {
        let interval = timeout
            .unwrap_or_else(|| self.backoff_interval())
            .min(self.max_timeout);

        let from = match self.paused_until {
            Some(until) if until > now => until,
            _ => now,
        };
        self.paused_until = Some(from.checked_add(interval).unwrap_or(from));
        self.current_timeout = interval;
        interval
    }

    /// Ends the pause immediately. The attempt counter is kept.
    pub fn expire(&mut self) {
        self.paused_until = None;
    }

    /// Clears the attempt counter and the backoff state. A running pause is kept, it
    /// still ends through `expire`.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_timeout = self.base_timeout;
    }

    /// True while a pause deadline lies in the future
    pub fn is_paused(&self) -> bool {
        self.is_paused_at(Instant::now())
    }

    /// True when a pause was taken and its deadline has passed
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    fn is_paused_at(&self, now: Instant) -> bool {
        matches!(self.paused_until, Some(until) if until > now)
    }

    fn is_expired_at(&self, now: Instant) -> bool {
        matches!(self.paused_until, Some(until) if until <= now)
    }

    fn backoff_interval(&self) -> Duration {
        if !self.exponential_backoff {
            return self.base_timeout;
        }

        // attempt 1 waits the base timeout, every further attempt doubles it
        let exponent = self.attempt.saturating_sub(1);
        2u32.checked_pow(exponent)
            .and_then(|factor| self.base_timeout.checked_mul(factor))
            .unwrap_or(self.max_timeout)
            .min(self.max_timeout)
    }
}

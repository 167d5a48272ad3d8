//! Exponential backoff for re-establishing the queue connection.
//!
//! The daemon keeps polling its running jobs while disconnected, so the
//! backoff is a tracker consulted once per control-loop iteration rather
//! than a blocking retry loop.

use std::time::Duration;

use tokio::time::Instant;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Calculate the next backoff delay, clamped to
/// [`ReconnectConfig::max_delay`].
pub fn next_delay(current: Duration, config: &ReconnectConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}

/// Tracks when the next reconnection attempt is due.
#[derive(Debug)]
pub struct Backoff {
    config: ReconnectConfig,
    delay: Duration,
    next_attempt: Option<Instant>,
    attempts: u32,
}

impl Backoff {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            delay: config.initial_delay,
            config,
            next_attempt: None,
            attempts: 0,
        }
    }

    /// Whether an attempt may be made now. True until the first failure.
    pub fn ready(&self) -> bool {
        self.next_attempt
            .map_or(true, |at| Instant::now() >= at)
    }

    /// Record a failed attempt and schedule the next one. Returns the wait.
    pub fn failed(&mut self) -> Duration {
        let wait = self.delay;
        self.attempts += 1;
        self.next_attempt = Some(Instant::now() + wait);
        self.delay = next_delay(self.delay, &self.config);
        wait
    }

    /// Forget previous failures after a successful attempt.
    pub fn reset(&mut self) {
        self.delay = self.config.initial_delay;
        self.next_attempt = None;
        self.attempts = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_delay_doubles() {
        let config = ReconnectConfig::default();
        assert_eq!(next_delay(Duration::from_secs(1), &config), Duration::from_secs(2));
    }

    #[test]
    fn next_delay_clamps_at_max() {
        let config = ReconnectConfig {
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        assert_eq!(next_delay(Duration::from_secs(8), &config), Duration::from_secs(10));
    }

    #[test]
    fn failures_grow_the_wait() {
        let mut backoff = Backoff::new(ReconnectConfig::default());
        assert!(backoff.ready());

        assert_eq!(backoff.failed(), Duration::from_secs(1));
        assert!(!backoff.ready());
        assert_eq!(backoff.failed(), Duration::from_secs(2));
        assert_eq!(backoff.failed(), Duration::from_secs(4));
        assert_eq!(backoff.attempts(), 3);

        backoff.reset();
        assert!(backoff.ready());
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.failed(), Duration::from_secs(1));
    }

    #[test]
    fn zero_delay_is_immediately_ready() {
        let mut backoff = Backoff::new(ReconnectConfig {
            initial_delay: Duration::ZERO,
            ..Default::default()
        });
        backoff.failed();
        assert!(backoff.ready());
    }
}

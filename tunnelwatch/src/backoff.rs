//! Exponential reconnect backoff with jitter.
//!
//! The delay before attempt `n` (zero-based) is
//!
//! ```text
//! nominal(n) = initial * 2^n
//! delay(n)   = min(max_backoff, max(delay(n - 1), nominal(n) * (1 + u)))   u ~ U[0, jitter]
//! ```
//!
//! Jitter spreads reconnecting clients apart; the running maximum keeps the
//! sequence non-decreasing even though the random component varies, and the
//! cap bounds it.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Delay generator for one reconnect episode.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    /// Creates a backoff from retry settings.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            initial: config.initial_backoff,
            max: config.max_backoff,
            jitter: config.jitter.clamp(0.0, 1.0),
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Returns the next delay using the thread-local RNG.
    pub fn next_delay(&mut self) -> Duration {
        self.next_delay_with(&mut rand::rng())
    }

    /// Returns the next delay drawing jitter from `rng`.
    pub fn next_delay_with<R: Rng>(&mut self, rng: &mut R) -> Duration {
        let factor = 2f64.powi(i32::try_from(self.attempt).unwrap_or(i32::MAX));
        let nominal = self.initial.as_secs_f64() * factor;
        let spread = if self.jitter > 0.0 {
            rng.random_range(0.0..=self.jitter)
        } else {
            0.0
        };

        let jittered = Duration::try_from_secs_f64(nominal * (1.0 + spread)).unwrap_or(self.max);
        let delay = jittered.max(self.last).min(self.max);

        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Starts a new episode after a successful reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }
}

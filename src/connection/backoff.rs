//! Exponential reconnect backoff with jitter.

use std::time::Duration;

use rand::Rng;

use crate::config::ReconnectSettings;

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// `jitter` is the fraction of each delay that may be shaved off at
    /// random, clamped to `0.0..=1.0`.
    pub fn new(initial: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            initial,
            max: max.max(initial),
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &ReconnectSettings) -> Self {
        Self::new(
            Duration::from_millis(settings.initial_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.multiplier,
            settings.jitter,
        )
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let millis = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let base_ms = base.as_millis() as f64;
        if self.jitter <= 0.0 || base_ms <= 0.0 {
            return base;
        }
        let spread = base_ms * self.jitter;
        let shaved = rand::thread_rng().gen_range(0.0..=spread);
        Duration::from_millis((base_ms - shaved) as u64)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

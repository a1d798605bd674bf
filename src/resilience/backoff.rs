//! Exponential backoff between retries of accounting-system calls.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: f64,
}

impl ExponentialBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            factor: 2.0,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(32) as i32;
        let base = self.initial.as_secs_f64() * self.factor.powi(exponent);
        let capped = base.min(self.max.as_secs_f64());

        let jittered = if self.jitter > 0.0 {
            // Symmetric jitter so parallel units do not retry in lockstep.
            let spread = capped * self.jitter;
            capped + rand::random::<f64>() * spread * 2.0 - spread
        } else {
            capped
        };

        Duration::from_secs_f64(jittered.clamp(0.0, self.max.as_secs_f64()))
    }

    /// Delays for retries `1..=retries`, in order.
    pub fn delays(&self, retries: u32) -> impl Iterator<Item = Duration> + '_ {
        (1..=retries).map(|retry| self.delay_for(retry))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(200), Duration::from_secs(5))
    }
}

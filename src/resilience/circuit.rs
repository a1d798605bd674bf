//! Per-cluster circuit breaker.

use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    /// Trial calls admitted while half-open; this many successes close it.
    pub half_open_trials: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_trials: 1,
        }
    }
}

struct Inner {
    state: CircuitState,
    opened_at: Option<Instant>,
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    inner: Mutex<Inner>,
    failures: AtomicU32,
    trial_successes: AtomicU32,
    trials_admitted: AtomicU32,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                opened_at: None,
            }),
            failures: AtomicU32::new(0),
            trial_successes: AtomicU32::new(0),
            trials_admitted: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).state
    }

    /// Admit one call, or `None` while the circuit is open.
    pub fn acquire(self: &Arc<Self>) -> Option<CallPermit> {
        let trial = self.admit()?;
        Some(CallPermit {
            breaker: Arc::clone(self),
            trial,
            settled: false,
        })
    }

    /// `Some(true)` for a half-open trial.
    fn admit(&self) -> Option<bool> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => Some(false),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    self.trial_successes.store(0, Ordering::Relaxed);
                    self.trials_admitted.store(1, Ordering::Relaxed);
                    tracing::info!(cluster = %self.name, "Circuit breaker half-open");
                    Some(true)
                } else {
                    None
                }
            }
            CircuitState::HalfOpen => {
                let admitted = self.trials_admitted.load(Ordering::Relaxed);
                if admitted < self.config.half_open_trials.max(1) {
                    self.trials_admitted.store(admitted + 1, Ordering::Relaxed);
                    Some(true)
                } else {
                    None
                }
            }
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            CircuitState::Closed => self.failures.store(0, Ordering::Relaxed),
            CircuitState::HalfOpen => {
                let successes = self.trial_successes.fetch_add(1, Ordering::Relaxed) + 1;
                if successes >= self.config.half_open_trials.max(1) {
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    self.failures.store(0, Ordering::Relaxed);
                    tracing::info!(cluster = %self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let open = match inner.state {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                failures >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        if open {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            tracing::warn!(
                cluster = %self.name,
                failures = self.failures.load(Ordering::Relaxed),
                "Circuit breaker opened"
            );
        }
    }

    pub fn failure_count(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("failures", &self.failure_count())
            .finish()
    }
}

/// One admitted call. Report the result with [`success`](Self::success) or
/// [`failure`](Self::failure); a half-open trial dropped without a result
/// reopens the circuit.
#[must_use]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success();
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure();
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            tracing::warn!(cluster = %self.breaker.name, "Half-open trial abandoned");
            self.breaker.record_failure();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, recovery: Duration) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(
            "smp",
            CircuitConfig {
                failure_threshold: threshold,
                recovery_timeout: recovery,
                half_open_trials: 1,
            },
        ))
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.acquire().is_none());
    }

    #[test]
    fn test_success_clears_failures() {
        let cb = breaker(3, Duration::from_secs(60));
        cb.record_failure();
        cb.record_failure();
        cb.acquire().unwrap().success();
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_dropped_call_while_closed_is_not_counted() {
        let cb = breaker(1, Duration::from_secs(60));
        drop(cb.acquire().unwrap());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_half_open_trial_closes_on_success() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        let trial = cb.acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.acquire().is_none());

        trial.success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let cb = breaker(1, Duration::ZERO);
        cb.record_failure();
        cb.acquire().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_abandoned_trial_reopens_and_recovers() {
        let cb = breaker(1, Duration::from_millis(20));
        cb.record_failure();
        std::thread::sleep(Duration::from_millis(30));

        let trial = cb.acquire().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        drop(trial);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.acquire().is_none());

        std::thread::sleep(Duration::from_millis(30));
        cb.acquire().unwrap().success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}

//! Resilience layer for calls into the external accounting system.
//!
//! Every call runs under a bounded timeout and is retried a bounded number
//! of times with exponential backoff when it fails transiently. A circuit
//! breaker per cluster stops hammering a cluster whose accounting endpoint
//! is down while the other clusters keep being reconciled.

mod backoff;
mod circuit;

pub use backoff::ExponentialBackoff;
pub use circuit::{CallPermit, CircuitBreaker, CircuitConfig, CircuitState};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::source::SourceError;

#[derive(Clone, Debug)]
pub struct ResilienceConfig {
    pub retry: RetryConfig,
    pub circuit: Option<CircuitConfig>,
    /// Bound on a single attempt.
    pub timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit: Some(CircuitConfig::default()),
            timeout: Duration::from_secs(30),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl ResilienceConfig {
    pub fn no_retry() -> Self {
        Self {
            retry: RetryConfig {
                max_retries: 0,
                ..Default::default()
            },
            circuit: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, backoff: ExponentialBackoff) -> Self {
        self.retry = RetryConfig {
            max_retries,
            backoff,
        };
        self
    }

    pub fn with_circuit(mut self, circuit: Option<CircuitConfig>) -> Self {
        self.circuit = circuit;
        self
    }
}

pub struct Resilience {
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl Resilience {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The breaker guarding `cluster`, if circuit breaking is enabled.
    pub fn circuit(&self, cluster: &str) -> Option<Arc<CircuitBreaker>> {
        let config = self.config.circuit.as_ref()?;
        let breaker = self
            .breakers
            .entry(cluster.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(cluster, config.clone())));
        Some(Arc::clone(&breaker))
    }

    pub async fn execute<T, F, Fut>(&self, cluster: &str, mut operation: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let breaker = self.circuit(cluster);
        let mut retries = 0;

        loop {
            let permit = match &breaker {
                Some(cb) => match cb.acquire() {
                    Some(permit) => Some(permit),
                    None => {
                        return Err(SourceError::CircuitOpen {
                            cluster: cluster.to_string(),
                        });
                    }
                },
                None => None,
            };

            let error = match tokio::time::timeout(self.config.timeout, operation()).await {
                Ok(Ok(value)) => {
                    if let Some(permit) = permit {
                        permit.success();
                    }
                    return Ok(value);
                }
                Ok(Err(e)) => e,
                Err(_elapsed) => SourceError::Timeout(self.config.timeout),
            };

            if !error.is_transient() {
                // The accounting system answered; only the request was bad.
                if let Some(permit) = permit {
                    permit.success();
                }
                return Err(error);
            }

            if let Some(permit) = permit {
                permit.failure();
            }

            retries += 1;
            if retries > self.config.retry.max_retries {
                return Err(error);
            }

            let delay = self.config.retry.backoff.delay_for(retries);
            tracing::warn!(
                cluster,
                retry = retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying accounting call after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for Resilience {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> ResilienceConfig {
        ResilienceConfig::default()
            .with_retries(
                max_retries,
                ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2))
                    .with_jitter(0.0),
            )
            .with_circuit(None)
            .with_timeout(Duration::from_millis(50))
    }

    fn unavailable() -> SourceError {
        SourceError::Unavailable {
            cluster: "smp".into(),
            message: "connection refused".into(),
        }
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let resilience = Resilience::new(fast_config(3));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result = resilience
            .execute("smp", move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(unavailable())
                } else {
                    Ok(42u64)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let resilience = Resilience::new(fast_config(2));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<u64, _> = resilience
            .execute("smp", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            })
            .await;

        assert!(matches!(result, Err(SourceError::Unavailable { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_account_not_found_is_not_retried() {
        let resilience = Resilience::new(fast_config(5));
        let calls = AtomicU32::new(0);
        let calls = &calls;

        let result: Result<u64, _> = resilience
            .execute("smp", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SourceError::AccountNotFound {
                    cluster: "smp".into(),
                    account: "ghost".into(),
                })
            })
            .await;

        assert!(matches!(result, Err(SourceError::AccountNotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempt_timeout() {
        let resilience = Resilience::new(fast_config(1));

        let result: Result<u64, _> = resilience
            .execute("smp", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(1)
            })
            .await;

        assert!(matches!(result, Err(SourceError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_circuit_is_per_cluster() {
        let config = fast_config(0).with_circuit(Some(CircuitConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(600),
            half_open_trials: 1,
        }));
        let resilience = Resilience::new(config);

        let _: Result<u64, _> = resilience.execute("smp", || async { Err(unavailable()) }).await;

        let blocked: Result<u64, _> = resilience.execute("smp", || async { Ok(1) }).await;
        assert!(matches!(blocked, Err(SourceError::CircuitOpen { .. })));

        let other: Result<u64, _> = resilience.execute("gpu", || async { Ok(7) }).await;
        assert_eq!(other.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_circuit_recovers_after_abandoned_trial() {
        let config = fast_config(0)
            .with_timeout(Duration::from_secs(5))
            .with_circuit(Some(CircuitConfig {
                failure_threshold: 1,
                recovery_timeout: Duration::from_millis(20),
                half_open_trials: 1,
            }));
        let resilience = Resilience::new(config);

        let _: Result<u64, _> = resilience.execute("smp", || async { Err(unavailable()) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The unit owning the trial call times out and drops it mid-flight.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(5),
            resilience.execute("smp", || async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok::<u64, SourceError>(1)
            }),
        )
        .await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_millis(30)).await;
        let recovered: Result<u64, _> = resilience.execute("smp", || async { Ok(3) }).await;
        assert_eq!(recovered.unwrap(), 3);
        assert_eq!(
            resilience.circuit("smp").unwrap().state(),
            CircuitState::Closed
        );
    }
}

//! Timeout, retry and circuit breaking around any [`UsageSource`].

use std::collections::BTreeSet;
use std::sync::Arc;

use super::{SourceResult, UsageSource};
use crate::resilience::{Resilience, ResilienceConfig};

pub struct ResilientSource {
    inner: Arc<dyn UsageSource>,
    resilience: Resilience,
}

impl ResilientSource {
    pub fn new(inner: Arc<dyn UsageSource>, config: ResilienceConfig) -> Self {
        Self {
            inner,
            resilience: Resilience::new(config),
        }
    }

    pub fn resilience(&self) -> &Resilience {
        &self.resilience
    }

    pub fn inner(&self) -> &Arc<dyn UsageSource> {
        &self.inner
    }
}

#[async_trait::async_trait]
impl UsageSource for ResilientSource {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn list_accounts(&self, cluster: &str) -> SourceResult<BTreeSet<String>> {
        let inner = &self.inner;
        self.resilience
            .execute(cluster, move || inner.list_accounts(cluster))
            .await
    }

    async fn get_usage(&self, cluster: &str, account: &str) -> SourceResult<u64> {
        let inner = &self.inner;
        self.resilience
            .execute(cluster, move || inner.get_usage(cluster, account))
            .await
    }

    async fn get_limit(&self, cluster: &str, account: &str) -> SourceResult<u64> {
        let inner = &self.inner;
        self.resilience
            .execute(cluster, move || inner.get_limit(cluster, account))
            .await
    }

    async fn set_limit(&self, cluster: &str, account: &str, limit: u64) -> SourceResult<()> {
        let inner = &self.inner;
        self.resilience
            .execute(cluster, move || inner.set_limit(cluster, account, limit))
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::resilience::{CircuitConfig, ExponentialBackoff};
    use crate::source::{MemorySource, ScriptedFailure, SourceError, SourceOp};

    fn config() -> ResilienceConfig {
        ResilienceConfig::default()
            .with_retries(
                2,
                ExponentialBackoff::new(Duration::from_millis(1), Duration::from_millis(2)),
            )
            .with_circuit(None)
            .with_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_transient_failures_are_absorbed() {
        let memory = Arc::new(MemorySource::new().with_account("smp", "physics", 5, 10));
        memory.inject(
            ScriptedFailure::unavailable("smp")
                .on(SourceOp::GetUsage)
                .times(2),
        );
        let source = ResilientSource::new(memory.clone(), config());

        assert_eq!(source.get_usage("smp", "physics").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_persistent_outage_surfaces() {
        let memory = Arc::new(MemorySource::new().with_account("smp", "physics", 5, 10));
        memory.inject(ScriptedFailure::unavailable("smp"));
        let source = ResilientSource::new(memory, config());

        let err = source.set_limit("smp", "physics", 20).await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_open_circuit_short_circuits() {
        let memory = Arc::new(MemorySource::new().with_account("smp", "physics", 5, 10));
        memory.inject(ScriptedFailure::unavailable("smp").times(1));
        let source = ResilientSource::new(
            memory,
            config()
                .with_retries(0, ExponentialBackoff::default())
                .with_circuit(Some(CircuitConfig {
                    failure_threshold: 1,
                    recovery_timeout: Duration::from_secs(600),
                    half_open_trials: 1,
                })),
        );

        assert!(source.get_limit("smp", "physics").await.is_err());
        let err = source.get_limit("smp", "physics").await.unwrap_err();
        assert!(matches!(err, SourceError::CircuitOpen { .. }));
    }
}

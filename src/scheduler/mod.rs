//! Scheduling Driver
//!
//! Enumerates enabled clusters, lists each cluster's accounts and runs one
//! isolated unit per (cluster, account). Units share a bounded worker pool;
//! a unit's failure, panic or timeout is recorded in the [`PassReport`] and
//! never affects its siblings.

mod locks;
mod report;

pub use locks::{AccountGuard, AccountLocks, LockPolicy};
pub use report::{ClusterFailure, PassReport, UnitReport, UnitStatus};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::ledger::LedgerError;
use crate::observability::{PassSpan, UnitSpan};
use crate::reconcile::Reconciler;
use crate::types::Cluster;
use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub max_concurrency: usize,
    /// Bound on one unit, including the wait for its account key.
    pub unit_timeout: Duration,
    pub lock_policy: LockPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_concurrency: 8,
            unit_timeout: Duration::from_secs(300),
            lock_policy: LockPolicy::Wait,
        }
    }
}

/// Everything a spawned unit needs, cheap to clone.
#[derive(Clone)]
struct UnitContext {
    reconciler: Arc<Reconciler>,
    locks: Arc<AccountLocks>,
    permits: Arc<Semaphore>,
    unit_timeout: Duration,
    lock_policy: LockPolicy,
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    config: SchedulerConfig,
    locks: Arc<AccountLocks>,
    permits: Arc<Semaphore>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, config: SchedulerConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        Self {
            reconciler,
            config,
            locks: Arc::new(AccountLocks::new()),
            permits,
        }
    }

    /// Share an existing lock table, e.g. with an operator-triggered pass.
    pub fn with_locks(mut self, locks: Arc<AccountLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<AccountLocks> {
        &self.locks
    }

    /// One pass over every enabled cluster.
    pub async fn reconcile_all(&self) -> Result<PassReport> {
        let clusters = self.reconciler.ledger().enabled_clusters().await?;
        Ok(self.run_pass("all", clusters).await)
    }

    /// One pass over a single cluster.
    pub async fn reconcile_cluster(&self, name: &str) -> Result<PassReport> {
        let cluster = self.enabled_cluster(name).await?;
        Ok(self.run_pass(name, vec![cluster]).await)
    }

    /// A single unit, outside any pass.
    pub async fn reconcile_unit(&self, cluster: &str, account: &str) -> Result<UnitReport> {
        let cluster = Arc::new(self.enabled_cluster(cluster).await?);
        Ok(run_unit(self.unit_context(), cluster, account.to_string()).await)
    }

    /// Run a pass every `interval` until `shutdown` fires. A pass still
    /// running at shutdown is abandoned; its units are idempotent.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.run_with(shutdown, |_| async {}).await
    }

    /// As [`run`](Self::run), handing each completed pass to `on_pass`
    /// before the next tick. `on_pass` is not interrupted by shutdown.
    pub async fn run_with<F, Fut>(
        &self,
        shutdown: CancellationToken,
        mut on_pass: F,
    ) -> Result<()>
    where
        F: FnMut(PassReport) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!(
            interval_secs = self.config.interval.as_secs(),
            max_concurrency = self.config.max_concurrency,
            "Scheduler started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::warn!("Shutdown requested during a pass; abandoning in-flight units");
                    break;
                }
                result = self.reconcile_all() => result,
            };
            match result {
                Ok(report) => on_pass(report).await,
                Err(e) => tracing::error!(error = %e, "Pass aborted"),
            }
        }

        tracing::info!("Scheduler stopped");
        Ok(())
    }

    async fn enabled_cluster(&self, name: &str) -> Result<Cluster> {
        let cluster = self
            .reconciler
            .ledger()
            .cluster_by_name(name)
            .await?
            .ok_or_else(|| LedgerError::NotFound {
                entity: "cluster",
                key: name.to_string(),
            })?;
        if !cluster.enabled {
            return Err(Error::ClusterDisabled {
                cluster: name.to_string(),
            });
        }
        Ok(cluster)
    }

    fn unit_context(&self) -> UnitContext {
        UnitContext {
            reconciler: Arc::clone(&self.reconciler),
            locks: Arc::clone(&self.locks),
            permits: Arc::clone(&self.permits),
            unit_timeout: self.config.unit_timeout,
            lock_policy: self.config.lock_policy,
        }
    }

    async fn run_pass(&self, scope: &str, clusters: Vec<Cluster>) -> PassReport {
        let pass = PassSpan::new(scope);
        let metrics = self.reconciler.metrics();
        metrics.record_pass();
        let mut report = PassReport::new(pass.pass_id());

        let mut units = JoinSet::new();
        let mut identities = HashMap::new();

        let source = self.reconciler.source();
        let listings = join_all(clusters.into_iter().map(|cluster| async move {
            let listed = source.list_accounts(&cluster.name).await;
            (cluster, listed)
        }))
        .instrument(pass.span().clone())
        .await;

        for (cluster, listed) in listings {
            let accounts = match listed {
                Ok(accounts) => accounts,
                Err(e) => {
                    tracing::error!(
                        parent: pass.span(),
                        cluster = %cluster.name,
                        error = %e,
                        "Failed to list accounts; skipping cluster"
                    );
                    metrics.record_cluster_failure();
                    report.cluster_failures.push(ClusterFailure {
                        cluster: cluster.name.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };

            tracing::info!(
                parent: pass.span(),
                cluster = %cluster.name,
                accounts = accounts.len(),
                "Dispatching units"
            );

            let cluster = Arc::new(cluster);
            for account in accounts {
                let unit = run_unit(self.unit_context(), Arc::clone(&cluster), account.clone())
                    .instrument(pass.span().clone());
                let handle = units.spawn(unit);
                identities.insert(handle.id(), (cluster.name.clone(), account));
            }
        }

        while let Some(joined) = units.join_next_with_id().await {
            match joined {
                Ok((_, unit)) => report.units.push(unit),
                Err(e) => {
                    let (cluster, account) = identities.remove(&e.id()).unwrap_or_default();
                    tracing::error!(
                        parent: pass.span(),
                        cluster = %cluster,
                        account = %account,
                        error = %e,
                        "Unit panicked"
                    );
                    metrics.record_unit_end(false, 0.0);
                    report.units.push(UnitReport {
                        cluster,
                        account,
                        status: UnitStatus::Failed {
                            error: format!("unit panicked: {}", e),
                        },
                        duration_ms: 0,
                    });
                }
            }
        }

        self.locks.prune();
        report.sort();

        let failed = report.failed();
        tracing::info!(
            parent: pass.span(),
            units = report.units.len(),
            reconciled = report.count("reconciled"),
            locked = report.count("locked"),
            skipped = report.count("skipped"),
            failed,
            cluster_failures = report.cluster_failures.len(),
            "Pass complete"
        );
        pass.finish(report.units.len(), failed);
        report
    }
}

async fn run_unit(ctx: UnitContext, cluster: Arc<Cluster>, account: String) -> UnitReport {
    let _permit = ctx.permits.acquire().await.ok();

    let metrics = ctx.reconciler.metrics();
    let span = UnitSpan::new(&cluster.name, &account);
    metrics.record_unit_start();

    let work = async {
        let _guard = ctx
            .locks
            .acquire_with(ctx.lock_policy, &cluster.name, &account)
            .await?;
        Some(ctx.reconciler.reconcile_account(&cluster, &account).await)
    };

    let status = match tokio::time::timeout(ctx.unit_timeout, work.instrument(span.span().clone()))
        .await
    {
        Ok(None) => {
            tracing::info!(cluster = %cluster.name, account, "Account busy; skipped");
            UnitStatus::Skipped
        }
        Ok(Some(Ok(outcome))) => outcome.into(),
        Ok(Some(Err(e))) => {
            tracing::error!(cluster = %cluster.name, account, error = %e, "Unit failed");
            UnitStatus::Failed {
                error: e.to_string(),
            }
        }
        Err(_) => {
            tracing::warn!(
                cluster = %cluster.name,
                account,
                timeout_secs = ctx.unit_timeout.as_secs(),
                "Unit timed out; abandoned until next pass"
            );
            UnitStatus::TimedOut
        }
    };

    let elapsed_ms = span.finish(status.label());
    match status {
        UnitStatus::Skipped => metrics.record_unit_skipped(),
        UnitStatus::TimedOut => metrics.record_unit_timeout(elapsed_ms),
        ref other => metrics.record_unit_end(!other.is_failure(), elapsed_ms),
    }

    UnitReport {
        cluster: cluster.name.clone(),
        account,
        status,
        duration_ms: elapsed_ms as u64,
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::reconcile::FixedClock;
    use crate::source::{MemorySource, ScriptedFailure, SourceOp};
    use crate::types::{Allocation, AllocationRequest, Team};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn setup(source: MemorySource) -> (Arc<MemoryLedger>, Arc<MemorySource>, Scheduler) {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.insert_cluster(Cluster::new(1, "smp")).await;
        ledger.insert_cluster(Cluster::new(2, "gpu")).await;
        ledger.insert_team(Team::new(1, "physics")).await;
        ledger
            .insert_request(AllocationRequest::new(1, 1, "current").approve(
                date(2024, 1, 1),
                date(2024, 1, 1),
                date(2025, 1, 1),
            ))
            .await;
        ledger
            .insert_allocation(Allocation::new(1, 1, 1, 1000).with_awarded(1000))
            .await;
        ledger
            .insert_allocation(Allocation::new(2, 1, 2, 200).with_awarded(200))
            .await;

        let source = Arc::new(source);
        let reconciler = Reconciler::new(ledger.clone(), source.clone())
            .with_clock(Arc::new(FixedClock::new(date(2024, 6, 1))));
        let scheduler = Scheduler::new(Arc::new(reconciler), SchedulerConfig::default());
        (ledger, source, scheduler)
    }

    #[tokio::test]
    async fn test_pass_covers_every_enabled_cluster() {
        let source = MemorySource::new()
            .with_account("smp", "physics", 100, 0)
            .with_account("gpu", "physics", 10, 0)
            .with_account("smp", "root", 0, 0);
        let (_ledger, source, scheduler) = setup(source).await;

        let report = scheduler.reconcile_all().await.unwrap();
        assert_eq!(report.units.len(), 3);
        assert!(report.is_clean());
        assert_eq!(report.count("reserved"), 1);
        assert_eq!(source.limit("smp", "physics"), Some(1000));
        assert_eq!(source.limit("gpu", "physics"), Some(200));
        assert_eq!(scheduler.reconciler().metrics().passes_total.get(), 1);
        assert_eq!(scheduler.reconciler().metrics().units_in_flight.get(), 0);
    }

    #[tokio::test]
    async fn test_listing_failure_skips_only_that_cluster() {
        let source = MemorySource::new()
            .with_account("smp", "physics", 100, 0)
            .with_account("gpu", "physics", 10, 0);
        source.inject(ScriptedFailure::unavailable("gpu").on(SourceOp::ListAccounts));
        let (_ledger, source, scheduler) = setup(source).await;

        let report = scheduler.reconcile_all().await.unwrap();
        assert_eq!(report.cluster_failures.len(), 1);
        assert_eq!(report.cluster_failures[0].cluster, "gpu");
        assert_eq!(report.units.len(), 1);
        assert_eq!(source.limit("smp", "physics"), Some(1000));
        assert_eq!(source.limit("gpu", "physics"), Some(0));
    }

    #[tokio::test]
    async fn test_disabled_and_unknown_clusters() {
        let (ledger, _source, scheduler) = setup(MemorySource::new()).await;
        ledger.set_cluster_enabled("gpu", false).await.unwrap();

        let err = scheduler.reconcile_cluster("gpu").await.unwrap_err();
        assert!(matches!(err, Error::ClusterDisabled { .. }));

        let err = scheduler.reconcile_unit("nowhere", "physics").await.unwrap_err();
        assert!(matches!(
            err,
            Error::Ledger(LedgerError::NotFound { entity: "cluster", .. })
        ));
    }

    #[tokio::test]
    async fn test_skip_policy_reports_busy_account() {
        let source = MemorySource::new().with_account("smp", "physics", 100, 0);
        let (_ledger, source, scheduler) = setup(source).await;
        let scheduler = Scheduler::new(
            Arc::clone(scheduler.reconciler()),
            SchedulerConfig {
                lock_policy: LockPolicy::Skip,
                ..Default::default()
            },
        );

        let _held = scheduler.locks().acquire("smp", "physics").await;
        let unit = scheduler.reconcile_unit("smp", "physics").await.unwrap();
        assert_eq!(unit.status, UnitStatus::Skipped);
        assert!(source.set_calls().is_empty());
        assert_eq!(scheduler.reconciler().metrics().units_skipped.get(), 1);
    }

    #[tokio::test]
    async fn test_slow_unit_times_out() {
        let source = MemorySource::new()
            .with_latency(Duration::from_millis(200))
            .with_account("smp", "physics", 100, 0);
        let (_ledger, source, scheduler) = setup(source).await;
        let scheduler = Scheduler::new(
            Arc::clone(scheduler.reconciler()),
            SchedulerConfig {
                unit_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let unit = scheduler.reconcile_unit("smp", "physics").await.unwrap();
        assert_eq!(unit.status, UnitStatus::TimedOut);
        assert!(source.set_calls().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let source = MemorySource::new().with_account("smp", "physics", 100, 0);
        let (_ledger, source, scheduler) = setup(source).await;
        let shutdown = CancellationToken::new();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };
        // First tick fires immediately.
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(source.limit("smp", "physics"), Some(1000));
    }

    #[tokio::test]
    async fn test_run_hands_each_pass_to_hook() {
        let source = MemorySource::new().with_account("smp", "physics", 100, 0);
        let (_ledger, source, scheduler) = setup(source).await;
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                scheduler
                    .run_with(shutdown, move |report| {
                        let tx = tx.clone();
                        async move {
                            let _ = tx.send(report);
                        }
                    })
                    .await
            })
        };

        let report = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.count("reconciled"), 1);
        assert_eq!(source.limit("smp", "physics"), Some(1000));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}

//! Per-account reconciliation against the ledger and the accounting system.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;

use super::clock::{Clock, SystemClock};
use super::plan::{AccountPlan, Closure};
use crate::Result;
use crate::ledger::Ledger;
use crate::observability::MetricsRegistry;
use crate::source::UsageSource;
use crate::types::{AllocationId, Cluster};

#[derive(Clone, Debug)]
pub struct ReconcileOptions {
    /// Accounts whose limit is never touched.
    pub reserved_accounts: BTreeSet<String>,
    /// Compute and log without writing to the ledger or the accounting system.
    pub dry_run: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            reserved_accounts: BTreeSet::from(["root".to_string()]),
            dry_run: false,
        }
    }
}

impl ReconcileOptions {
    pub fn is_reserved(&self, account: &str) -> bool {
        self.reserved_accounts.contains(account)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountReport {
    /// Allocations whose `final` this pass wrote, in close-out order.
    pub closed: Vec<Closure>,
    /// Allocations a concurrent pass closed first.
    pub conflicts: Vec<AllocationId>,
    pub historical_usage: u64,
    pub active_awarded: u64,
    pub previous_limit: u64,
    pub new_limit: u64,
    pub usage: u64,
    pub dry_run: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AccountOutcome {
    /// Reserved account, left alone.
    Reserved,
    /// No team governs the account; its limit was frozen at `usage`.
    Locked { usage: u64 },
    Reconciled(AccountReport),
}

impl AccountOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reserved => "reserved",
            Self::Locked { .. } => "locked",
            Self::Reconciled(_) => "reconciled",
        }
    }

    pub fn report(&self) -> Option<&AccountReport> {
        match self {
            Self::Reconciled(report) => Some(report),
            _ => None,
        }
    }
}

pub struct Reconciler {
    ledger: Arc<dyn Ledger>,
    source: Arc<dyn UsageSource>,
    clock: Arc<dyn Clock>,
    options: ReconcileOptions,
    metrics: Arc<MetricsRegistry>,
}

impl Reconciler {
    pub fn new(ledger: Arc<dyn Ledger>, source: Arc<dyn UsageSource>) -> Self {
        Self {
            ledger,
            source,
            clock: Arc::new(SystemClock),
            options: ReconcileOptions::default(),
            metrics: Arc::new(MetricsRegistry::default()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_options(mut self, options: ReconcileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn source(&self) -> &Arc<dyn UsageSource> {
        &self.source
    }

    pub fn options(&self) -> &ReconcileOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Reconcile one account on one cluster.
    ///
    /// The caller is responsible for never running two units for the same
    /// (cluster, account) at once; ledger isolation and the `AlreadyClosed`
    /// guard are the fallback when that is violated.
    pub async fn reconcile_account(
        &self,
        cluster: &Cluster,
        account: &str,
    ) -> Result<AccountOutcome> {
        if self.options.is_reserved(account) {
            tracing::debug!(cluster = %cluster.name, account, "Skipping reserved account");
            return Ok(AccountOutcome::Reserved);
        }

        let mut txn = self.ledger.begin().await?;

        let Some(team) = txn.find_team(account).await? else {
            txn.rollback().await?;
            return self.lock_orphan(cluster, account).await;
        };

        let today = self.clock.today();
        let set = txn.allocations(team.id, cluster.id, today).await?;
        let previous_limit = self.source.get_limit(&cluster.name, account).await?;
        let usage = self.source.get_usage(&cluster.name, account).await?;

        let plan = AccountPlan::compute(&set, previous_limit, usage);
        let historical_before = set.historical_usage();
        if plan.historical_estimate < historical_before {
            tracing::warn!(
                cluster = %cluster.name,
                account,
                limit = previous_limit,
                estimate = plan.historical_estimate,
                recorded = historical_before,
                "Enforced limit is below recorded history; it may have been edited outside this system"
            );
        }
        tracing::debug!(
            cluster = %cluster.name,
            account,
            active_awarded = plan.active_awarded,
            closing_awarded = plan.closing_awarded,
            delta = plan.delta_to_apportion,
            "Computed close-out plan"
        );

        let mut closed = Vec::with_capacity(plan.closures.len());
        let mut conflicts = Vec::new();
        for closure in &plan.closures {
            match txn
                .close_allocation(closure.allocation, closure.final_usage)
                .await
            {
                Ok(()) => closed.push(*closure),
                Err(e) if e.is_already_closed() => {
                    tracing::warn!(
                        cluster = %cluster.name,
                        account,
                        allocation = %closure.allocation,
                        "Allocation already closed by another pass; leaving it"
                    );
                    self.metrics.record_close_conflict();
                    conflicts.push(closure.allocation);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let totals = txn.account_totals(team.id, cluster.id, today).await?;
        let new_limit = totals
            .historical_usage
            .saturating_add(totals.active_awarded);

        let report = AccountReport {
            closed,
            conflicts,
            historical_usage: totals.historical_usage,
            active_awarded: totals.active_awarded,
            previous_limit,
            new_limit,
            usage,
            dry_run: self.options.dry_run,
        };

        if self.options.dry_run {
            txn.rollback().await?;
            tracing::info!(
                cluster = %cluster.name,
                account,
                closing = report.closed.len(),
                previous_limit,
                new_limit,
                "Dry run: no changes written"
            );
            return Ok(AccountOutcome::Reconciled(report));
        }

        txn.commit().await?;
        for closure in &report.closed {
            self.metrics.record_close(closure.final_usage);
            tracing::info!(
                cluster = %cluster.name,
                account,
                allocation = %closure.allocation,
                awarded = closure.awarded,
                final_usage = closure.final_usage,
                "Closed expired allocation"
            );
        }

        self.source
            .set_limit(&cluster.name, account, new_limit)
            .await?;
        self.metrics.record_limit_pushed();
        tracing::info!(
            cluster = %cluster.name,
            account,
            previous_limit,
            new_limit,
            usage,
            "Limit updated"
        );

        Ok(AccountOutcome::Reconciled(report))
    }

    async fn lock_orphan(&self, cluster: &Cluster, account: &str) -> Result<AccountOutcome> {
        let usage = self.source.get_usage(&cluster.name, account).await?;
        if self.options.dry_run {
            tracing::info!(
                cluster = %cluster.name,
                account,
                usage,
                "Dry run: would lock account with no team"
            );
            return Ok(AccountOutcome::Locked { usage });
        }

        self.source.set_limit(&cluster.name, account, usage).await?;
        self.metrics.record_orphan_locked();
        self.metrics.record_limit_pushed();
        tracing::warn!(
            cluster = %cluster.name,
            account,
            usage,
            "No team for account; limit frozen at current usage"
        );
        Ok(AccountOutcome::Locked { usage })
    }
}

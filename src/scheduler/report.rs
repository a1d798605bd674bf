use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::reconcile::{AccountOutcome, AccountReport};

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Reconciled(AccountReport),
    Locked { usage: u64 },
    Reserved,
    /// The account's key was busy under the `skip` policy.
    Skipped,
    Failed { error: String },
    TimedOut,
}

impl UnitStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Reconciled(_) => "reconciled",
            Self::Locked { .. } => "locked",
            Self::Reserved => "reserved",
            Self::Skipped => "skipped",
            Self::Failed { .. } => "failed",
            Self::TimedOut => "timed_out",
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. } | Self::TimedOut)
    }
}

impl From<AccountOutcome> for UnitStatus {
    fn from(outcome: AccountOutcome) -> Self {
        match outcome {
            AccountOutcome::Reserved => Self::Reserved,
            AccountOutcome::Locked { usage } => Self::Locked { usage },
            AccountOutcome::Reconciled(report) => Self::Reconciled(report),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub cluster: String,
    pub account: String,
    #[serde(flatten)]
    pub status: UnitStatus,
    pub duration_ms: u64,
}

/// A cluster whose accounts could not be listed; none of its units ran.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterFailure {
    pub cluster: String,
    pub error: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct PassReport {
    pub pass_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub units: Vec<UnitReport>,
    pub cluster_failures: Vec<ClusterFailure>,
}

impl PassReport {
    pub fn new(pass_id: Uuid) -> Self {
        Self {
            pass_id,
            started_at: Utc::now(),
            units: Vec::new(),
            cluster_failures: Vec::new(),
        }
    }

    pub fn unit(&self, cluster: &str, account: &str) -> Option<&UnitReport> {
        self.units
            .iter()
            .find(|u| u.cluster == cluster && u.account == account)
    }

    pub fn failed(&self) -> usize {
        self.units.iter().filter(|u| u.status.is_failure()).count()
    }

    pub fn count(&self, label: &str) -> usize {
        self.units
            .iter()
            .filter(|u| u.status.label() == label)
            .count()
    }

    /// No unit failed and every cluster was listed.
    pub fn is_clean(&self) -> bool {
        self.failed() == 0 && self.cluster_failures.is_empty()
    }

    /// Units ordered by (cluster, account) for stable output.
    pub fn sort(&mut self) {
        self.units
            .sort_by(|a, b| (&a.cluster, &a.account).cmp(&(&b.cluster, &b.account)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(cluster: &str, account: &str, status: UnitStatus) -> UnitReport {
        UnitReport {
            cluster: cluster.into(),
            account: account.into(),
            status,
            duration_ms: 1,
        }
    }

    #[test]
    fn test_counts() {
        let mut report = PassReport::new(Uuid::new_v4());
        report.units.push(unit("smp", "b", UnitStatus::Reserved));
        report.units.push(unit(
            "smp",
            "a",
            UnitStatus::Failed {
                error: "boom".into(),
            },
        ));
        report.units.push(unit("gpu", "a", UnitStatus::TimedOut));
        report.sort();

        assert_eq!(report.failed(), 2);
        assert_eq!(report.count("reserved"), 1);
        assert!(!report.is_clean());
        assert_eq!(report.units[0].cluster, "gpu");
        assert!(report.unit("smp", "b").is_some());
    }

    #[test]
    fn test_unit_status_is_flattened() {
        let json = serde_json::to_value(unit("smp", "a", UnitStatus::Locked { usage: 9 })).unwrap();
        assert_eq!(json["status"], "locked");
        assert_eq!(json["usage"], 9);
        assert_eq!(json["account"], "a");
    }
}

//! Allocation Ledger
//!
//! The persisted record of every award a team holds on a cluster. All reads
//! and the `final` writes of one reconciliation unit go through a single
//! [`LedgerTransaction`] so they observe one consistent snapshot.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{LedgerFixture, MemoryLedger};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresLedger, PostgresLedgerConfig};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{
    Allocation, AllocationId, AllocationPhase, AllocationRequest, Cluster, ClusterId, Team, TeamId,
};

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Ledger unavailable: {message}")]
    Unavailable { message: String },

    #[error("Allocation {allocation} is already closed")]
    AlreadyClosed { allocation: AllocationId },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("Storage error: {message}")]
    Storage { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LedgerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }

    pub fn is_already_closed(&self) -> bool {
        matches!(self, Self::AlreadyClosed { .. })
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

pub(crate) trait StorageResultExt<T> {
    fn storage_err_ctx(self, context: &str) -> LedgerResult<T>;
}

impl<T, E: std::fmt::Display> StorageResultExt<T> for std::result::Result<T, E> {
    fn storage_err_ctx(self, context: &str) -> LedgerResult<T> {
        self.map_err(|e| LedgerError::Storage {
            message: format!("{}: {}", context, e),
        })
    }
}

/// Entry point to a ledger backend.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    fn name(&self) -> &str;

    async fn enabled_clusters(&self) -> LedgerResult<Vec<Cluster>>;

    async fn cluster_by_name(&self, name: &str) -> LedgerResult<Option<Cluster>>;

    /// Open a transaction. Dropping it without `commit` rolls it back.
    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>>;
}

/// One consistent read-view plus the `final` writes made through it.
#[async_trait::async_trait]
pub trait LedgerTransaction: Send {
    async fn find_team(&mut self, name: &str) -> LedgerResult<Option<Team>>;

    /// Allocations of approved requests of `team` on `cluster`, partitioned
    /// relative to `today`. `closing` is ordered by `(expire, id)`.
    async fn allocations(
        &mut self,
        team: TeamId,
        cluster: ClusterId,
        today: NaiveDate,
    ) -> LedgerResult<AllocationSet>;

    /// Write `final` exactly once.
    async fn close_allocation(&mut self, id: AllocationId, final_usage: u64) -> LedgerResult<()>;

    async fn account_totals(
        &mut self,
        team: TeamId,
        cluster: ClusterId,
        today: NaiveDate,
    ) -> LedgerResult<AccountTotals>;

    async fn commit(self: Box<Self>) -> LedgerResult<()>;

    async fn rollback(self: Box<Self>) -> LedgerResult<()>;
}

/// An allocation together with the window of its parent request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerAllocation {
    pub allocation: Allocation,
    pub active: NaiveDate,
    pub expire: NaiveDate,
}

impl LedgerAllocation {
    pub fn id(&self) -> AllocationId {
        self.allocation.id
    }

    pub fn awarded(&self) -> u64 {
        self.allocation.awarded_or_zero()
    }

    pub fn phase(&self, today: NaiveDate) -> AllocationPhase {
        if self.allocation.is_closed() {
            AllocationPhase::Closed
        } else if self.expire <= today {
            AllocationPhase::Closing
        } else if self.active <= today {
            AllocationPhase::Active
        } else {
            AllocationPhase::Pending
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSet {
    pub active: Vec<LedgerAllocation>,
    pub closing: Vec<LedgerAllocation>,
    pub historical: Vec<LedgerAllocation>,
}

impl AllocationSet {
    /// Partition `(allocation, request)` pairs as of `today`. Allocations of
    /// unapproved or undated requests are left out.
    pub fn partition<'a>(
        entries: impl IntoIterator<Item = (&'a Allocation, &'a AllocationRequest)>,
        today: NaiveDate,
    ) -> Self {
        Self::from_entries(
            entries.into_iter().filter_map(|(allocation, request)| {
                let (active, expire) = request.window()?;
                Some(LedgerAllocation {
                    allocation: allocation.clone(),
                    active,
                    expire,
                })
            }),
            today,
        )
    }

    /// Partition entries whose windows are already known.
    pub fn from_entries(
        entries: impl IntoIterator<Item = LedgerAllocation>,
        today: NaiveDate,
    ) -> Self {
        let mut set = Self::default();
        for entry in entries {
            match entry.phase(today) {
                AllocationPhase::Active => set.active.push(entry),
                AllocationPhase::Closing => set.closing.push(entry),
                AllocationPhase::Closed if entry.expire <= today => set.historical.push(entry),
                _ => {}
            }
        }
        set.sort();
        set
    }

    pub fn sort(&mut self) {
        for part in [&mut self.active, &mut self.closing, &mut self.historical] {
            part.sort_by_key(|e| (e.expire, e.allocation.id));
        }
    }

    pub fn active_awarded(&self) -> u64 {
        sum_awarded(&self.active)
    }

    pub fn closing_awarded(&self) -> u64 {
        sum_awarded(&self.closing)
    }

    pub fn historical_usage(&self) -> u64 {
        sum_final(&self.historical)
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.closing.is_empty() && self.historical.is_empty()
    }
}

/// Sum of `awarded`; an empty set sums to zero.
pub fn sum_awarded<'a>(entries: impl IntoIterator<Item = &'a LedgerAllocation>) -> u64 {
    entries
        .into_iter()
        .fold(0u64, |acc, e| acc.saturating_add(e.awarded()))
}

/// Sum of `final`; unset values count as zero.
pub fn sum_final<'a>(entries: impl IntoIterator<Item = &'a LedgerAllocation>) -> u64 {
    entries.into_iter().fold(0u64, |acc, e| {
        acc.saturating_add(e.allocation.final_usage.unwrap_or(0))
    })
}

/// Aggregates re-read after close-out.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountTotals {
    pub active_awarded: u64,
    pub historical_usage: u64,
}

impl From<&AllocationSet> for AccountTotals {
    fn from(set: &AllocationSet) -> Self {
        Self {
            active_awarded: set.active_awarded(),
            historical_usage: set.historical_usage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RequestStatus;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn request(id: i64, active: NaiveDate, expire: NaiveDate) -> AllocationRequest {
        AllocationRequest::new(id, 1, format!("request {id}")).approve(active, active, expire)
    }

    #[test]
    fn test_partition_and_order() {
        let today = date(2024, 6, 1);
        let r_active = request(1, date(2024, 1, 1), date(2025, 1, 1));
        let r_late = request(2, date(2023, 1, 1), date(2024, 5, 1));
        let r_early = request(3, date(2023, 1, 1), date(2024, 3, 1));
        let r_future = request(4, date(2024, 9, 1), date(2025, 9, 1));
        let mut r_declined = request(5, date(2024, 1, 1), date(2025, 1, 1));
        r_declined.status = RequestStatus::Declined;

        let a_active = Allocation::new(10, 1, 1, 1000).with_awarded(1000);
        let a_late = Allocation::new(11, 2, 1, 300).with_awarded(300);
        let a_early = Allocation::new(12, 3, 1, 200).with_awarded(200);
        let mut a_closed = Allocation::new(13, 3, 1, 50).with_awarded(50);
        a_closed.final_usage = Some(40);
        let a_future = Allocation::new(14, 4, 1, 10).with_awarded(10);
        let a_declined = Allocation::new(15, 5, 1, 10).with_awarded(10);

        let set = AllocationSet::partition(
            [
                (&a_active, &r_active),
                (&a_late, &r_late),
                (&a_early, &r_early),
                (&a_closed, &r_early),
                (&a_future, &r_future),
                (&a_declined, &r_declined),
            ],
            today,
        );

        assert_eq!(set.active_awarded(), 1000);
        assert_eq!(set.closing_awarded(), 500);
        assert_eq!(set.historical_usage(), 40);
        let closing: Vec<_> = set.closing.iter().map(|e| e.id()).collect();
        assert_eq!(closing, vec![AllocationId(12), AllocationId(11)]);
    }

    #[test]
    fn test_empty_sums_are_zero() {
        let set = AllocationSet::default();
        assert!(set.is_empty());
        assert_eq!(set.active_awarded(), 0);
        assert_eq!(set.historical_usage(), 0);
        assert_eq!(AccountTotals::from(&set), AccountTotals::default());
    }

    #[test]
    fn test_missing_award_counts_as_zero() {
        let entry = LedgerAllocation {
            allocation: Allocation::new(1, 1, 1, 500),
            active: date(2024, 1, 1),
            expire: date(2024, 2, 1),
        };
        assert_eq!(sum_awarded([&entry]), 0);
    }

    #[test]
    fn test_error_classification() {
        assert!(LedgerError::Unavailable {
            message: "pool timed out".into()
        }
        .is_transient());
        let closed = LedgerError::AlreadyClosed {
            allocation: AllocationId(7),
        };
        assert!(closed.is_already_closed());
        assert!(!closed.is_transient());
        assert!(closed.to_string().contains('7'));
    }
}

//! # hpc-allocations
//!
//! Service-unit (SU) allocation accounting for HPC clusters.
//!
//! Research teams receive SU awards per cluster. The batch scheduler's
//! accounting system enforces one cumulative limit per account, and this
//! crate keeps that limit equal to "usage already charged to closed awards
//! plus the awards still active". Each pass it closes out expired awards by
//! apportioning the usage accrued since the previous pass, then pushes the
//! recomputed limit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use hpc_allocations::ledger::MemoryLedger;
//! use hpc_allocations::reconcile::Reconciler;
//! use hpc_allocations::scheduler::{Scheduler, SchedulerConfig};
//! use hpc_allocations::source::{SlurmConfig, SlurmSource};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), hpc_allocations::Error> {
//!     let ledger = Arc::new(MemoryLedger::from_fixture_file("ledger.json").await?);
//!     let source = Arc::new(SlurmSource::new(SlurmConfig::default()));
//!     let reconciler = Arc::new(Reconciler::new(ledger, source));
//!
//!     let scheduler = Scheduler::new(reconciler, SchedulerConfig::default());
//!     let report = scheduler.reconcile_all().await?;
//!     println!("{} units, {} failed", report.units.len(), report.failed());
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod ledger;
pub mod observability;
pub mod prelude;
pub mod reconcile;
pub mod resilience;
pub mod scheduler;
pub mod source;
pub mod types;

pub use config::{ConfigBuilder, ConfigError, Settings};
pub use ledger::{Ledger, LedgerError, LedgerTransaction, MemoryLedger};
pub use observability::{MetricsRegistry, MetricsSummary, ObservabilityConfig};
pub use reconcile::{AccountOutcome, AccountReport, ReconcileOptions, Reconciler};
pub use resilience::{CircuitConfig, ExponentialBackoff, ResilienceConfig};
pub use scheduler::{PassReport, Scheduler, SchedulerConfig, UnitReport, UnitStatus};
pub use source::{MemorySource, ResilientSource, SlurmSource, SourceError, UsageSource};
pub use types::{Allocation, AllocationRequest, Cluster, Team};

/// Error type for reconciliation operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The accounting system failed or rejected a call.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The allocation ledger failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Operation exceeded timeout.
    #[error("Operation timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(std::time::Duration),

    /// The cluster exists but is excluded from reconciliation.
    #[error("Cluster {cluster} is disabled")]
    ClusterDisabled { cluster: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Error category for unified error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Configuration or an operator request that cannot succeed as given
    Configuration,
    /// Failures that may succeed on the next pass
    Transient,
    /// Missing accounts, teams or clusters
    NotFound,
    /// A concurrent pass got there first
    Conflict,
    /// Internal errors (IO, JSON, storage)
    Internal,
}

impl Error {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Config(_) | Error::ClusterDisabled { .. } => ErrorCategory::Configuration,

            Error::Source(e) if e.is_transient() => ErrorCategory::Transient,
            Error::Source(SourceError::CircuitOpen { .. }) => ErrorCategory::Transient,
            Error::Source(SourceError::AccountNotFound { .. }) => ErrorCategory::NotFound,
            Error::Source(_) => ErrorCategory::Internal,

            Error::Ledger(e) if e.is_transient() => ErrorCategory::Transient,
            Error::Ledger(LedgerError::AlreadyClosed { .. }) => ErrorCategory::Conflict,
            Error::Ledger(LedgerError::NotFound { .. }) => ErrorCategory::NotFound,
            Error::Ledger(_) => ErrorCategory::Internal,

            Error::Timeout(_) => ErrorCategory::Transient,
            Error::Io(_) | Error::Json(_) => ErrorCategory::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.category() == ErrorCategory::NotFound
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::AllocationId;

    #[test]
    fn test_error_categories() {
        let unavailable = Error::from(SourceError::Unavailable {
            cluster: "smp".into(),
            message: "slurmdbd down".into(),
        });
        assert!(unavailable.is_retryable());

        let missing = Error::from(SourceError::AccountNotFound {
            cluster: "smp".into(),
            account: "physics".into(),
        });
        assert!(missing.is_not_found());
        assert!(!missing.is_retryable());

        let conflict = Error::from(LedgerError::AlreadyClosed {
            allocation: AllocationId(7),
        });
        assert_eq!(conflict.category(), ErrorCategory::Conflict);

        let disabled = Error::ClusterDisabled {
            cluster: "gpu".into(),
        };
        assert_eq!(disabled.category(), ErrorCategory::Configuration);
        assert!(disabled.to_string().contains("gpu"));

        assert!(Error::Timeout(Duration::from_secs(300)).is_retryable());
    }

    #[test]
    fn test_source_error_is_transparent() {
        let err = Error::from(SourceError::AccountNotFound {
            cluster: "smp".into(),
            account: "physics".into(),
        });
        assert_eq!(err.to_string(), "Account physics not found on cluster smp");
    }
}

//! Usage source adapter: the narrow contract to the external batch-scheduler
//! accounting system.
//!
//! All calls are keyed by cluster name and account name and deal in
//! non-negative integer billing units. Implementations:
//!
//! - [`SlurmSource`]: drives `sacctmgr` / `sshare`.
//! - [`MemorySource`]: in-process accounting system for tests and dry runs.
//! - [`ResilientSource`]: wraps any source with timeout, retry and circuit breaking.

mod memory;
mod resilient;
mod slurm;

pub use memory::{
    AccountRecord, MemorySource, ScriptedFailure, SetLimitCall, SourceFixture, SourceOp,
};
pub use resilient::ResilientSource;
pub use slurm::{SlurmConfig, SlurmSource, parse_billing};

use std::collections::BTreeSet;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SourceError {
    #[error("Accounting system unavailable for cluster {cluster}: {message}")]
    Unavailable { cluster: String, message: String },

    #[error("Account {account} not found on cluster {cluster}")]
    AccountNotFound { cluster: String, account: String },

    #[error("Accounting call timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("Circuit open for cluster {cluster}")]
    CircuitOpen { cluster: String },

    #[error("Unparsable output from `{command}`: {output}")]
    Parse { command: String, output: String },

    #[error("Failed to run accounting command: {0}")]
    Io(String),
}

impl SourceError {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable { .. } | Self::Timeout(_) | Self::Io(_)
        )
    }

    pub fn is_account_not_found(&self) -> bool {
        matches!(self, Self::AccountNotFound { .. })
    }
}

pub type SourceResult<T> = std::result::Result<T, SourceError>;

/// Contract consumed by the reconciliation engine.
#[async_trait::async_trait]
pub trait UsageSource: Send + Sync {
    fn name(&self) -> &str;

    /// Accounts the accounting system currently recognizes on `cluster`.
    async fn list_accounts(&self, cluster: &str) -> SourceResult<BTreeSet<String>>;

    /// Cumulative billed usage of `account` on `cluster`.
    async fn get_usage(&self, cluster: &str, account: &str) -> SourceResult<u64>;

    /// Currently enforced usage ceiling of `account` on `cluster`.
    async fn get_limit(&self, cluster: &str, account: &str) -> SourceResult<u64>;

    /// Replace the enforced ceiling. Setting the same value twice is a no-op.
    async fn set_limit(&self, cluster: &str, account: &str, limit: u64) -> SourceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let unavailable = SourceError::Unavailable {
            cluster: "smp".into(),
            message: "refused".into(),
        };
        assert!(unavailable.is_transient());
        assert!(SourceError::Timeout(Duration::from_secs(1)).is_transient());

        let missing = SourceError::AccountNotFound {
            cluster: "smp".into(),
            account: "ghost".into(),
        };
        assert!(!missing.is_transient());
        assert!(missing.is_account_not_found());
        assert!(missing.to_string().contains("ghost"));

        let open = SourceError::CircuitOpen {
            cluster: "smp".into(),
        };
        assert!(!open.is_transient());
    }
}

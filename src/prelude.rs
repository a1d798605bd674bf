//! Prelude module for convenient imports.
//!
//! ```rust
//! use hpc_allocations::prelude::*;
//! ```

pub use crate::Error;
pub use crate::Result;

// Data model
pub use crate::types::{
    Allocation, AllocationId, AllocationPhase, AllocationRequest, Cluster, ClusterId, Team, TeamId,
};

// Ledger
pub use crate::ledger::{AllocationSet, Ledger, LedgerTransaction, MemoryLedger};

// Accounting system
pub use crate::source::{MemorySource, ResilientSource, SlurmSource, UsageSource};

// Reconciliation
pub use crate::reconcile::{AccountOutcome, AccountPlan, Clock, ReconcileOptions, Reconciler};
pub use crate::scheduler::{PassReport, Scheduler, SchedulerConfig, UnitStatus};

// Configuration
pub use crate::config::{ConfigBuilder, Settings};

//! Reconciliation Engine
//!
//! [`AccountPlan`] is the pure arithmetic: how much of the usage accrued
//! since the last pass each expired allocation absorbs. [`Reconciler`] runs
//! it inside a ledger transaction and pushes the resulting limit.

mod clock;
mod engine;
mod plan;

pub use clock::{Clock, FixedClock, SystemClock};
pub use engine::{AccountOutcome, AccountReport, ReconcileOptions, Reconciler};
pub use plan::{AccountPlan, Closure};

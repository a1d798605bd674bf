//! Pure close-out and limit arithmetic for one account.

use serde::Serialize;

use crate::ledger::AllocationSet;
use crate::types::AllocationId;

/// A `final` value to write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Closure {
    pub allocation: AllocationId,
    pub awarded: u64,
    pub final_usage: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AccountPlan {
    pub active_awarded: u64,
    pub closing_awarded: u64,
    /// `limit - active - closing`, floored at zero: the usage the previous
    /// pass had already folded into history.
    pub historical_estimate: u64,
    /// Usage accrued since the previous pass.
    pub delta_to_apportion: u64,
    /// In ascending `(expire, id)` order.
    pub closures: Vec<Closure>,
    /// Delta left after every closing allocation took its share.
    pub unapportioned: u64,
}

impl AccountPlan {
    pub fn compute(set: &AllocationSet, current_limit: u64, current_usage: u64) -> Self {
        let active_awarded = set.active_awarded();
        let closing_awarded = set.closing_awarded();
        let historical_estimate =
            current_limit.saturating_sub(active_awarded.saturating_add(closing_awarded));
        let delta_to_apportion = current_usage.saturating_sub(historical_estimate);

        let mut remaining = delta_to_apportion;
        let closures = set
            .closing
            .iter()
            .map(|entry| {
                let awarded = entry.awarded();
                let final_usage = remaining.min(awarded);
                remaining = remaining.saturating_sub(final_usage);
                Closure {
                    allocation: entry.id(),
                    awarded,
                    final_usage,
                }
            })
            .collect();

        Self {
            active_awarded,
            closing_awarded,
            historical_estimate,
            delta_to_apportion,
            closures,
            unapportioned: remaining,
        }
    }

    /// Sum of the planned `final` values.
    pub fn closed_usage(&self) -> u64 {
        self.closures
            .iter()
            .fold(0u64, |acc, c| acc.saturating_add(c.final_usage))
    }

    /// Limit that follows if every closure lands, given the ledger's
    /// historical usage before this pass.
    pub fn projected_limit(&self, historical_before: u64) -> u64 {
        historical_before
            .saturating_add(self.closed_usage())
            .saturating_add(self.active_awarded)
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use proptest::prelude::*;

    use super::*;
    use crate::ledger::LedgerAllocation;
    use crate::types::Allocation;

    fn date(days: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + chrono::Days::new(days as u64)
    }

    fn entry(id: i64, awarded: u64, expire_day: u32) -> LedgerAllocation {
        LedgerAllocation {
            allocation: Allocation::new(id, id, 1, awarded).with_awarded(awarded),
            active: date(0),
            expire: date(expire_day),
        }
    }

    fn set(active: &[u64], closing: &[(u64, u32)]) -> AllocationSet {
        let mut set = AllocationSet::default();
        set.active = active
            .iter()
            .enumerate()
            .map(|(i, &a)| entry(100 + i as i64, a, 400))
            .collect();
        set.closing = closing
            .iter()
            .enumerate()
            .map(|(i, &(a, day))| entry(1 + i as i64, a, day))
            .collect();
        set.sort();
        set
    }

    #[test]
    fn test_negative_estimate_is_clamped() {
        let plan = AccountPlan::compute(&set(&[1000], &[(500, 10)]), 1200, 1300);
        assert_eq!(plan.historical_estimate, 0);
        assert_eq!(plan.delta_to_apportion, 1300);
        assert_eq!(plan.closures[0].final_usage, 500);
        assert_eq!(plan.unapportioned, 800);
        assert_eq!(plan.projected_limit(0), 1500);
    }

    #[test]
    fn test_earlier_expiry_is_charged_first() {
        let plan = AccountPlan::compute(&set(&[], &[(400, 20), (300, 10)]), 700, 500);
        assert_eq!(plan.delta_to_apportion, 500);
        assert_eq!(plan.closures[0].awarded, 300);
        assert_eq!(plan.closures[0].final_usage, 300);
        assert_eq!(plan.closures[1].final_usage, 200);
        assert_eq!(plan.unapportioned, 0);
    }

    #[test]
    fn test_usage_below_history_yields_zero_finals() {
        let plan = AccountPlan::compute(&set(&[100], &[(50, 1)]), 1150, 900);
        assert_eq!(plan.historical_estimate, 1000);
        assert_eq!(plan.delta_to_apportion, 0);
        assert_eq!(plan.closures[0].final_usage, 0);
    }

    #[test]
    fn test_nothing_closing() {
        let plan = AccountPlan::compute(&set(&[1000], &[]), 1500, 1400);
        assert!(plan.closures.is_empty());
        assert_eq!(plan.closed_usage(), 0);
        assert_eq!(plan.projected_limit(500), 1500);
    }

    proptest! {
        #[test]
        fn prop_finals_are_bounded(
            active in prop::collection::vec(0u64..10_000, 0..4),
            closing in prop::collection::vec((0u64..10_000, 0u32..60), 0..6),
            limit in 0u64..50_000,
            usage in 0u64..50_000,
        ) {
            let set = set(&active, &closing);
            let plan = AccountPlan::compute(&set, limit, usage);

            prop_assert!(plan.delta_to_apportion <= usage);
            for closure in &plan.closures {
                prop_assert!(closure.final_usage <= closure.awarded);
            }
            prop_assert!(plan.closed_usage() <= plan.closing_awarded);
            prop_assert_eq!(plan.closed_usage() + plan.unapportioned, plan.delta_to_apportion);
        }

        #[test]
        fn prop_charges_follow_expiry_order(
            closing in prop::collection::vec((1u64..10_000, 0u32..60), 1..6),
            usage in 0u64..50_000,
        ) {
            let set = set(&[], &closing);
            let plan = AccountPlan::compute(&set, 0, usage);

            // Once an allocation is charged short, every later one gets nothing.
            let mut exhausted = false;
            for closure in &plan.closures {
                if exhausted {
                    prop_assert_eq!(closure.final_usage, 0);
                }
                if closure.final_usage < closure.awarded {
                    exhausted = true;
                }
            }
            prop_assert_eq!(plan.closures[0].final_usage, usage.min(plan.closures[0].awarded));
        }
    }
}

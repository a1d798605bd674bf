//! Per-(cluster, account) mutual exclusion.

use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

/// What a unit does when its key is already held.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LockPolicy {
    /// Queue behind the holder.
    #[default]
    Wait,
    /// Give up and report the unit as skipped.
    Skip,
}

impl FromStr for LockPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wait" => Ok(Self::Wait),
            "skip" => Ok(Self::Skip),
            other => Err(format!("expected 'wait' or 'skip', got '{}'", other)),
        }
    }
}

/// Held for the whole duration of one unit.
pub type AccountGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct AccountLocks {
    locks: DashMap<(String, String), Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, cluster: &str, account: &str) -> Arc<Mutex<()>> {
        // Clone out so the shard lock is released before any await.
        self.locks
            .entry((cluster.to_string(), account.to_string()))
            .or_default()
            .clone()
    }

    pub async fn acquire(&self, cluster: &str, account: &str) -> AccountGuard {
        self.slot(cluster, account).lock_owned().await
    }

    pub fn try_acquire(&self, cluster: &str, account: &str) -> Option<AccountGuard> {
        self.slot(cluster, account).try_lock_owned().ok()
    }

    pub async fn acquire_with(
        &self,
        policy: LockPolicy,
        cluster: &str,
        account: &str,
    ) -> Option<AccountGuard> {
        match policy {
            LockPolicy::Wait => Some(self.acquire(cluster, account).await),
            LockPolicy::Skip => self.try_acquire(cluster, account),
        }
    }

    pub fn is_held(&self, cluster: &str, account: &str) -> bool {
        self.locks
            .get(&(cluster.to_string(), account.to_string()))
            .is_some_and(|m| m.try_lock().is_err())
    }

    /// Drop slots nobody holds or waits on.
    pub fn prune(&self) {
        self.locks.retain(|_, m| Arc::strong_count(m) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_policy_parse() {
        assert_eq!("wait".parse::<LockPolicy>().unwrap(), LockPolicy::Wait);
        assert_eq!(" SKIP ".parse::<LockPolicy>().unwrap(), LockPolicy::Skip);
        assert!("block".parse::<LockPolicy>().is_err());
    }

    #[tokio::test]
    async fn test_same_key_excludes() {
        let locks = AccountLocks::new();
        let guard = locks.acquire("smp", "physics").await;
        assert!(locks.is_held("smp", "physics"));
        assert!(locks.try_acquire("smp", "physics").is_none());
        assert!(locks
            .acquire_with(LockPolicy::Skip, "smp", "physics")
            .await
            .is_none());

        drop(guard);
        assert!(locks.try_acquire("smp", "physics").is_some());
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let locks = AccountLocks::new();
        let _a = locks.acquire("smp", "physics").await;
        assert!(locks.try_acquire("gpu", "physics").is_some());
        assert!(locks.try_acquire("smp", "chemistry").is_some());
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let locks = Arc::new(AccountLocks::new());
        let guard = locks.acquire("smp", "physics").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire_with(LockPolicy::Wait, "smp", "physics").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_prune_keeps_held_slots() {
        let locks = AccountLocks::new();
        let held = locks.acquire("smp", "physics").await;
        drop(locks.acquire("smp", "chemistry").await);

        locks.prune();
        assert_eq!(locks.len(), 1);
        drop(held);
        locks.prune();
        assert!(locks.is_empty());
    }
}

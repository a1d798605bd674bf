//! In-process accounting system.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{SourceError, SourceResult, UsageSource};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceOp {
    ListAccounts,
    GetUsage,
    GetLimit,
    SetLimit,
}

/// A failure injected into upcoming calls.
#[derive(Clone, Debug)]
pub struct ScriptedFailure {
    pub cluster: String,
    /// `None` matches every operation.
    pub op: Option<SourceOp>,
    pub error: SourceError,
    /// `None` fails forever.
    pub remaining: Option<u32>,
}

impl ScriptedFailure {
    pub fn unavailable(cluster: impl Into<String>) -> Self {
        let cluster = cluster.into();
        Self {
            error: SourceError::Unavailable {
                cluster: cluster.clone(),
                message: "scripted outage".into(),
            },
            cluster,
            op: None,
            remaining: None,
        }
    }

    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    pub fn on(mut self, op: SourceOp) -> Self {
        self.op = Some(op);
        self
    }

    pub fn with_error(mut self, error: SourceError) -> Self {
        self.error = error;
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetLimitCall {
    pub cluster: String,
    pub account: String,
    pub limit: u64,
}

/// One account as stored in a [`SourceFixture`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub cluster: String,
    pub account: String,
    pub usage: u64,
    pub limit: u64,
}

/// JSON form of a [`MemorySource`]'s accounts.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFixture {
    pub accounts: Vec<AccountRecord>,
}

#[derive(Clone, Copy, Debug, Default)]
struct AccountState {
    usage: u64,
    limit: u64,
}

#[derive(Default)]
struct State {
    clusters: BTreeMap<String, BTreeMap<String, AccountState>>,
    failures: VecDeque<ScriptedFailure>,
    set_calls: Vec<SetLimitCall>,
}

/// Accounting system held in memory, with scripted failures and a record of
/// every limit written.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<State>,
    latency: Option<Duration>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: SourceFixture) -> Self {
        let source = Self::new();
        for record in fixture.accounts {
            source.upsert_account(&record.cluster, &record.account, record.usage, record.limit);
        }
        source
    }

    pub async fn from_fixture_file(path: impl AsRef<Path>) -> SourceResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SourceError::Io(format!("reading {}: {}", path.display(), e)))?;
        let fixture: SourceFixture =
            serde_json::from_str(&content).map_err(|e| SourceError::Parse {
                command: path.display().to_string(),
                output: e.to_string(),
            })?;
        tracing::debug!(
            path = %path.display(),
            accounts = fixture.accounts.len(),
            "Loaded accounting fixture"
        );
        Ok(Self::from_fixture(fixture))
    }

    pub fn to_fixture(&self) -> SourceFixture {
        let state = self.lock();
        let accounts = state
            .clusters
            .iter()
            .flat_map(|(cluster, accounts)| {
                accounts.iter().map(move |(account, a)| AccountRecord {
                    cluster: cluster.clone(),
                    account: account.clone(),
                    usage: a.usage,
                    limit: a.limit,
                })
            })
            .collect();
        SourceFixture { accounts }
    }

    /// Persist accounts and their current limits.
    pub async fn write_fixture_file(&self, path: impl AsRef<Path>) -> SourceResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.to_fixture()).map_err(|e| {
            SourceError::Io(format!("encoding {}: {}", path.display(), e))
        })?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| SourceError::Io(format!("writing {}: {}", path.display(), e)))
    }

    /// Delay applied before every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn with_account(self, cluster: &str, account: &str, usage: u64, limit: u64) -> Self {
        self.upsert_account(cluster, account, usage, limit);
        self
    }

    pub fn upsert_account(&self, cluster: &str, account: &str, usage: u64, limit: u64) {
        let mut state = self.lock();
        state
            .clusters
            .entry(cluster.to_string())
            .or_default()
            .insert(account.to_string(), AccountState { usage, limit });
    }

    pub fn remove_account(&self, cluster: &str, account: &str) {
        if let Some(accounts) = self.lock().clusters.get_mut(cluster) {
            accounts.remove(account);
        }
    }

    /// Simulate jobs billing `amount` units.
    pub fn add_usage(&self, cluster: &str, account: &str, amount: u64) {
        if let Some(acct) = self
            .lock()
            .clusters
            .get_mut(cluster)
            .and_then(|a| a.get_mut(account))
        {
            acct.usage = acct.usage.saturating_add(amount);
        }
    }

    pub fn inject(&self, failure: ScriptedFailure) {
        self.lock().failures.push_back(failure);
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    pub fn usage(&self, cluster: &str, account: &str) -> Option<u64> {
        self.account(cluster, account).map(|a| a.usage)
    }

    pub fn limit(&self, cluster: &str, account: &str) -> Option<u64> {
        self.account(cluster, account).map(|a| a.limit)
    }

    pub fn set_calls(&self) -> Vec<SetLimitCall> {
        self.lock().set_calls.clone()
    }

    fn account(&self, cluster: &str, account: &str) -> Option<AccountState> {
        self.lock()
            .clusters
            .get(cluster)
            .and_then(|a| a.get(account))
            .copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn enter(&self, cluster: &str, op: SourceOp) -> SourceResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        let hit = state
            .failures
            .iter()
            .position(|f| f.cluster == cluster && f.op.is_none_or(|o| o == op));
        let Some(index) = hit else {
            return Ok(());
        };

        let error = state.failures[index].error.clone();
        match state.failures[index].remaining {
            Some(n) if n <= 1 => {
                state.failures.remove(index);
            }
            Some(n) => state.failures[index].remaining = Some(n - 1),
            None => {}
        }
        Err(error)
    }

    fn not_found(cluster: &str, account: &str) -> SourceError {
        SourceError::AccountNotFound {
            cluster: cluster.to_string(),
            account: account.to_string(),
        }
    }
}

#[async_trait::async_trait]
impl UsageSource for MemorySource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_accounts(&self, cluster: &str) -> SourceResult<BTreeSet<String>> {
        self.enter(cluster, SourceOp::ListAccounts).await?;
        Ok(self
            .lock()
            .clusters
            .get(cluster)
            .map(|a| a.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_usage(&self, cluster: &str, account: &str) -> SourceResult<u64> {
        self.enter(cluster, SourceOp::GetUsage).await?;
        self.usage(cluster, account)
            .ok_or_else(|| Self::not_found(cluster, account))
    }

    async fn get_limit(&self, cluster: &str, account: &str) -> SourceResult<u64> {
        self.enter(cluster, SourceOp::GetLimit).await?;
        self.limit(cluster, account)
            .ok_or_else(|| Self::not_found(cluster, account))
    }

    async fn set_limit(&self, cluster: &str, account: &str, limit: u64) -> SourceResult<()> {
        self.enter(cluster, SourceOp::SetLimit).await?;
        let mut state = self.lock();
        let acct = state
            .clusters
            .get_mut(cluster)
            .and_then(|a| a.get_mut(account))
            .ok_or_else(|| Self::not_found(cluster, account))?;
        acct.limit = limit;
        state.set_calls.push(SetLimitCall {
            cluster: cluster.to_string(),
            account: account.to_string(),
            limit,
        });
        Ok(())
    }
}

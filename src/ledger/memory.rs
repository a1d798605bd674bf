//! In-memory ledger with snapshot isolation.
//!
//! `begin` clones the live state. Reads and writes go to the clone; `commit`
//! re-checks every staged close against the live state and applies all of
//! them or none.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{
    AccountTotals, AllocationSet, Ledger, LedgerError, LedgerResult, LedgerTransaction,
    StorageResultExt,
};
use crate::types::{
    Allocation, AllocationId, AllocationRequest, Cluster, ClusterId, RequestId, Team, TeamId,
};

/// Serialized ledger contents, used to seed and dump a [`MemoryLedger`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerFixture {
    #[serde(default)]
    pub clusters: Vec<Cluster>,
    #[serde(default)]
    pub teams: Vec<Team>,
    #[serde(default)]
    pub requests: Vec<AllocationRequest>,
    #[serde(default)]
    pub allocations: Vec<Allocation>,
}

#[derive(Clone, Debug, Default)]
struct LedgerState {
    clusters: BTreeMap<ClusterId, Cluster>,
    teams: BTreeMap<TeamId, Team>,
    requests: BTreeMap<RequestId, AllocationRequest>,
    allocations: BTreeMap<AllocationId, Allocation>,
}

impl LedgerState {
    fn team_by_name(&self, name: &str) -> Option<&Team> {
        self.teams.values().find(|t| t.name == name)
    }

    fn allocation_set(&self, team: TeamId, cluster: ClusterId, today: NaiveDate) -> AllocationSet {
        let entries = self.allocations.values().filter_map(|a| {
            let request = self.requests.get(&a.request)?;
            (a.cluster == cluster && request.team == team).then_some((a, request))
        });
        AllocationSet::partition(entries, today)
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryLedger {
    state: Arc<RwLock<LedgerState>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture(fixture: LedgerFixture) -> Self {
        let state = LedgerState {
            clusters: fixture.clusters.into_iter().map(|c| (c.id, c)).collect(),
            teams: fixture.teams.into_iter().map(|t| (t.id, t)).collect(),
            requests: fixture.requests.into_iter().map(|r| (r.id, r)).collect(),
            allocations: fixture.allocations.into_iter().map(|a| (a.id, a)).collect(),
        };
        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn from_fixture_file(path: impl AsRef<Path>) -> LedgerResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .storage_err_ctx(&format!("reading {}", path.display()))?;
        let fixture: LedgerFixture = serde_json::from_str(&content)?;
        tracing::debug!(
            path = %path.display(),
            clusters = fixture.clusters.len(),
            allocations = fixture.allocations.len(),
            "Loaded ledger fixture"
        );
        Ok(Self::from_fixture(fixture))
    }

    pub async fn to_fixture(&self) -> LedgerFixture {
        let state = self.state.read().await;
        LedgerFixture {
            clusters: state.clusters.values().cloned().collect(),
            teams: state.teams.values().cloned().collect(),
            requests: state.requests.values().cloned().collect(),
            allocations: state.allocations.values().cloned().collect(),
        }
    }

    /// Persist the current contents, so closed allocations survive a restart.
    pub async fn write_fixture_file(&self, path: impl AsRef<Path>) -> LedgerResult<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(&self.to_fixture().await)?;
        tokio::fs::write(path, json)
            .await
            .storage_err_ctx(&format!("writing {}", path.display()))
    }

    pub async fn insert_cluster(&self, cluster: Cluster) {
        self.state.write().await.clusters.insert(cluster.id, cluster);
    }

    pub async fn insert_team(&self, team: Team) {
        self.state.write().await.teams.insert(team.id, team);
    }

    pub async fn insert_request(&self, request: AllocationRequest) {
        self.state.write().await.requests.insert(request.id, request);
    }

    pub async fn insert_allocation(&self, allocation: Allocation) {
        self.state
            .write()
            .await
            .allocations
            .insert(allocation.id, allocation);
    }

    pub async fn set_cluster_enabled(&self, name: &str, enabled: bool) -> LedgerResult<()> {
        let mut state = self.state.write().await;
        let cluster = state
            .clusters
            .values_mut()
            .find(|c| c.name == name)
            .ok_or_else(|| LedgerError::NotFound {
                entity: "cluster",
                key: name.to_string(),
            })?;
        cluster.enabled = enabled;
        Ok(())
    }

    pub async fn allocation(&self, id: AllocationId) -> Option<Allocation> {
        self.state.read().await.allocations.get(&id).cloned()
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    fn name(&self) -> &str {
        "memory"
    }

    async fn enabled_clusters(&self) -> LedgerResult<Vec<Cluster>> {
        let state = self.state.read().await;
        Ok(state.clusters.values().filter(|c| c.enabled).cloned().collect())
    }

    async fn cluster_by_name(&self, name: &str) -> LedgerResult<Option<Cluster>> {
        let state = self.state.read().await;
        Ok(state.clusters.values().find(|c| c.name == name).cloned())
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>> {
        let snapshot = self.state.read().await.clone();
        Ok(Box::new(MemoryTransaction {
            live: Arc::clone(&self.state),
            snapshot,
            staged: Vec::new(),
        }))
    }
}

struct MemoryTransaction {
    live: Arc<RwLock<LedgerState>>,
    snapshot: LedgerState,
    staged: Vec<(AllocationId, u64)>,
}

#[async_trait::async_trait]
impl LedgerTransaction for MemoryTransaction {
    async fn find_team(&mut self, name: &str) -> LedgerResult<Option<Team>> {
        Ok(self.snapshot.team_by_name(name).cloned())
    }

    async fn allocations(
        &mut self,
        team: TeamId,
        cluster: ClusterId,
        today: NaiveDate,
    ) -> LedgerResult<AllocationSet> {
        Ok(self.snapshot.allocation_set(team, cluster, today))
    }

    async fn close_allocation(&mut self, id: AllocationId, final_usage: u64) -> LedgerResult<()> {
        let allocation =
            self.snapshot
                .allocations
                .get_mut(&id)
                .ok_or_else(|| LedgerError::NotFound {
                    entity: "allocation",
                    key: id.to_string(),
                })?;
        if allocation.final_usage.is_some() {
            return Err(LedgerError::AlreadyClosed { allocation: id });
        }
        allocation.final_usage = Some(final_usage);
        self.staged.push((id, final_usage));
        Ok(())
    }

    async fn account_totals(
        &mut self,
        team: TeamId,
        cluster: ClusterId,
        today: NaiveDate,
    ) -> LedgerResult<AccountTotals> {
        Ok(AccountTotals::from(
            &self.snapshot.allocation_set(team, cluster, today),
        ))
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        let mut live = self.live.write().await;

        for (id, _) in &self.staged {
            match live.allocations.get(id) {
                Some(a) if a.final_usage.is_some() => {
                    return Err(LedgerError::AlreadyClosed { allocation: *id });
                }
                Some(_) => {}
                None => {
                    return Err(LedgerError::NotFound {
                        entity: "allocation",
                        key: id.to_string(),
                    });
                }
            }
        }

        for (id, final_usage) in &self.staged {
            if let Some(a) = live.allocations.get_mut(id) {
                a.final_usage = Some(*final_usage);
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        Ok(())
    }
}

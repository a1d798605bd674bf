//! PostgreSQL ledger backend.
//!
//! Enable with the `postgres` feature flag. Transactions run at
//! `REPEATABLE READ`; closing rows are locked with `FOR UPDATE` and the close
//! itself is guarded by `final_usage IS NULL`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use secrecy::{ExposeSecret, SecretString};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};

use super::{
    AccountTotals, AllocationSet, Ledger, LedgerAllocation, LedgerError, LedgerResult,
    LedgerTransaction,
};
use crate::resilience::ExponentialBackoff;
use crate::types::{
    Allocation, AllocationId, Cluster, ClusterId, RequestId, Team, TeamId, TeamMembership,
    TeamRole, UserId,
};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS clusters (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    description TEXT,
    enabled BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE TABLE IF NOT EXISTS teams (
    id BIGSERIAL PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    is_active BOOLEAN NOT NULL DEFAULT TRUE
);
CREATE TABLE IF NOT EXISTS team_memberships (
    id BIGSERIAL PRIMARY KEY,
    team_id BIGINT NOT NULL REFERENCES teams (id) ON DELETE CASCADE,
    user_id BIGINT NOT NULL,
    role TEXT NOT NULL,
    UNIQUE (team_id, user_id)
);
CREATE TABLE IF NOT EXISTS allocation_requests (
    id BIGSERIAL PRIMARY KEY,
    team_id BIGINT NOT NULL REFERENCES teams (id) ON DELETE CASCADE,
    title TEXT NOT NULL,
    description TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'pending',
    submitted DATE,
    approved DATE,
    active DATE,
    expire DATE
);
CREATE TABLE IF NOT EXISTS allocation_reviews (
    id BIGSERIAL PRIMARY KEY,
    request_id BIGINT NOT NULL REFERENCES allocation_requests (id) ON DELETE CASCADE,
    reviewer_id BIGINT NOT NULL,
    approve BOOLEAN NOT NULL,
    public_comments TEXT,
    private_comments TEXT
);
CREATE TABLE IF NOT EXISTS allocations (
    id BIGSERIAL PRIMARY KEY,
    request_id BIGINT NOT NULL REFERENCES allocation_requests (id) ON DELETE CASCADE,
    cluster_id BIGINT NOT NULL REFERENCES clusters (id) ON DELETE CASCADE,
    requested BIGINT NOT NULL CHECK (requested >= 0),
    awarded BIGINT CHECK (awarded >= 0),
    final_usage BIGINT CHECK (final_usage >= 0)
);
CREATE INDEX IF NOT EXISTS idx_allocations_cluster ON allocations (cluster_id);
CREATE INDEX IF NOT EXISTS idx_allocation_requests_team ON allocation_requests (team_id);
"#;

#[derive(Clone, Debug)]
pub struct PostgresLedgerConfig {
    pub max_connections: u32,
    /// Retries when opening a transaction fails transiently.
    pub begin_retries: u32,
    pub backoff: ExponentialBackoff,
}

impl Default for PostgresLedgerConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            begin_retries: 3,
            backoff: ExponentialBackoff::default(),
        }
    }
}

pub struct PostgresLedger {
    pool: Arc<PgPool>,
    config: PostgresLedgerConfig,
}

impl PostgresLedger {
    pub async fn connect(url: &SecretString, config: PostgresLedgerConfig) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(url.expose_secret())
            .await
            .map_err(|e| map_sqlx(e, None))?;
        Ok(Self::with_pool(Arc::new(pool), config))
    }

    pub fn with_pool(pool: Arc<PgPool>, config: PostgresLedgerConfig) -> Self {
        Self { pool, config }
    }

    /// Create the tables if they are missing. Not a migration system.
    pub async fn ensure_schema(&self) -> LedgerResult<()> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx(e, None))?;
        Ok(())
    }

    async fn try_begin(&self) -> LedgerResult<Transaction<'static, Postgres>> {
        let mut txn = self.pool.begin().await.map_err(|e| map_sqlx(e, None))?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .execute(&mut *txn)
            .await
            .map_err(|e| map_sqlx(e, None))?;
        Ok(txn)
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn enabled_clusters(&self) -> LedgerResult<Vec<Cluster>> {
        let rows = sqlx::query(
            "SELECT id, name, description, enabled FROM clusters WHERE enabled ORDER BY id",
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx(e, None))?;
        rows.iter().map(cluster_from_row).collect()
    }

    async fn cluster_by_name(&self, name: &str) -> LedgerResult<Option<Cluster>> {
        let row = sqlx::query("SELECT id, name, description, enabled FROM clusters WHERE name = $1")
            .bind(name)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx(e, None))?;
        row.as_ref().map(cluster_from_row).transpose()
    }

    async fn begin(&self) -> LedgerResult<Box<dyn LedgerTransaction>> {
        let mut retries = 0;
        loop {
            match self.try_begin().await {
                Ok(txn) => return Ok(Box::new(PostgresTransaction { txn })),
                Err(e) if e.is_transient() && retries < self.config.begin_retries => {
                    retries += 1;
                    let delay = self.config.backoff.delay_for(retries);
                    tracing::warn!(
                        retry = retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying ledger transaction after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

struct PostgresTransaction {
    txn: Transaction<'static, Postgres>,
}

#[async_trait]
impl LedgerTransaction for PostgresTransaction {
    async fn find_team(&mut self, name: &str) -> LedgerResult<Option<Team>> {
        let Some(row) = sqlx::query("SELECT id, name, is_active FROM teams WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(|e| map_sqlx(e, None))?
        else {
            return Ok(None);
        };

        let id: i64 = row.try_get("id").map_err(|e| map_sqlx(e, None))?;
        let name: String = row.try_get("name").map_err(|e| map_sqlx(e, None))?;
        let mut team = Team::new(id, name);
        team.is_active = row.try_get("is_active").map_err(|e| map_sqlx(e, None))?;

        let members = sqlx::query(
            "SELECT user_id, role FROM team_memberships WHERE team_id = $1 ORDER BY user_id",
        )
        .bind(id)
        .fetch_all(&mut *self.txn)
        .await
        .map_err(|e| map_sqlx(e, None))?;

        for member in &members {
            let user: i64 = member.try_get("user_id").map_err(|e| map_sqlx(e, None))?;
            let role: String = member.try_get("role").map_err(|e| map_sqlx(e, None))?;
            team.members.push(TeamMembership {
                user: UserId(user),
                role: parse_role(&role)?,
            });
        }
        Ok(Some(team))
    }

    async fn allocations(
        &mut self,
        team: TeamId,
        cluster: ClusterId,
        today: NaiveDate,
    ) -> LedgerResult<AllocationSet> {
        // Lock every row this unit may close so a concurrent pass blocks here.
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.request_id, a.cluster_id, a.requested, a.awarded, a.final_usage,
                   r.active, r.expire
            FROM allocations a
            JOIN allocation_requests r ON r.id = a.request_id
            WHERE r.team_id = $1
              AND a.cluster_id = $2
              AND r.status = 'approved'
              AND r.active IS NOT NULL
              AND r.expire IS NOT NULL
              AND r.active <= $3
            ORDER BY r.expire, a.id
            FOR UPDATE OF a
            "#,
        )
        .bind(team.get())
        .bind(cluster.get())
        .bind(today)
        .fetch_all(&mut *self.txn)
        .await
        .map_err(|e| map_sqlx(e, None))?;

        let entries = rows
            .iter()
            .map(ledger_allocation_from_row)
            .collect::<LedgerResult<Vec<_>>>()?;
        Ok(AllocationSet::from_entries(entries, today))
    }

    async fn close_allocation(&mut self, id: AllocationId, final_usage: u64) -> LedgerResult<()> {
        let value = to_i64(final_usage)?;
        let result = sqlx::query(
            "UPDATE allocations SET final_usage = $2 WHERE id = $1 AND final_usage IS NULL",
        )
        .bind(id.get())
        .bind(value)
        .execute(&mut *self.txn)
        .await
        .map_err(|e| map_sqlx(e, Some(id)))?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM allocations WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *self.txn)
            .await
            .map_err(|e| map_sqlx(e, Some(id)))?
            .is_some();
        if exists {
            Err(LedgerError::AlreadyClosed { allocation: id })
        } else {
            Err(LedgerError::NotFound {
                entity: "allocation",
                key: id.to_string(),
            })
        }
    }

    async fn account_totals(
        &mut self,
        team: TeamId,
        cluster: ClusterId,
        today: NaiveDate,
    ) -> LedgerResult<AccountTotals> {
        let row = sqlx::query(
            r#"
            SELECT
                COALESCE(SUM(a.awarded) FILTER (
                    WHERE a.final_usage IS NULL AND r.active <= $3 AND $3 < r.expire
                ), 0)::BIGINT AS active_awarded,
                COALESCE(SUM(a.final_usage) FILTER (
                    WHERE a.final_usage IS NOT NULL AND r.expire <= $3
                ), 0)::BIGINT AS historical_usage
            FROM allocations a
            JOIN allocation_requests r ON r.id = a.request_id
            WHERE r.team_id = $1
              AND a.cluster_id = $2
              AND r.status = 'approved'
              AND r.active IS NOT NULL
              AND r.expire IS NOT NULL
            "#,
        )
        .bind(team.get())
        .bind(cluster.get())
        .bind(today)
        .fetch_one(&mut *self.txn)
        .await
        .map_err(|e| map_sqlx(e, None))?;

        let active_awarded: i64 = row
            .try_get("active_awarded")
            .map_err(|e| map_sqlx(e, None))?;
        let historical_usage: i64 = row
            .try_get("historical_usage")
            .map_err(|e| map_sqlx(e, None))?;
        Ok(AccountTotals {
            active_awarded: to_u64(active_awarded)?,
            historical_usage: to_u64(historical_usage)?,
        })
    }

    async fn commit(self: Box<Self>) -> LedgerResult<()> {
        self.txn.commit().await.map_err(|e| map_sqlx(e, None))
    }

    async fn rollback(self: Box<Self>) -> LedgerResult<()> {
        self.txn.rollback().await.map_err(|e| map_sqlx(e, None))
    }
}

fn cluster_from_row(row: &PgRow) -> LedgerResult<Cluster> {
    let id: i64 = row.try_get("id").map_err(|e| map_sqlx(e, None))?;
    let name: String = row.try_get("name").map_err(|e| map_sqlx(e, None))?;
    let mut cluster = Cluster::new(id, name);
    cluster.description = row.try_get("description").map_err(|e| map_sqlx(e, None))?;
    cluster.enabled = row.try_get("enabled").map_err(|e| map_sqlx(e, None))?;
    Ok(cluster)
}

fn ledger_allocation_from_row(row: &PgRow) -> LedgerResult<LedgerAllocation> {
    let get_i64 = |column: &str| -> LedgerResult<i64> {
        row.try_get(column).map_err(|e| map_sqlx(e, None))
    };
    let get_opt = |column: &str| -> LedgerResult<Option<u64>> {
        let value: Option<i64> = row.try_get(column).map_err(|e| map_sqlx(e, None))?;
        value.map(to_u64).transpose()
    };

    let allocation = Allocation {
        id: AllocationId(get_i64("id")?),
        request: RequestId(get_i64("request_id")?),
        cluster: ClusterId(get_i64("cluster_id")?),
        requested: to_u64(get_i64("requested")?)?,
        awarded: get_opt("awarded")?,
        final_usage: get_opt("final_usage")?,
    };
    Ok(LedgerAllocation {
        allocation,
        active: row.try_get("active").map_err(|e| map_sqlx(e, None))?,
        expire: row.try_get("expire").map_err(|e| map_sqlx(e, None))?,
    })
}

fn parse_role(role: &str) -> LedgerResult<TeamRole> {
    match role {
        "owner" => Ok(TeamRole::Owner),
        "admin" => Ok(TeamRole::Admin),
        "member" => Ok(TeamRole::Member),
        other => Err(LedgerError::Storage {
            message: format!("unknown team role '{}'", other),
        }),
    }
}

fn to_u64(value: i64) -> LedgerResult<u64> {
    u64::try_from(value).map_err(|_| LedgerError::Storage {
        message: format!("negative service-unit quantity {}", value),
    })
}

fn to_i64(value: u64) -> LedgerResult<i64> {
    i64::try_from(value).map_err(|_| LedgerError::Storage {
        message: format!("service-unit quantity {} exceeds BIGINT", value),
    })
}

/// Serialization failures and deadlocks while closing `allocation` mean a
/// concurrent pass won the row.
fn map_sqlx(error: sqlx::Error, allocation: Option<AllocationId>) -> LedgerError {
    if let sqlx::Error::Database(ref db) = error {
        let conflict = matches!(db.code().as_deref(), Some("40001") | Some("40P01"));
        if conflict {
            return match allocation {
                Some(allocation) => LedgerError::AlreadyClosed { allocation },
                None => LedgerError::Unavailable {
                    message: db.message().to_string(),
                },
            };
        }
    }

    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => LedgerError::Unavailable {
            message: error.to_string(),
        },
        other => LedgerError::Storage {
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_role() {
        assert_eq!(parse_role("owner").unwrap(), TeamRole::Owner);
        assert_eq!(parse_role("member").unwrap(), TeamRole::Member);
        assert!(parse_role("visitor").is_err());
    }

    #[test]
    fn test_quantity_conversion() {
        assert_eq!(to_u64(5).unwrap(), 5);
        assert!(to_u64(-1).is_err());
        assert!(to_i64(u64::MAX).is_err());
    }

    #[test]
    fn test_pool_errors_are_transient() {
        assert!(map_sqlx(sqlx::Error::PoolTimedOut, None).is_transient());
        assert!(!map_sqlx(sqlx::Error::RowNotFound, None).is_transient());
    }
}

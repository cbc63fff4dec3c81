use crate::error::Result;
use crate::models::{ExecutionStatus, ServerClaim};
use crate::repository::DbPool;
use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite};

/// Conflict index: which execution currently holds each server.
///
/// A claim held by an execution that has reached a terminal status is stale
/// and may be taken over. A claim whose execution record does not exist yet
/// belongs to a start that is still in flight and is honoured.
#[derive(Clone)]
pub struct ClaimRepository {
    pool: DbPool,
}

impl ClaimRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Live claims on any of `server_ids` held by executions other than
    /// `execution_id`.
    pub async fn find_conflicts(
        &self,
        execution_id: &str,
        server_ids: &[String],
    ) -> Result<Vec<ServerClaim>> {
        if server_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT c.server_id, c.execution_id, c.claimed_at
            FROM server_claims c
            LEFT JOIN executions e ON e.id = c.execution_id
            WHERE c.execution_id != "#,
        );
        query.push_bind(execution_id);
        query.push(" AND (e.id IS NULL OR e.status NOT IN (");
        let mut terminal = query.separated(", ");
        for status in ExecutionStatus::TERMINAL {
            terminal.push_bind(status as i32);
        }
        query.push(")) AND c.server_id IN (");
        let mut servers = query.separated(", ");
        for server_id in server_ids {
            servers.push_bind(server_id.clone());
        }
        query.push(") ORDER BY c.server_id");

        let claims = query
            .build_query_as::<ServerClaim>()
            .fetch_all(&self.pool)
            .await?;

        Ok(claims)
    }

    /// Claims every server for `execution_id` or none of them. Each server is
    /// a conditional upsert that only succeeds when the server is free, stale,
    /// or already ours. Returns the claims that blocked the request; an empty
    /// vector means the claim went through.
    pub async fn claim(&self, execution_id: &str, server_ids: &[String]) -> Result<Vec<ServerClaim>> {
        let now = Utc::now().timestamp_millis();
        let terminal = ExecutionStatus::TERMINAL
            .iter()
            .map(|s| (*s as i32).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            r#"
            INSERT INTO server_claims (server_id, execution_id, claimed_at)
            VALUES (?, ?, ?)
            ON CONFLICT(server_id) DO UPDATE SET
                execution_id = excluded.execution_id, claimed_at = excluded.claimed_at
            WHERE server_claims.execution_id = excluded.execution_id
               OR server_claims.execution_id IN (SELECT id FROM executions WHERE status IN ({}))
            "#,
            terminal
        );

        let mut tx = self.pool.begin().await?;
        let mut lost = Vec::new();
        for server_id in server_ids {
            let result = sqlx::query(&sql)
                .bind(server_id)
                .bind(execution_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                lost.push(server_id.clone());
            }
        }

        if lost.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        tx.rollback().await?;
        self.find_conflicts(execution_id, &lost).await
    }

    pub async fn release_servers(&self, execution_id: &str, server_ids: &[String]) -> Result<()> {
        for server_id in server_ids {
            sqlx::query("DELETE FROM server_claims WHERE execution_id = ? AND server_id = ?")
                .bind(execution_id)
                .bind(server_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    pub async fn release_execution(&self, execution_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM server_claims WHERE execution_id = ?")
            .bind(execution_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn claims_for(&self, execution_id: &str) -> Result<Vec<ServerClaim>> {
        let claims = sqlx::query_as::<_, ServerClaim>(
            "SELECT server_id, execution_id, claimed_at FROM server_claims WHERE execution_id = ? ORDER BY server_id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(claims)
    }
}

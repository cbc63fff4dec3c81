use crate::error::{AppError, Result};
use crate::models::{
    Execution, ExecutionMode, ExecutionStatus, HistoryEntry, HistoryRecord, WaveExecution,
};
use crate::repository::DbPool;
use chrono::Utc;
use sqlx::{Sqlite, Transaction};

#[derive(Debug, sqlx::FromRow)]
struct ExecutionRow {
    id: String,
    recovery_plan_id: String,
    mode: ExecutionMode,
    status: ExecutionStatus,
    current_wave_index: i64,
    waves: String,
    resume_handle: Option<String>,
    resume_handle_expires_at: Option<i64>,
    invocation_source: String,
    version: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = AppError;

    fn try_from(row: ExecutionRow) -> Result<Self> {
        let waves: Vec<WaveExecution> = serde_json::from_str(&row.waves)?;
        Ok(Execution {
            id: row.id,
            recovery_plan_id: row.recovery_plan_id,
            mode: row.mode,
            status: row.status,
            current_wave_index: row.current_wave_index as u32,
            waves,
            resume_handle: row.resume_handle,
            resume_handle_expires_at: row.resume_handle_expires_at,
            invocation_source: row.invocation_source,
            version: row.version,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn status_list(statuses: &[ExecutionStatus]) -> String {
    statuses
        .iter()
        .map(|s| (*s as i32).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Clone)]
pub struct ExecutionRepository {
    pool: DbPool,
}

impl ExecutionRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, execution: &Execution, history: &[HistoryEntry]) -> Result<()> {
        let waves = serde_json::to_string(&execution.waves)?;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO executions (
                id, recovery_plan_id, mode, status, current_wave_index, waves,
                resume_handle, resume_handle_expires_at, invocation_source, version,
                created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, NULL, NULL, ?, ?, ?, ?)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.recovery_plan_id)
        .bind(execution.mode as i32)
        .bind(execution.status as i32)
        .bind(execution.current_wave_index as i64)
        .bind(waves)
        .bind(&execution.invocation_source)
        .bind(execution.version)
        .bind(execution.created_at)
        .bind(execution.updated_at)
        .execute(&mut *tx)
        .await?;

        Self::append_history(&mut tx, &execution.id, history).await?;
        tx.commit().await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Execution> {
        let row = sqlx::query_as::<_, ExecutionRow>("SELECT * FROM executions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| AppError::ExecutionNotFound(id.to_string()))?;

        Execution::try_from(row)
    }

    pub async fn list(&self, status: Option<ExecutionStatus>) -> Result<Vec<Execution>> {
        let rows = match status {
            Some(status) => {
                sqlx::query_as::<_, ExecutionRow>(
                    "SELECT * FROM executions WHERE status = ? ORDER BY created_at DESC",
                )
                .bind(status as i32)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, ExecutionRow>(
                    "SELECT * FROM executions ORDER BY created_at DESC",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(Execution::try_from).collect()
    }

    /// Ids of executions in any of `statuses`, oldest first. Served by the
    /// status index.
    pub async fn list_ids_by_status(&self, statuses: &[ExecutionStatus]) -> Result<Vec<String>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id FROM executions WHERE status IN ({}) ORDER BY created_at ASC",
            status_list(statuses)
        );
        let ids = sqlx::query_scalar::<_, String>(&sql)
            .fetch_all(&self.pool)
            .await?;

        Ok(ids)
    }

    /// Writes `execution` back if nobody else has since, and only while the
    /// stored record is still non-terminal. Bumps `execution.version` on
    /// success.
    pub async fn save(&self, execution: &mut Execution, history: &[HistoryEntry]) -> Result<()> {
        let waves = serde_json::to_string(&execution.waves)?;
        let updated_at = Utc::now().timestamp_millis();
        let sql = format!(
            r#"
            UPDATE executions
            SET status = ?, current_wave_index = ?, waves = ?, resume_handle = ?,
                resume_handle_expires_at = ?, version = version + 1, updated_at = ?
            WHERE id = ? AND version = ? AND status NOT IN ({})
            "#,
            status_list(&ExecutionStatus::TERMINAL)
        );

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(&sql)
            .bind(execution.status as i32)
            .bind(execution.current_wave_index as i64)
            .bind(waves)
            .bind(&execution.resume_handle)
            .bind(execution.resume_handle_expires_at)
            .bind(updated_at)
            .bind(&execution.id)
            .bind(execution.version)
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            let exists: Option<String> = sqlx::query_scalar("SELECT id FROM executions WHERE id = ?")
                .bind(&execution.id)
                .fetch_optional(&self.pool)
                .await?;
            return Err(match exists {
                Some(_) => AppError::ConcurrentModification(execution.id.clone()),
                None => AppError::ExecutionNotFound(execution.id.clone()),
            });
        }

        Self::append_history(&mut tx, &execution.id, history).await?;
        tx.commit().await?;

        execution.version += 1;
        execution.updated_at = updated_at;
        Ok(())
    }

    pub async fn history(&self, execution_id: &str) -> Result<Vec<HistoryRecord>> {
        let records = sqlx::query_as::<_, HistoryRecord>(
            "SELECT * FROM execution_history WHERE execution_id = ? ORDER BY id ASC",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn append_history(
        tx: &mut Transaction<'_, Sqlite>,
        execution_id: &str,
        history: &[HistoryEntry],
    ) -> Result<()> {
        for entry in history {
            sqlx::query(
                r#"
                INSERT INTO execution_history (execution_id, wave_number, server_id, kind, message, created_at)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(execution_id)
            .bind(entry.wave_number.map(i64::from))
            .bind(&entry.server_id)
            .bind(entry.kind.as_str())
            .bind(&entry.message)
            .bind(entry.created_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HistoryKind, PlanWave, ProtectionGroup, RecoveryPlan};
    use crate::repository::establish_connection;

    async fn repo() -> (ExecutionRepository, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("exec.db").display());
        let pool = establish_connection(&url).await.unwrap();
        (ExecutionRepository::new(pool), dir)
    }

    fn execution(id: &str) -> Execution {
        let plan = RecoveryPlan {
            id: "plan".to_string(),
            name: "plan".to_string(),
            waves: vec![PlanWave {
                wave_number: 0,
                name: "db".to_string(),
                pause_before_wave: false,
                depends_on: vec![],
                protection_groups: vec![ProtectionGroup {
                    id: "pg".to_string(),
                    server_ids: vec!["s-1".to_string()],
                }],
            }],
        };
        Execution::new(id.to_string(), &plan, ExecutionMode::Drill, "test")
    }

    #[tokio::test]
    async fn test_create_and_get_round_trip_waves() {
        let (repo, _dir) = repo().await;
        let exec = execution("e-1");
        repo.create(&exec, &[HistoryEntry::new(HistoryKind::Created, "created")])
            .await
            .unwrap();

        let loaded = repo.get("e-1").await.unwrap();
        assert_eq!(loaded.status, ExecutionStatus::Pending);
        assert_eq!(loaded.waves, exec.waves);
        assert_eq!(repo.history("e-1").await.unwrap().len(), 1);
        assert!(matches!(
            repo.get("missing").await,
            Err(AppError::ExecutionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let (repo, _dir) = repo().await;
        repo.create(&execution("e-1"), &[]).await.unwrap();

        let mut first = repo.get("e-1").await.unwrap();
        let mut second = repo.get("e-1").await.unwrap();

        first.status = ExecutionStatus::Cancelled;
        repo.save(&mut first, &[]).await.unwrap();
        assert_eq!(first.version, 1);

        second.status = ExecutionStatus::Launching;
        let err = repo
            .save(&mut second, &[HistoryEntry::new(HistoryKind::WaveLaunching, "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ConcurrentModification(_)));
        assert!(repo.history("e-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_record_is_immutable() {
        let (repo, _dir) = repo().await;
        repo.create(&execution("e-1"), &[]).await.unwrap();

        let mut exec = repo.get("e-1").await.unwrap();
        exec.status = ExecutionStatus::Failed;
        repo.save(&mut exec, &[]).await.unwrap();

        exec.status = ExecutionStatus::Launching;
        assert!(repo.save(&mut exec, &[]).await.is_err());
        assert_eq!(repo.get("e-1").await.unwrap().status, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn test_list_ids_by_status() {
        let (repo, _dir) = repo().await;
        repo.create(&execution("e-1"), &[]).await.unwrap();
        repo.create(&execution("e-2"), &[]).await.unwrap();

        let mut exec = repo.get("e-2").await.unwrap();
        exec.status = ExecutionStatus::Polling;
        repo.save(&mut exec, &[]).await.unwrap();

        let polling = repo
            .list_ids_by_status(&[ExecutionStatus::Polling])
            .await
            .unwrap();
        assert_eq!(polling, vec!["e-2".to_string()]);
        assert_eq!(
            repo.list(Some(ExecutionStatus::Pending)).await.unwrap().len(),
            1
        );
    }
}

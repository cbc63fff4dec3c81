use crate::error::{AppError, Result};
use crate::models::{PlanWave, RecoveryPlan};
use crate::repository::DbPool;
use chrono::Utc;

#[derive(Debug, sqlx::FromRow)]
struct PlanRow {
    id: String,
    name: String,
    waves: String,
}

/// Read side of the recovery-plan catalogue. Plans are authored elsewhere and
/// imported here as-is.
#[derive(Clone)]
pub struct PlanRepository {
    pool: DbPool,
}

impl PlanRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> Result<RecoveryPlan> {
        let row = sqlx::query_as::<_, PlanRow>(
            "SELECT id, name, waves FROM recovery_plans WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::PlanNotFound(id.to_string()))?;

        let waves: Vec<PlanWave> = serde_json::from_str(&row.waves)?;
        Ok(RecoveryPlan {
            id: row.id,
            name: row.name,
            waves,
        })
    }

    pub async fn upsert(&self, plan: &RecoveryPlan) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO recovery_plans (id, name, waves, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, waves = excluded.waves, updated_at = excluded.updated_at
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.name)
        .bind(serde_json::to_string(&plan.waves)?)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Imports every plan from a JSON array file. Returns how many were
    /// written.
    pub async fn import_file(&self, path: &std::path::Path) -> Result<usize> {
        let content = tokio::fs::read_to_string(path).await?;
        let plans: Vec<RecoveryPlan> = serde_json::from_str(&content)?;
        for plan in &plans {
            self.upsert(plan).await?;
        }
        Ok(plans.len())
    }
}

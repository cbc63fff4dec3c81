use crate::repository::DbPool;
use anyhow::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

pub async fn establish_connection(database_url: &str) -> Result<DbPool> {
    // Ensure the database URL has the correct format
    let db_url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{}", database_url)
    };

    let options = SqliteConnectOptions::from_str(&db_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    // Run migrations
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS recovery_plans (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            waves TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS executions (
            id TEXT PRIMARY KEY,
            recovery_plan_id TEXT NOT NULL,
            mode INTEGER NOT NULL,
            status INTEGER NOT NULL,
            current_wave_index INTEGER NOT NULL DEFAULT 0,
            waves TEXT NOT NULL,
            resume_handle TEXT,
            resume_handle_expires_at INTEGER,
            invocation_source TEXT NOT NULL,
            version INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS server_claims (
            server_id TEXT PRIMARY KEY,
            execution_id TEXT NOT NULL,
            claimed_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS execution_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            execution_id TEXT NOT NULL,
            wave_number INTEGER,
            server_id TEXT,
            kind TEXT NOT NULL,
            message TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (execution_id) REFERENCES executions(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
        CREATE INDEX IF NOT EXISTS idx_executions_plan_id ON executions(recovery_plan_id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_resume_handle
            ON executions(resume_handle) WHERE resume_handle IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_server_claims_execution_id ON server_claims(execution_id);
        CREATE INDEX IF NOT EXISTS idx_execution_history_execution_id
            ON execution_history(execution_id);
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

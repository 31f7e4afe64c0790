//! Sync run audit rows: one row per orchestrated run, updated as the run
//! progresses so an operator can watch a long initial sync move.

use chrono::{DateTime, Utc};
use sqlx::FromRow;

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    /// Budget expired before all folders finished; state is consistent and
    /// the next run resumes from the watermarks.
    Partial,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncRunRecord {
    pub id: i64,
    pub account_id: i64,
    pub mode: String,
    pub status: String,
    pub processed: i64,
    pub new_messages: i64,
    pub total_expected: i64,
    pub current_folder: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}

impl Store {
    pub async fn start_run(&self, account_id: i64, mode: &str) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO sync_runs (account_id, mode) VALUES (?, ?) RETURNING id",
        )
        .bind(account_id)
        .bind(mode)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn update_run_progress(
        &self,
        run_id: i64,
        processed: i64,
        new_messages: i64,
        total_expected: i64,
        current_folder: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE sync_runs SET processed = ?, new_messages = ?,
                 total_expected = ?, current_folder = ?
             WHERE id = ?",
        )
        .bind(processed)
        .bind(new_messages)
        .bind(total_expected)
        .bind(current_folder)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn finish_run(
        &self,
        run_id: i64,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE sync_runs SET status = ?, error = ?,
                 finished_at = CURRENT_TIMESTAMP,
                 duration_ms = (strftime('%s', 'now') - strftime('%s', started_at)) * 1000,
                 current_folder = NULL
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn latest_run(
        &self,
        account_id: i64,
    ) -> Result<Option<SyncRunRecord>, sqlx::Error> {
        sqlx::query_as::<_, SyncRunRecord>(
            "SELECT id, account_id, mode, status, processed, new_messages,
                    total_expected, current_folder, started_at, finished_at,
                    duration_ms, error
             FROM sync_runs WHERE account_id = ?
             ORDER BY started_at DESC, id DESC LIMIT 1",
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await
    }
}

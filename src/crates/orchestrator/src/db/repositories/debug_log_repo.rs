//! Debug log repository for the append-only checkpoint/payload log

use crate::db::connection::DatabasePool;
use crate::db::models::DebugLogRow;
use chrono::Utc;

/// Repository over `pipeline_debug_logs`
pub struct DebugLogRepository;

impl DebugLogRepository {
    /// Append an entry
    pub async fn insert(
        pool: &DatabasePool,
        job_id: &str,
        step_name: &str,
        direction: &str,
        payload: &str,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO pipeline_debug_logs (job_id, step_name, direction, payload, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job_id)
        .bind(step_name)
        .bind(direction)
        .bind(payload)
        .bind(&now)
        .execute(pool)
        .await?;
        Ok(())
    }

    /// Latest entry for a job + step + direction
    pub async fn latest(
        pool: &DatabasePool,
        job_id: &str,
        step_name: &str,
        direction: &str,
    ) -> Result<Option<DebugLogRow>, sqlx::Error> {
        sqlx::query_as::<_, DebugLogRow>(
            "SELECT * FROM pipeline_debug_logs
             WHERE job_id = ? AND step_name = ? AND direction = ?
             ORDER BY id DESC LIMIT 1",
        )
        .bind(job_id)
        .bind(step_name)
        .bind(direction)
        .fetch_optional(pool)
        .await
    }

    /// All entries for a job in insertion order
    pub async fn list_by_job(
        pool: &DatabasePool,
        job_id: &str,
        direction: &str,
    ) -> Result<Vec<DebugLogRow>, sqlx::Error> {
        sqlx::query_as::<_, DebugLogRow>(
            "SELECT * FROM pipeline_debug_logs
             WHERE job_id = ? AND direction = ?
             ORDER BY id ASC",
        )
        .bind(job_id)
        .bind(direction)
        .fetch_all(pool)
        .await
    }

    /// Delete every entry for a job
    pub async fn delete_by_job(pool: &DatabasePool, job_id: &str) -> Result<(), sqlx::Error> {
        sqlx::query("DELETE FROM pipeline_debug_logs WHERE job_id = ?")
            .bind(job_id)
            .execute(pool)
            .await?;
        Ok(())
    }

    /// Count entries for a job
    pub async fn count_by_job(pool: &DatabasePool, job_id: &str) -> Result<i64, sqlx::Error> {
        let result: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM pipeline_debug_logs WHERE job_id = ?")
                .bind(job_id)
                .fetch_one(pool)
                .await?;
        Ok(result.0)
    }
}

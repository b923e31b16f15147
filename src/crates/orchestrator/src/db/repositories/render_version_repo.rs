//! Render version repository
//!
//! Versions are scoped by `(project_id, phase)`, not by job: every re-render
//! gets a fresh job id, so counting by project keeps version numbers
//! monotonically increasing across re-renders.

use crate::db::connection::DatabasePool;
use chrono::Utc;

/// Repository over `render_versions`
pub struct RenderVersionRepository;

impl RenderVersionRepository {
    /// Next version number for a project + phase (1 for the first render)
    pub async fn next_version(
        pool: &DatabasePool,
        project_id: &str,
        phase: i32,
    ) -> Result<i64, sqlx::Error> {
        let result: (i64,) = sqlx::query_as(
            "SELECT COALESCE(MAX(version_number), 0) + 1
             FROM render_versions
             WHERE project_id = ? AND phase = ?",
        )
        .bind(project_id)
        .bind(phase)
        .fetch_one(pool)
        .await?;
        Ok(result.0)
    }

    /// Record a version as allocated
    pub async fn record(
        pool: &DatabasePool,
        project_id: &str,
        job_id: &str,
        phase: i32,
        version_number: i64,
    ) -> Result<(), sqlx::Error> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO render_versions (project_id, job_id, phase, version_number, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(job_id)
        .bind(phase)
        .bind(version_number)
        .bind(&now)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::DatabaseConnection;

    #[tokio::test]
    async fn test_versions_increase_per_project_and_phase() {
        let conn = DatabaseConnection::with_max_connections("sqlite::memory:", 1)
            .await
            .unwrap();
        conn.run_migrations().await.unwrap();
        let pool = conn.pool();

        assert_eq!(
            RenderVersionRepository::next_version(pool, "proj-1", 2).await.unwrap(),
            1
        );
        RenderVersionRepository::record(pool, "proj-1", "job-a", 2, 1)
            .await
            .unwrap();
        RenderVersionRepository::record(pool, "proj-1", "job-b", 2, 2)
            .await
            .unwrap();

        // Scoped by project+phase, not job: a new job id keeps counting up
        assert_eq!(
            RenderVersionRepository::next_version(pool, "proj-1", 2).await.unwrap(),
            3
        );
        // Other phase and other project are independent
        assert_eq!(
            RenderVersionRepository::next_version(pool, "proj-1", 1).await.unwrap(),
            1
        );
        assert_eq!(
            RenderVersionRepository::next_version(pool, "proj-2", 2).await.unwrap(),
            1
        );
    }
}

//! Database connection management
//!
//! Provides connection pooling, embedded migrations and a health check.

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::sync::Arc;

/// Type alias for the database connection pool
pub type DatabasePool = SqlitePool;

/// Database connection wrapper
#[derive(Clone)]
pub struct DatabaseConnection {
    pool: Arc<DatabasePool>,
}

impl DatabaseConnection {
    /// Create a new connection pool from a connection string
    /// (e.g. "sqlite:orchestrator.db" or "sqlite::memory:").
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        Self::with_max_connections(database_url, 5).await
    }

    /// Create a new connection pool with a custom size.
    ///
    /// In-memory SQLite databases are per-connection; tests that use
    /// `sqlite::memory:` should pass `max_connections = 1`.
    pub async fn with_max_connections(
        database_url: &str,
        max_connections: u32,
    ) -> Result<Self, sqlx::Error> {
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Run embedded migrations
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(self.pool.as_ref()).await
    }

    /// Verify the database answers a trivial query
    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT 1").fetch_one(self.pool.as_ref()).await?;
        Ok(())
    }

    /// Close the pool gracefully
    pub async fn close(self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_connection_and_health_check() {
        let conn = DatabaseConnection::with_max_connections("sqlite::memory:", 1)
            .await
            .unwrap();
        assert!(conn.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_migrations_apply_cleanly() {
        let conn = DatabaseConnection::with_max_connections("sqlite::memory:", 1)
            .await
            .unwrap();
        conn.run_migrations().await.unwrap();

        // Re-running is a no-op
        conn.run_migrations().await.unwrap();

        sqlx::query("SELECT job_id FROM video_jobs LIMIT 1")
            .fetch_optional(conn.pool())
            .await
            .unwrap();
    }
}

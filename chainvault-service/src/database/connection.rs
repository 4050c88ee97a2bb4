//! Database connection management with SQLx

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use tracing::info;

use crate::config::DatabaseConfig;
use crate::error::{Result, ServiceError};

/// SQLite connection pool with the schema migrated
#[derive(Clone, Debug)]
pub struct DatabasePool {
    pool: Pool<Sqlite>,
}

impl DatabasePool {
    /// Open the pool and run pending migrations.
    ///
    /// An in-memory database lives only as long as its connection, so it is
    /// pinned to a single connection that is never recycled.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if !config.url.starts_with("sqlite:") {
            return Err(ServiceError::ConfigError(format!(
                "Unsupported database URL '{}', expected sqlite:",
                config.url
            )));
        }

        let in_memory = config.url.contains(":memory:") || config.url.contains("mode=memory");
        let mut options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| ServiceError::ConfigError(format!("Invalid database URL: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(config.acquire_timeout_secs));

        // Writers queue on the busy timeout instead of failing on lock upgrades
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new().acquire_timeout(Duration::from_secs(config.acquire_timeout_secs));
        pool_options = if in_memory {
            pool_options.max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            pool_options.max_connections(config.max_connections.max(1))
        };

        info!(in_memory, max_connections = config.max_connections, "Creating SQLite connection pool");

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(|e| ServiceError::DatabaseError(format!("Failed to create SQLite pool: {}", e)))?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("SQLite connection pool created successfully");
        Ok(Self { pool })
    }

    /// Fresh in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::connect(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn inner(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Health check for the database connection
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| ServiceError::DatabaseError(format!("SQLite health check failed: {}", e)))?;
        Ok(())
    }

    pub fn get_stats(&self) -> ConnectionStats {
        ConnectionStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            is_closed: self.pool.is_closed(),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Connection pool statistics
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub size: u32,
    pub idle: usize,
    pub is_closed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_pool_is_migrated() {
        let pool = DatabasePool::in_memory().await.unwrap();
        pool.health_check().await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(pool.inner())
            .await
            .unwrap();
        let names: Vec<&str> = tables.iter().map(|(name,)| name.as_str()).collect();

        for table in ["deposit_transactions", "scan_checkpoints", "user_balances", "wallet_addresses", "wallets"] {
            assert!(names.contains(&table), "missing table {}", table);
        }
        assert!(!pool.get_stats().is_closed);
    }

    #[tokio::test]
    async fn test_rejects_other_backends() {
        let config = DatabaseConfig {
            url: "postgres://localhost/chainvault".to_string(),
            ..DatabaseConfig::default()
        };
        assert!(matches!(DatabasePool::connect(&config).await, Err(ServiceError::ConfigError(_))));
    }
}

use gnomehat_config::DatabaseConfig;
use gnomehat_domain::repositories::JobStore;
use gnomehat_errors::SchedulerResult;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::sqlite::SqliteJobStore;

/// SQLite 连接管理
///
/// 文件数据库使用 WAL 日志和 busy_timeout，允许多个 Worker 进程共享同一个文件。
/// 内存数据库只能有一个连接，否则每个连接看到的都是各自独立的空库。
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let in_memory = Self::is_memory_url(&config.url);

        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let mut pool_options = SqlitePoolOptions::new();
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options.max_connections(config.max_connections)
        };

        let pool = pool_options.connect_with(options).await?;

        let manager = Self { pool };
        manager.migrate().await?;

        info!("数据库连接成功: {}", config.url);
        Ok(manager)
    }

    fn is_memory_url(url: &str) -> bool {
        url.contains(":memory:") || url.contains("mode=memory")
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        SqliteJobStore::new(self.pool.clone()).ensure_schema().await
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn job_store(&self) -> Arc<dyn JobStore> {
        Arc::new(SqliteJobStore::new(self.pool.clone()))
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("数据库连接已关闭");
    }
}

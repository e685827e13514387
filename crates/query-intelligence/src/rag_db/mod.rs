//! RAG database module - SQLite storage for the answer cache, daily metrics,
//! chat history and knowledge documents
pub mod cache_store;
pub mod document_store;
pub mod history_store;
pub mod metrics_store;
pub mod migration;
pub mod schema;

pub use cache_store::QueryCacheStore;
pub use document_store::DocumentStore;
pub use history_store::{ChatHistoryStore, ChatParams};
pub use metrics_store::MetricsStore;
pub use migration::MigrationManager;
pub use schema::*;

use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

pub struct RagDatabase {
    pub cache: QueryCacheStore,
    pub metrics: MetricsStore,
    pub history: ChatHistoryStore,
    pub documents: DocumentStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl RagDatabase {
    pub fn new(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening RAG database at: {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                    | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                    | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            )
            .with_init(|conn| {
                conn.execute_batch(
                    "PRAGMA foreign_keys = ON;
                     PRAGMA busy_timeout = 5000;
                     PRAGMA synchronous = NORMAL;",
                )
            });
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;

        {
            let mut conn = pool.get()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }

        info!("RAG database initialized successfully");
        Ok(Self::from_pool(Arc::new(pool)))
    }

    /// Single-connection in-memory database; every store sees the same data.
    pub fn new_in_memory() -> anyhow::Result<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create connection pool: {}", e))?;
        {
            let mut conn = pool.get()?;
            MigrationManager::new(&mut conn).initialize_database()?;
        }
        Ok(Self::from_pool(Arc::new(pool)))
    }

    fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self {
            cache: QueryCacheStore::new(Arc::clone(&pool)),
            metrics: MetricsStore::new(Arc::clone(&pool)),
            history: ChatHistoryStore::new(Arc::clone(&pool)),
            documents: DocumentStore::new(Arc::clone(&pool)),
            pool,
        }
    }

    /// Drop cache entries, optionally only those unused for `older_than_days`.
    pub fn clear_cache(&self, older_than_days: Option<u32>) -> anyhow::Result<usize> {
        match older_than_days {
            Some(days) => self.cache.purge_unused(days),
            None => self.cache.clear(),
        }
    }

    pub fn get_stats(&self) -> anyhow::Result<RagStats> {
        Ok(RagStats {
            documents_by_type: self.documents.counts_by_type()?,
            chat: self.history.stats()?,
            cache: self.cache.stats()?,
            top_queries: self.cache.top_cached(5)?,
            last_seven_days: self.metrics.summary(7)?,
            recent_questions: self.history.recent(5)?,
        })
    }

    pub fn maintenance(&self) -> anyhow::Result<()> {
        let conn = self.pool.get()?;
        migration::run_maintenance(&conn)?;
        Ok(())
    }

    /// Run store work from async code on the blocking thread pool.
    pub async fn run_blocking<T, F>(self: &Arc<Self>, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&RagDatabase) -> anyhow::Result<T> + Send + 'static,
    {
        let db = Arc::clone(self);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow::anyhow!("Database task failed: {}", e))?
    }
}

// query-intelligence/crates/query-intelligence/src/maintenance.rs

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::rag_db::RagDatabase;

/// Drop cache entries unused for `retention_days`, then tidy the database.
pub async fn sweep_once(db: &Arc<RagDatabase>, retention_days: u32) -> anyhow::Result<usize> {
    db.run_blocking(move |db| {
        let purged = db.cache.purge_unused(retention_days)?;
        db.maintenance()?;
        Ok(purged)
    })
    .await
}

/// Run [`sweep_once`] every `interval` until the handle is aborted.
pub fn spawn_retention_sweep(db: Arc<RagDatabase>, retention_days: u32, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match sweep_once(&db, retention_days).await {
                Ok(0) => {}
                Ok(purged) => info!("Retention sweep removed {} cache entries", purged),
                Err(e) => warn!("Retention sweep failed: {}", e),
            }
        }
    })
}

/// Start the configured background sweep; an interval of zero disables it.
pub fn start_configured_sweep(db: Arc<RagDatabase>, config: &Config) -> Option<JoinHandle<()>> {
    if config.cache_sweep_interval_seconds == 0 {
        info!("Retention sweep disabled");
        return None;
    }
    Some(spawn_retention_sweep(
        db,
        config.cache_retention_days,
        Duration::from_secs(config.cache_sweep_interval_seconds),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::create_test_config;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;

    #[tokio::test]
    async fn test_sweep_removes_only_stale_entries() {
        let db = Arc::new(RagDatabase::new_in_memory().unwrap());
        let now = Utc::now();
        db.cache
            .store_at("old question", "old answer", &json!({}), now - ChronoDuration::days(40))
            .unwrap();
        db.cache.store("fresh question", "fresh answer", &json!({})).unwrap();

        let purged = tokio_test::assert_ok!(sweep_once(&db, 30).await);
        assert_eq!(purged, 1);
        assert!(db.cache.lookup("fresh question").unwrap().is_some());
        assert!(db.cache.lookup("old question").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_spawned_sweep_runs_immediately() {
        let db = Arc::new(RagDatabase::new_in_memory().unwrap());
        db.cache
            .store_at("old question", "old answer", &json!({}), Utc::now() - ChronoDuration::days(90))
            .unwrap();

        let handle = spawn_retention_sweep(Arc::clone(&db), 30, Duration::from_secs(3600));
        for _ in 0..50 {
            if db.cache.stats().unwrap().entries == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert_eq!(db.cache.stats().unwrap().entries, 0);
    }

    #[tokio::test]
    async fn test_configured_sweep_uses_retention_setting() {
        let db = Arc::new(RagDatabase::new_in_memory().unwrap());
        let now = Utc::now();
        db.cache
            .store_at("week old", "answer", &json!({}), now - ChronoDuration::days(7))
            .unwrap();
        db.cache
            .store_at("month old", "answer", &json!({}), now - ChronoDuration::days(45))
            .unwrap();

        let mut config = create_test_config();
        config.cache_retention_days = 30;
        let handle = start_configured_sweep(Arc::clone(&db), &config).unwrap();
        for _ in 0..50 {
            if db.cache.stats().unwrap().entries == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        handle.abort();
        assert!(db.cache.lookup("week old").unwrap().is_some());
        assert!(db.cache.lookup("month old").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_zero_interval_disables_sweep() {
        let db = Arc::new(RagDatabase::new_in_memory().unwrap());
        let mut config = create_test_config();
        config.cache_sweep_interval_seconds = 0;
        assert!(start_configured_sweep(db, &config).is_none());
    }
}

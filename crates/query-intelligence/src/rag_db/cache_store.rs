//! Question -> answer cache
//!
//! Keys are the blake3 digest of the normalized question. Every mutation is a
//! single statement so concurrent requests never lose an increment.
use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info};

use crate::rag_db::schema::*;
use crate::utils::TextUtils;

pub struct QueryCacheStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl QueryCacheStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Deterministic key for a question; pure function of its text.
    pub fn cache_key(question: &str) -> String {
        let normalized = TextUtils::normalize_question(question);
        blake3::hash(normalized.as_bytes()).to_hex().to_string()
    }

    pub fn lookup(&self, question: &str) -> anyhow::Result<Option<CachedAnswer>> {
        self.lookup_at(question, Utc::now())
    }

    /// Return the cached answer and count the hit in one atomic statement.
    pub fn lookup_at(&self, question: &str, now: DateTime<Utc>) -> anyhow::Result<Option<CachedAnswer>> {
        let conn = self.get_conn()?;
        let key = Self::cache_key(question);
        let hit = conn
            .query_row(
                "UPDATE query_cache
                 SET hit_count = hit_count + 1, last_used = ?2
                 WHERE query_hash = ?1
                 RETURNING response, context, hit_count",
                params![key, format_timestamp(&now)],
                |row| {
                    let context: String = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, context, row.get::<_, i64>(2)?))
                },
            )
            .optional()?;

        match hit {
            Some((response, context, hit_count)) => {
                debug!("Cache hit for {} (hits: {})", &key[..12], hit_count);
                Ok(Some(CachedAnswer {
                    response,
                    context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
                    hit_count,
                }))
            }
            None => {
                debug!("Cache miss for {}", &key[..12]);
                Ok(None)
            }
        }
    }

    pub fn store(&self, question: &str, answer: &str, context: &serde_json::Value) -> anyhow::Result<()> {
        self.store_at(question, answer, context, Utc::now())
    }

    /// Insert or refresh an entry; an existing hit count is preserved.
    pub fn store_at(
        &self,
        question: &str,
        answer: &str,
        context: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        let key = Self::cache_key(question);
        conn.execute(
            "INSERT INTO query_cache
             (query_hash, query_text, response, context, hit_count, last_used, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
             ON CONFLICT(query_hash) DO UPDATE SET
                query_text = excluded.query_text,
                response = excluded.response,
                context = excluded.context,
                last_used = excluded.last_used",
            params![
                key,
                TextUtils::normalize_whitespace(question),
                answer,
                serde_json::to_string(context)?,
                format_timestamp(&now),
            ],
        )?;
        debug!("Cached answer for {}", &key[..12]);
        Ok(())
    }

    /// Read an entry without counting a hit.
    pub fn get_entry(&self, question: &str) -> anyhow::Result<Option<CacheEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, query_hash, query_text, response, context, hit_count, last_used, created_at
             FROM query_cache WHERE query_hash = ?1",
        )?;
        let entry = stmt
            .query_row([Self::cache_key(question)], |row| Self::row_to_entry(row))
            .optional()?;
        Ok(entry)
    }

    /// Delete entries not used within the last `older_than_days` days.
    pub fn purge_unused(&self, older_than_days: u32) -> anyhow::Result<usize> {
        let cutoff = Utc::now() - Duration::days(older_than_days as i64);
        self.purge_unused_before(cutoff)
    }

    pub fn purge_unused_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute(
            "DELETE FROM query_cache WHERE last_used < ?1",
            [format_timestamp(&cutoff)],
        )?;
        info!("Purged {} cache entries unused since {}", deleted, format_timestamp(&cutoff));
        Ok(deleted)
    }

    pub fn clear(&self) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = conn.execute("DELETE FROM query_cache", [])?;
        info!("Cleared all {} cache entries", deleted);
        Ok(deleted)
    }

    pub fn top_cached(&self, limit: usize) -> anyhow::Result<Vec<CacheEntry>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, query_hash, query_text, response, context, hit_count, last_used, created_at
             FROM query_cache ORDER BY hit_count DESC, last_used DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map([limit as i64], |row| Self::row_to_entry(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(entries)
    }

    pub fn stats(&self) -> anyhow::Result<CacheStats> {
        let conn = self.get_conn()?;
        let (entries, total_hits) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(hit_count), 0) FROM query_cache",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(CacheStats { entries, total_hits })
    }

    fn row_to_entry(row: &Row) -> rusqlite::Result<CacheEntry> {
        let context: String = row.get(4)?;
        let last_used: String = row.get(6)?;
        let created_at: String = row.get(7)?;
        Ok(CacheEntry {
            id: row.get(0)?,
            query_hash: row.get(1)?,
            query_text: row.get(2)?,
            response: row.get(3)?,
            context: serde_json::from_str(&context).unwrap_or(serde_json::Value::Null),
            hit_count: row.get(5)?,
            last_used: parse_timestamp(6, &last_used)?,
            created_at: parse_timestamp(7, &created_at)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag_db::RagDatabase;
    use proptest::prelude::*;
    use serde_json::json;

    // ===== Key Tests =====

    #[test]
    fn test_cache_key_is_normalized_and_stable() {
        let a = QueryCacheStore::cache_key("How many teachers are there?");
        let b = QueryCacheStore::cache_key("  how many   TEACHERS are there? ");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, QueryCacheStore::cache_key("How many students are there?"));
    }

    // ===== Lookup / Store Tests =====

    #[test]
    fn test_store_then_lookup_counts_hits() {
        let db = RagDatabase::new_in_memory().unwrap();
        db.cache.store("How many teachers?", "There are 12 teachers.", &json!({"tables": ["teacher_profiles"]})).unwrap();

        let first = db.cache.lookup("how many teachers?").unwrap().unwrap();
        assert_eq!(first.response, "There are 12 teachers.");
        assert_eq!(first.context["tables"][0], "teacher_profiles");
        assert_eq!(first.hit_count, 1);

        let second = db.cache.lookup("How many teachers?").unwrap().unwrap();
        assert_eq!(second.hit_count, 2);
    }

    #[test]
    fn test_lookup_miss() {
        let db = RagDatabase::new_in_memory().unwrap();
        assert!(db.cache.lookup("unknown question").unwrap().is_none());
    }

    #[test]
    fn test_restore_preserves_hit_count() {
        let db = RagDatabase::new_in_memory().unwrap();
        db.cache.store("q", "a1", &json!({})).unwrap();
        db.cache.lookup("q").unwrap();
        db.cache.store("q", "a2", &json!({})).unwrap();

        let entry = db.cache.get_entry("q").unwrap().unwrap();
        assert_eq!(entry.response, "a2");
        assert_eq!(entry.hit_count, 1);
    }

    // ===== Retention Tests =====

    #[test]
    fn test_purge_unused_before_only_removes_stale_entries() {
        let db = RagDatabase::new_in_memory().unwrap();
        let now = Utc::now();
        db.cache.store_at("old", "a", &json!({}), now - Duration::days(45)).unwrap();
        db.cache.store_at("recent", "b", &json!({}), now - Duration::days(2)).unwrap();

        let purged = db.cache.purge_unused_before(now - Duration::days(30)).unwrap();
        assert_eq!(purged, 1);
        assert!(db.cache.get_entry("old").unwrap().is_none());
        assert!(db.cache.get_entry("recent").unwrap().is_some());

        // idempotent
        assert_eq!(db.cache.purge_unused_before(now - Duration::days(30)).unwrap(), 0);
    }

    #[test]
    fn test_lookup_refreshes_last_used() {
        let db = RagDatabase::new_in_memory().unwrap();
        let now = Utc::now();
        db.cache.store_at("q", "a", &json!({}), now - Duration::days(45)).unwrap();
        db.cache.lookup_at("q", now).unwrap();

        assert_eq!(db.cache.purge_unused_before(now - Duration::days(30)).unwrap(), 0);
    }

    #[test]
    fn test_purge_unused_by_days() {
        let db = RagDatabase::new_in_memory().unwrap();
        db.cache.store_at("old", "a", &json!({}), Utc::now() - Duration::days(31)).unwrap();
        db.cache.store("fresh", "b", &json!({})).unwrap();
        assert_eq!(db.cache.purge_unused(30).unwrap(), 1);
    }

    // ===== Admin Tests =====

    #[test]
    fn test_top_cached_and_stats() {
        let db = RagDatabase::new_in_memory().unwrap();
        db.cache.store("a", "1", &json!({})).unwrap();
        db.cache.store("b", "2", &json!({})).unwrap();
        db.cache.lookup("b").unwrap();
        db.cache.lookup("b").unwrap();
        db.cache.lookup("a").unwrap();

        let top = db.cache.top_cached(1).unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0].query_text, "b");

        let stats = db.cache.stats().unwrap();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.total_hits, 3);

        assert_eq!(db.cache.clear().unwrap(), 2);
        assert_eq!(db.cache.stats().unwrap().entries, 0);
    }

    // ===== Properties =====

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn prop_hit_count_is_monotonic(question in "[a-zA-Z ?]{1,40}", lookups in 1usize..6) {
            prop_assume!(!question.trim().is_empty());
            let db = RagDatabase::new_in_memory().unwrap();
            db.cache.store(&question, "answer", &json!({})).unwrap();

            let mut last = 0;
            for _ in 0..lookups {
                let hit = db.cache.lookup(&question).unwrap().unwrap();
                prop_assert_eq!(hit.response.as_str(), "answer");
                prop_assert!(hit.hit_count > last);
                last = hit.hit_count;
            }
        }
    }
}

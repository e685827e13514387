//! Daily aggregate metrics
use chrono::{Duration, NaiveDate, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension, Row};
use std::sync::Arc;
use tracing::debug;

use crate::rag_db::schema::*;

pub struct MetricsStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl MetricsStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn record_outcome(
        &self,
        success: bool,
        response_time: f64,
        tokens_used: u32,
        cache_hit: bool,
    ) -> anyhow::Result<()> {
        self.record_outcome_on(Utc::now().date_naive(), success, response_time, tokens_used, cache_hit)
    }

    /// Fold one request into the day's row.
    ///
    /// The running averages are computed by SQLite from the stored values in
    /// the same statement, so concurrent writers cannot interleave a
    /// read-modify-write.
    pub fn record_outcome_on(
        &self,
        date: NaiveDate,
        success: bool,
        response_time: f64,
        tokens_used: u32,
        cache_hit: bool,
    ) -> anyhow::Result<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO rag_metrics
             (date, total_queries, successful_queries, failed_queries,
              avg_response_time, total_tokens_used, cache_hit_rate)
             VALUES (?1, 1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(date) DO UPDATE SET
                avg_response_time = (rag_metrics.avg_response_time * rag_metrics.total_queries
                                     + excluded.avg_response_time) / (rag_metrics.total_queries + 1),
                cache_hit_rate = (rag_metrics.cache_hit_rate * rag_metrics.total_queries
                                  + excluded.cache_hit_rate) / (rag_metrics.total_queries + 1),
                total_queries = rag_metrics.total_queries + 1,
                successful_queries = rag_metrics.successful_queries + excluded.successful_queries,
                failed_queries = rag_metrics.failed_queries + excluded.failed_queries,
                total_tokens_used = rag_metrics.total_tokens_used + excluded.total_tokens_used",
            params![
                format_date(&date),
                success as i64,
                (!success) as i64,
                response_time,
                tokens_used as i64,
                if cache_hit { 1.0 } else { 0.0 },
            ],
        )?;
        debug!(
            "Recorded outcome for {}: success={}, {:.3}s, {} tokens",
            date, success, response_time, tokens_used
        );
        Ok(())
    }

    pub fn get_day(&self, date: NaiveDate) -> anyhow::Result<Option<MetricsDay>> {
        let conn = self.get_conn()?;
        let day = conn
            .query_row(
                "SELECT date, total_queries, successful_queries, failed_queries,
                        avg_response_time, total_tokens_used, cache_hit_rate
                 FROM rag_metrics WHERE date = ?1",
                [format_date(&date)],
                |row| Self::row_to_day(row),
            )
            .optional()?;
        Ok(day)
    }

    /// Days from `since` onwards, newest first.
    pub fn days_since(&self, since: NaiveDate) -> anyhow::Result<Vec<MetricsDay>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT date, total_queries, successful_queries, failed_queries,
                    avg_response_time, total_tokens_used, cache_hit_rate
             FROM rag_metrics WHERE date >= ?1 ORDER BY date DESC",
        )?;
        let days = stmt
            .query_map([format_date(&since)], |row| Self::row_to_day(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(days)
    }

    /// Totals over the last `days` calendar days, today included.
    pub fn summary(&self, days: u32) -> anyhow::Result<MetricsSummary> {
        let since = Utc::now().date_naive() - Duration::days(days.saturating_sub(1) as i64);
        Ok(summarize(&self.days_since(since)?))
    }
}

impl MetricsStore {
    fn row_to_day(row: &Row) -> rusqlite::Result<MetricsDay> {
        Ok(MetricsDay {
            date: row.get(0)?,
            total_queries: row.get(1)?,
            successful_queries: row.get(2)?,
            failed_queries: row.get(3)?,
            avg_response_time: row.get(4)?,
            total_tokens_used: row.get(5)?,
            cache_hit_rate: row.get(6)?,
        })
    }
}

pub fn summarize(days: &[MetricsDay]) -> MetricsSummary {
    let total_queries: i64 = days.iter().map(|d| d.total_queries).sum();
    let successful_queries: i64 = days.iter().map(|d| d.successful_queries).sum();
    let weighted_time: f64 = days
        .iter()
        .map(|d| d.avg_response_time * d.total_queries as f64)
        .sum();

    MetricsSummary {
        days: days.len(),
        total_queries,
        successful_queries,
        failed_queries: days.iter().map(|d| d.failed_queries).sum(),
        success_rate: if total_queries > 0 {
            successful_queries as f64 / total_queries as f64
        } else {
            0.0
        },
        avg_response_time: if total_queries > 0 {
            weighted_time / total_queries as f64
        } else {
            0.0
        },
        total_tokens_used: days.iter().map(|d| d.total_tokens_used).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rag_db::RagDatabase;
    use proptest::prelude::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_first_outcome_creates_day() {
        let db = RagDatabase::new_in_memory().unwrap();
        let date = day(2026, 5, 4);
        assert!(db.metrics.get_day(date).unwrap().is_none());

        db.metrics.record_outcome_on(date, true, 2.0, 120, false).unwrap();
        let row = db.metrics.get_day(date).unwrap().unwrap();
        assert_eq!(row.date, "2026-05-04");
        assert_eq!(row.total_queries, 1);
        assert_eq!(row.successful_queries, 1);
        assert_eq!(row.failed_queries, 0);
        assert_eq!(row.total_tokens_used, 120);
        assert!((row.avg_response_time - 2.0).abs() < 1e-9);
        assert_eq!(row.cache_hit_rate, 0.0);
    }

    #[test]
    fn test_running_average_and_counters() {
        let db = RagDatabase::new_in_memory().unwrap();
        let date = day(2026, 5, 4);
        db.metrics.record_outcome_on(date, true, 1.0, 100, false).unwrap();
        db.metrics.record_outcome_on(date, false, 2.0, 50, false).unwrap();
        db.metrics.record_outcome_on(date, true, 6.0, 0, true).unwrap();

        let row = db.metrics.get_day(date).unwrap().unwrap();
        assert_eq!(row.total_queries, 3);
        assert_eq!(row.successful_queries, 2);
        assert_eq!(row.failed_queries, 1);
        assert_eq!(row.total_tokens_used, 150);
        assert!((row.avg_response_time - 3.0).abs() < 1e-9);
        assert!((row.cache_hit_rate - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_days_are_independent() {
        let db = RagDatabase::new_in_memory().unwrap();
        db.metrics.record_outcome_on(day(2026, 5, 3), true, 1.0, 10, false).unwrap();
        db.metrics.record_outcome_on(day(2026, 5, 4), true, 9.0, 10, false).unwrap();

        let days = db.metrics.days_since(day(2026, 5, 1)).unwrap();
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].date, "2026-05-04");
        assert!((days[1].avg_response_time - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_summary_weights_by_volume() {
        let days = vec![
            MetricsDay {
                date: "2026-05-04".into(),
                total_queries: 3,
                successful_queries: 3,
                failed_queries: 0,
                avg_response_time: 1.0,
                total_tokens_used: 30,
                cache_hit_rate: 0.0,
            },
            MetricsDay {
                date: "2026-05-03".into(),
                total_queries: 1,
                successful_queries: 0,
                failed_queries: 1,
                avg_response_time: 5.0,
                total_tokens_used: 10,
                cache_hit_rate: 0.0,
            },
        ];
        let summary = summarize(&days);
        assert_eq!(summary.days, 2);
        assert_eq!(summary.total_queries, 4);
        assert!((summary.success_rate - 0.75).abs() < 1e-9);
        assert!((summary.avg_response_time - 2.0).abs() < 1e-9);
        assert_eq!(summary.total_tokens_used, 40);

        assert_eq!(summarize(&[]).success_rate, 0.0);
    }

    #[test]
    fn test_summary_includes_today() {
        let db = RagDatabase::new_in_memory().unwrap();
        db.metrics.record_outcome(true, 0.5, 10, false).unwrap();
        let summary = db.metrics.summary(7).unwrap();
        assert_eq!(summary.total_queries, 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_same_valued_updates_keep_average(n in 1usize..12, successes in proptest::collection::vec(any::<bool>(), 12)) {
            let db = RagDatabase::new_in_memory().unwrap();
            let date = day(2026, 6, 1);
            for ok in successes.iter().take(n) {
                db.metrics.record_outcome_on(date, *ok, 5.0, 1, false).unwrap();
            }
            let row = db.metrics.get_day(date).unwrap().unwrap();
            prop_assert_eq!(row.total_queries, n as i64);
            prop_assert!((row.avg_response_time - 5.0).abs() < 1e-9);
        }

        #[test]
        fn prop_average_is_order_independent(mut values in proptest::collection::vec(0.0f64..30.0, 1..10)) {
            let db = RagDatabase::new_in_memory().unwrap();
            let forward = day(2026, 6, 1);
            let reversed = day(2026, 6, 2);
            for v in &values {
                db.metrics.record_outcome_on(forward, true, *v, 0, false).unwrap();
            }
            values.reverse();
            for v in &values {
                db.metrics.record_outcome_on(reversed, true, *v, 0, false).unwrap();
            }
            let a = db.metrics.get_day(forward).unwrap().unwrap().avg_response_time;
            let b = db.metrics.get_day(reversed).unwrap().unwrap().avg_response_time;
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            prop_assert!((a - b).abs() < 1e-6);
            prop_assert!((a - mean).abs() < 1e-6);
        }
    }
}

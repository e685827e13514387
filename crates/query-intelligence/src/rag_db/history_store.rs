use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::rag_db::schema::*;

/// Fields of one answered question, as handed over by the orchestrator.
pub struct ChatParams<'a> {
    pub session_id: &'a str,
    pub requester_id: Option<&'a str>,
    pub requester_role: Option<&'a str>,
    pub query: &'a str,
    pub response: &'a str,
    pub context_used: &'a [String],
    pub sql_queries: &'a [String],
    pub tokens_used: u32,
    pub response_time: f64,
    pub success: bool,
}

pub struct ChatHistoryStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl ChatHistoryStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    pub fn append(&self, params: ChatParams) -> anyhow::Result<ChatRecord> {
        self.append_at(params, Utc::now())
    }

    pub fn append_at(&self, params: ChatParams, now: DateTime<Utc>) -> anyhow::Result<ChatRecord> {
        let conn = self.get_conn()?;
        let id = Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO chat_history
             (id, session_id, requester_id, requester_role, query, response,
              context_used, sql_queries, tokens_used, response_time, success, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                id,
                params.session_id,
                params.requester_id,
                params.requester_role,
                params.query,
                params.response,
                serde_json::to_string(params.context_used)?,
                serde_json::to_string(params.sql_queries)?,
                params.tokens_used as i64,
                params.response_time,
                params.success,
                format_timestamp(&now),
            ],
        )?;
        debug!("Appended chat record {} to session {}", id, params.session_id);

        Ok(ChatRecord {
            id,
            session_id: params.session_id.to_string(),
            requester_id: params.requester_id.map(str::to_string),
            requester_role: params.requester_role.map(str::to_string),
            query: params.query.to_string(),
            response: params.response.to_string(),
            context_used: params.context_used.to_vec(),
            sql_queries: params.sql_queries.to_vec(),
            tokens_used: params.tokens_used,
            response_time: params.response_time,
            success: params.success,
            created_at: now,
        })
    }

    /// Most recent `limit` records of a session, oldest first.
    pub fn session_history(&self, session_id: &str, limit: usize) -> anyhow::Result<Vec<ChatRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, requester_id, requester_role, query, response,
                    context_used, sql_queries, tokens_used, response_time, success, created_at
             FROM chat_history WHERE session_id = ?1
             ORDER BY created_at DESC, rowid DESC LIMIT ?2",
        )?;
        let mut records = stmt
            .query_map(params![session_id, limit as i64], |row| Self::row_to_record(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    pub fn recent(&self, limit: usize) -> anyhow::Result<Vec<ChatRecord>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, requester_id, requester_role, query, response,
                    context_used, sql_queries, tokens_used, response_time, success, created_at
             FROM chat_history ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let records = stmt
            .query_map([limit as i64], |row| Self::row_to_record(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    /// Delete everything, or only records older than `older_than_days`.
    pub fn clear_history(&self, older_than_days: Option<u32>) -> anyhow::Result<usize> {
        let conn = self.get_conn()?;
        let deleted = match older_than_days {
            Some(days) => {
                let cutoff = Utc::now() - Duration::days(days as i64);
                conn.execute(
                    "DELETE FROM chat_history WHERE created_at < ?1",
                    [format_timestamp(&cutoff)],
                )?
            }
            None => conn.execute("DELETE FROM chat_history", [])?,
        };
        info!("Cleared {} chat history records", deleted);
        Ok(deleted)
    }

    pub fn stats(&self) -> anyhow::Result<ChatStats> {
        let conn = self.get_conn()?;
        let stats = conn.query_row(
            "SELECT COUNT(*),
                    COUNT(DISTINCT session_id),
                    COUNT(DISTINCT requester_id),
                    COALESCE(AVG(tokens_used), 0.0),
                    COALESCE(AVG(response_time), 0.0)
             FROM chat_history",
            [],
            |row| {
                Ok(ChatStats {
                    total_queries: row.get(0)?,
                    unique_sessions: row.get(1)?,
                    unique_requesters: row.get(2)?,
                    avg_tokens: row.get(3)?,
                    avg_response_time: row.get(4)?,
                })
            },
        )?;
        Ok(stats)
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<ChatRecord> {
        let context_used: String = row.get(6)?;
        let sql_queries: String = row.get(7)?;
        let created_at: String = row.get(11)?;
        let tokens_used: i64 = row.get(8)?;
        Ok(ChatRecord {
            id: row.get(0)?,
            session_id: row.get(1)?,
            requester_id: row.get(2)?,
            requester_role: row.get(3)?,
            query: row.get(4)?,
            response: row.get(5)?,
            context_used: serde_json::from_str(&context_used).unwrap_or_default(),
            sql_queries: serde_json::from_str(&sql_queries).unwrap_or_default(),
            tokens_used: tokens_used.max(0) as u32,
            response_time: row.get(9)?,
            success: row.get(10)?,
            created_at: parse_timestamp(11, &created_at)?,
        })
    }
}

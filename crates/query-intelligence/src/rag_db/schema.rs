//! Record types persisted by the RAG database
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Timestamps are stored at second precision so that string order is time order.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub fn format_date(date: &NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: i64,
    pub query_hash: String,
    pub query_text: String,
    pub response: String,
    pub context: serde_json::Value,
    pub hit_count: i64,
    pub last_used: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// What a cache hit hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedAnswer {
    pub response: String,
    pub context: serde_json::Value,
    pub hit_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsDay {
    pub date: String,
    pub total_queries: i64,
    pub successful_queries: i64,
    pub failed_queries: i64,
    pub avg_response_time: f64,
    pub total_tokens_used: i64,
    pub cache_hit_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentType {
    Schema,
    Pattern,
    Relationship,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Pattern => "pattern",
            Self::Relationship => "relationship",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DocumentType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "schema" => Ok(Self::Schema),
            "pattern" => Ok(Self::Pattern),
            "relationship" => Ok(Self::Relationship),
            other => Err(anyhow::anyhow!("Unknown document type: {}", other)),
        }
    }
}

/// A knowledge-store entry. Written during indexing, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaDocument {
    pub title: String,
    pub content: String,
    pub category: String,
    pub document_type: DocumentType,
    pub table_name: Option<String>,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: String,
    pub session_id: String,
    pub requester_id: Option<String>,
    pub requester_role: Option<String>,
    pub query: String,
    pub response: String,
    pub context_used: Vec<String>,
    pub sql_queries: Vec<String>,
    pub tokens_used: u32,
    pub response_time: f64,
    pub success: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub entries: i64,
    pub total_hits: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatStats {
    pub total_queries: i64,
    pub unique_sessions: i64,
    pub unique_requesters: i64,
    pub avg_tokens: f64,
    pub avg_response_time: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSummary {
    pub days: usize,
    pub total_queries: i64,
    pub successful_queries: i64,
    pub failed_queries: i64,
    pub success_rate: f64,
    pub avg_response_time: f64,
    pub total_tokens_used: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RagStats {
    pub documents_by_type: Vec<(String, i64)>,
    pub chat: ChatStats,
    pub cache: CacheStats,
    pub top_queries: Vec<CacheEntry>,
    pub last_seven_days: MetricsSummary,
    pub recent_questions: Vec<ChatRecord>,
}

//! Capability interfaces consumed by the query engine
//!
//! The engine only ever talks to language models, embedding models and the
//! institution's data store through these traits.

pub mod llm_worker;
pub mod sqlite_source;

pub use llm_worker::LLMWorker;
pub use sqlite_source::SqliteDataSource;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One prompt for a completion call.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_used: u32,
}

#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion>;
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.embed(text).await?);
        }
        Ok(vectors)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
}

impl ColumnInfo {
    pub fn new(name: &str, data_type: &str) -> Self {
        Self {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable: true,
            primary_key: name == "id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub referenced_table: String,
    pub referenced_column: String,
}

/// A single result row, keeping the column order of the statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievedRow(Vec<(String, Value)>);

impl RetrievedRow {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self(columns)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.iter().find(|(name, _)| name == column).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.0.iter().map(|(name, v)| (name.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait]
pub trait DataStore: Send + Sync {
    async fn list_tables(&self) -> anyhow::Result<Vec<String>>;

    async fn get_columns(&self, table: &str) -> anyhow::Result<Vec<ColumnInfo>>;

    async fn foreign_keys(&self, _table: &str) -> anyhow::Result<Vec<ForeignKey>> {
        Ok(Vec::new())
    }

    /// Run a statement that must not modify data, returning at most `row_cap` rows.
    async fn run_read_only_query(
        &self,
        statement: &str,
        row_cap: usize,
    ) -> anyhow::Result<Vec<RetrievedRow>>;
}

// query-intelligence/crates/query-intelligence/src/lib.rs

pub mod catalog;
pub mod config;
pub mod error;
pub mod knowledge;
pub mod maintenance;
pub mod metrics;
pub mod providers;
pub mod query_engine;
pub mod rag_db;
pub mod telemetry;
pub mod utils;

#[cfg(test)]
mod test_support;

// Public API exports
pub use catalog::{EntityCatalog, EntityMap};
pub use config::Config;
pub use error::{QueryError, QueryErrorKind};
pub use knowledge::SchemaKnowledgeStore;
pub use providers::{CompletionProvider, DataStore, Embedder, LLMWorker, SqliteDataSource};
pub use query_engine::{Answer, Intent, Question, QueryOrchestrator, SourcesSummary};
pub use rag_db::RagDatabase;

//! Schema knowledge: indexing the live schema into searchable documents
pub mod knowledge_store;
pub mod schema_indexer;

pub use knowledge_store::{cosine_similarity, KnowledgeConfig, SchemaKnowledgeStore, SearchHit};
pub use schema_indexer::SchemaIndexer;

//! Similarity search over schema documentation
//!
//! Documents live in the RAG database and in an in-memory snapshot. Searches
//! read the snapshot without locking; re-indexing persists a new document set
//! and swaps the snapshot in one step.
use arc_swap::ArcSwap;
use futures::stream::{self, StreamExt, TryStreamExt};
use rayon::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::schema_indexer::SchemaIndexer;
use crate::catalog::EntityCatalog;
use crate::config::Config;
use crate::error::{with_deadline, QueryErrorKind};
use crate::providers::{DataStore, Embedder};
use crate::rag_db::{RagDatabase, SchemaDocument};
use crate::utils::{content_words, singularize};

#[derive(Debug, Clone)]
pub struct KnowledgeConfig {
    pub top_k: usize,
    pub similarity_threshold: f32,
    pub embedding_timeout: Duration,
    pub data_store_timeout: Duration,
    pub embedding_model: String,
    pub row_cap: usize,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            similarity_threshold: 0.2,
            embedding_timeout: Duration::from_secs(15),
            data_store_timeout: Duration::from_secs(10),
            embedding_model: "local-embedding".to_string(),
            row_cap: 100,
        }
    }
}

impl From<&Config> for KnowledgeConfig {
    fn from(config: &Config) -> Self {
        Self {
            top_k: config.knowledge_top_k,
            similarity_threshold: config.similarity_threshold,
            embedding_timeout: config.embedding_timeout(),
            data_store_timeout: config.data_store_timeout(),
            embedding_model: config.embedding_model.clone(),
            row_cap: config.row_cap,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub document: SchemaDocument,
    pub score: f32,
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

fn word_set(text: &str) -> HashSet<String> {
    content_words(text).iter().map(|w| singularize(w)).collect()
}

fn rank(mut hits: Vec<SearchHit>, top_k: usize) -> Vec<SearchHit> {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    hits.truncate(top_k);
    hits
}

pub struct SchemaKnowledgeStore {
    embedder: Arc<dyn Embedder>,
    db: Arc<RagDatabase>,
    snapshot: ArcSwap<Vec<SchemaDocument>>,
    config: KnowledgeConfig,
}

impl SchemaKnowledgeStore {
    pub fn new(embedder: Arc<dyn Embedder>, db: Arc<RagDatabase>, config: KnowledgeConfig) -> Self {
        Self {
            embedder,
            db,
            snapshot: ArcSwap::from_pointee(Vec::new()),
            config,
        }
    }

    /// Load persisted documents into the snapshot.
    pub async fn load(&self) -> anyhow::Result<usize> {
        let documents = self.db.run_blocking(|db| db.documents.load_all()).await?;
        let count = documents.len();
        self.snapshot.store(Arc::new(documents));
        info!("Loaded {} knowledge documents", count);
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshot.load().is_empty()
    }

    /// Closest documents to `question`. Falls back to word overlap when the
    /// embedder is unavailable; never fails.
    pub async fn search(&self, question: &str) -> Vec<SearchHit> {
        let documents = self.snapshot.load_full();
        if documents.is_empty() {
            return Vec::new();
        }

        let embedded = with_deadline(
            "question embedding",
            self.config.embedding_timeout,
            QueryErrorKind::CompletionProviderError,
            self.embedder.embed(question),
        )
        .await;

        match embedded {
            Ok(query_vector) => {
                let threshold = self.config.similarity_threshold;
                let hits: Vec<SearchHit> = documents
                    .par_iter()
                    .filter(|doc| !doc.embedding.is_empty())
                    .filter_map(|doc| {
                        let score = cosine_similarity(&query_vector, &doc.embedding);
                        (score >= threshold).then(|| SearchHit {
                            document: doc.clone(),
                            score,
                        })
                    })
                    .collect();
                debug!("Semantic search matched {} documents", hits.len());
                rank(hits, self.config.top_k)
            }
            Err(e) => {
                warn!("Embedding failed, using keyword search: {}", e);
                self.keyword_search(question, &documents)
            }
        }
    }

    /// Score by the share of the question's content words found in each document.
    pub fn keyword_search(&self, question: &str, documents: &[SchemaDocument]) -> Vec<SearchHit> {
        let wanted = word_set(question);
        if wanted.is_empty() {
            return Vec::new();
        }
        let hits: Vec<SearchHit> = documents
            .par_iter()
            .filter_map(|doc| {
                let words = word_set(&format!("{} {}", doc.title, doc.content));
                let found = wanted.iter().filter(|w| words.contains(*w)).count();
                (found > 0).then(|| SearchHit {
                    document: doc.clone(),
                    score: found as f32 / wanted.len() as f32,
                })
            })
            .collect();
        rank(hits, self.config.top_k)
    }

    /// Rebuild every document from the live schema, then replace the stored
    /// set and the snapshot together. The old snapshot stays on failure.
    pub async fn reindex(&self, store: &dyn DataStore, catalog: &EntityCatalog) -> anyhow::Result<usize> {
        let documents =
            SchemaIndexer::new(store, catalog, self.config.data_store_timeout, self.config.row_cap)
                .build_documents()
                .await?;

        let width = num_cpus::get().max(1);
        let embedded: Vec<SchemaDocument> = stream::iter(documents.into_iter().map(|mut doc| async move {
            let text = format!("{}\n{}", doc.title, doc.content);
            doc.embedding = with_deadline(
                "document embedding",
                self.config.embedding_timeout,
                QueryErrorKind::CompletionProviderError,
                self.embedder.embed(&text),
            )
            .await
            .map_err(|e| anyhow::anyhow!("Failed to embed '{}': {}", doc.title, e))?;
            Ok::<_, anyhow::Error>(doc)
        }))
        .buffered(width)
        .try_collect()
        .await?;

        let model = self.config.embedding_model.clone();
        let documents = self
            .db
            .run_blocking(move |db| db.documents.replace_all(&embedded, &model).map(|_| embedded))
            .await?;

        let count = documents.len();
        self.snapshot.store(Arc::new(documents));
        info!("Re-indexed {} knowledge documents", count);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::EntityMap;
    use crate::rag_db::DocumentType;
    use crate::test_support::{school_database, MockEmbedder};
    use tempfile::TempDir;

    fn store_with(embedder: MockEmbedder) -> SchemaKnowledgeStore {
        SchemaKnowledgeStore::new(
            Arc::new(embedder),
            Arc::new(RagDatabase::new_in_memory().unwrap()),
            KnowledgeConfig {
                similarity_threshold: 0.05,
                ..KnowledgeConfig::default()
            },
        )
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_search_on_empty_index() {
        let store = store_with(MockEmbedder::new());
        assert!(store.search("teachers").await.is_empty());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_reindex_then_search() {
        let dir = TempDir::new().unwrap();
        let source = school_database(dir.path());
        let catalog = EntityCatalog::new(EntityMap::default());
        let store = store_with(MockEmbedder::new());

        let count = store.reindex(&source, &catalog).await.unwrap();
        assert_eq!(count, store.len());
        assert!(count >= 5);

        let hits = store.search("student grades").await;
        assert!(!hits.is_empty());
        assert!(hits.len() <= 3);
        assert_eq!(hits[0].document.table_name.as_deref(), Some("students"));
        assert!(hits.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[tokio::test]
    async fn test_reindex_persists_documents() {
        let dir = TempDir::new().unwrap();
        let source = school_database(dir.path());
        let catalog = EntityCatalog::new(EntityMap::default());
        let db = Arc::new(RagDatabase::new_in_memory().unwrap());
        let config = KnowledgeConfig::default();

        let first = SchemaKnowledgeStore::new(Arc::new(MockEmbedder::new()), Arc::clone(&db), config.clone());
        let count = first.reindex(&source, &catalog).await.unwrap();

        let second = SchemaKnowledgeStore::new(Arc::new(MockEmbedder::new()), db, config);
        assert_eq!(second.load().await.unwrap(), count);
        let loaded = second.snapshot.load();
        assert_eq!(loaded[0].document_type, DocumentType::Pattern);
        assert!(!loaded[0].embedding.is_empty());
    }

    #[tokio::test]
    async fn test_failed_reindex_keeps_previous_snapshot() {
        let dir = TempDir::new().unwrap();
        let source = school_database(dir.path());
        let catalog = EntityCatalog::new(EntityMap::default());
        let db = Arc::new(RagDatabase::new_in_memory().unwrap());

        let good = SchemaKnowledgeStore::new(Arc::new(MockEmbedder::new()), Arc::clone(&db), KnowledgeConfig::default());
        let count = good.reindex(&source, &catalog).await.unwrap();

        let broken = SchemaKnowledgeStore::new(Arc::new(MockEmbedder::failing()), db, KnowledgeConfig::default());
        broken.load().await.unwrap();
        assert!(broken.reindex(&source, &catalog).await.is_err());
        assert_eq!(broken.len(), count);
    }

    #[tokio::test]
    async fn test_search_falls_back_to_keywords() {
        let dir = TempDir::new().unwrap();
        let source = school_database(dir.path());
        let catalog = EntityCatalog::new(EntityMap::default());
        let db = Arc::new(RagDatabase::new_in_memory().unwrap());
        SchemaKnowledgeStore::new(Arc::new(MockEmbedder::new()), Arc::clone(&db), KnowledgeConfig::default())
            .reindex(&source, &catalog)
            .await
            .unwrap();

        let embedder = Arc::new(MockEmbedder::failing());
        let store = SchemaKnowledgeStore::new(embedder.clone(), db, KnowledgeConfig::default());
        store.load().await.unwrap();

        let hits = store.search("departments").await;
        assert_eq!(embedder.calls(), 1);
        assert!(!hits.is_empty());
        assert!(hits
            .iter()
            .any(|h| h.document.table_name.as_deref() == Some("departments")));
    }
}

// query-intelligence/crates/query-intelligence/src/config.rs

use anyhow::Result;
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub rag_db_path: PathBuf,
    pub data_db_path: PathBuf,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
    pub llm_model: String,
    pub embedding_model: String,
    pub completion_timeout_seconds: u64,
    pub embedding_timeout_seconds: u64,
    pub data_store_timeout_seconds: u64,
    pub row_cap: usize,
    pub cache_retention_days: u32,
    pub cache_sweep_interval_seconds: u64,
    pub cache_conversational: bool,
    pub knowledge_top_k: usize,
    pub similarity_threshold: f32,
    pub table_list_ttl_seconds: u64,
    pub entity_map_path: Option<PathBuf>,
    pub history_enabled: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        let config = Self {
            rag_db_path: env::var("RAG_DB_PATH")
                .unwrap_or_else(|_| "./data/rag.db".into())
                .into(),
            data_db_path: env::var("DATA_DB_PATH")
                .unwrap_or_else(|_| "./data/institution.db".into())
                .into(),
            llm_base_url: env::var("LLM_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8081".into()),
            llm_api_key: env::var("LLM_API_KEY").ok().filter(|k| !k.trim().is_empty()),
            llm_model: env::var("LLM_MODEL").unwrap_or_else(|_| "local-llm".into()),
            embedding_model: env::var("EMBEDDING_MODEL").unwrap_or_else(|_| "local-embedding".into()),
            completion_timeout_seconds: env::var("COMPLETION_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            embedding_timeout_seconds: env::var("EMBEDDING_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "15".into())
                .parse()?,
            data_store_timeout_seconds: env::var("DATA_STORE_TIMEOUT_SECONDS")
                .unwrap_or_else(|_| "10".into())
                .parse()?,
            row_cap: env::var("ROW_CAP").unwrap_or_else(|_| "100".into()).parse()?,
            cache_retention_days: env::var("CACHE_RETENTION_DAYS")
                .unwrap_or_else(|_| "30".into())
                .parse()?,
            cache_sweep_interval_seconds: env::var("CACHE_SWEEP_INTERVAL_SECONDS")
                .unwrap_or_else(|_| "3600".into())
                .parse()?,
            cache_conversational: env::var("CACHE_CONVERSATIONAL")
                .unwrap_or_else(|_| "false".into())
                .parse()?,
            knowledge_top_k: env::var("KNOWLEDGE_TOP_K")
                .unwrap_or_else(|_| "3".into())
                .parse()?,
            similarity_threshold: env::var("SIMILARITY_THRESHOLD")
                .unwrap_or_else(|_| "0.2".into())
                .parse()?,
            table_list_ttl_seconds: env::var("TABLE_LIST_TTL_SECONDS")
                .unwrap_or_else(|_| "300".into())
                .parse()?,
            entity_map_path: env::var("ENTITY_MAP_PATH").ok().map(PathBuf::from),
            history_enabled: env::var("HISTORY_ENABLED")
                .unwrap_or_else(|_| "true".into())
                .parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.row_cap == 0 {
            return Err(anyhow::anyhow!("ROW_CAP must be greater than zero"));
        }
        if self.completion_timeout_seconds == 0
            || self.embedding_timeout_seconds == 0
            || self.data_store_timeout_seconds == 0
        {
            return Err(anyhow::anyhow!("Timeouts must be greater than zero seconds"));
        }
        if !(-1.0..=1.0).contains(&self.similarity_threshold) {
            return Err(anyhow::anyhow!(
                "SIMILARITY_THRESHOLD must be within [-1, 1], got {}",
                self.similarity_threshold
            ));
        }
        Ok(())
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_seconds)
    }

    pub fn embedding_timeout(&self) -> Duration {
        Duration::from_secs(self.embedding_timeout_seconds)
    }

    pub fn data_store_timeout(&self) -> Duration {
        Duration::from_secs(self.data_store_timeout_seconds)
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- RAG Database: {}", self.rag_db_path.display());
        info!("- Data Source: {}", self.data_db_path.display());
        info!("- LLM Backend: {}", self.llm_base_url);
        info!("- LLM API Key: {}", if self.llm_api_key.is_some() { "<set>" } else { "<none>" });
        info!("- Models: {} / {}", self.llm_model, self.embedding_model);
        info!(
            "- Timeouts: completion {}s, embedding {}s, data store {}s",
            self.completion_timeout_seconds, self.embedding_timeout_seconds, self.data_store_timeout_seconds
        );
        info!("- Row Cap: {}", self.row_cap);
        info!(
            "- Cache: retention {}d, sweep every {}s, conversational {}",
            self.cache_retention_days, self.cache_sweep_interval_seconds, self.cache_conversational
        );
        info!(
            "- Knowledge: top {} (threshold {:.2})",
            self.knowledge_top_k, self.similarity_threshold
        );
        info!("- Table List TTL: {}s", self.table_list_ttl_seconds);
        match &self.entity_map_path {
            Some(path) => info!("- Entity Map: {}", path.display()),
            None => info!("- Entity Map: built-in defaults"),
        }
        info!("- History: {}", self.history_enabled);
    }
}

#[cfg(test)]
pub(crate) fn create_test_config() -> Config {
    Config {
        rag_db_path: PathBuf::from("/tmp/rag-test.db"),
        data_db_path: PathBuf::from("/tmp/institution-test.db"),
        llm_base_url: "http://127.0.0.1:8081".to_string(),
        llm_api_key: None,
        llm_model: "local-llm".to_string(),
        embedding_model: "local-embedding".to_string(),
        completion_timeout_seconds: 30,
        embedding_timeout_seconds: 15,
        data_store_timeout_seconds: 10,
        row_cap: 100,
        cache_retention_days: 30,
        cache_sweep_interval_seconds: 3600,
        cache_conversational: false,
        knowledge_top_k: 3,
        similarity_threshold: 0.2,
        table_list_ttl_seconds: 300,
        entity_map_path: None,
        history_enabled: true,
    }
}

//! `answer_question`: the full pipeline for one question
//!
//! Classify, plan, consult the answer cache, synthesize and run a guarded
//! statement, then compose the answer. Every failure along the way is
//! converted into a degraded [`Answer`]; nothing here returns an error to
//! the caller.
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use super::classifier::{Intent, QueryClassifier};
use super::composer::{AnswerPath, ComposerConfig, ResponseComposer};
use super::executor::QueryExecutor;
use super::fallback::{FallbackAnalyzer, Suggestion};
use super::planner::{QueryPlan, QueryPlanner};
use super::synthesizer::{QueryOrigin, QuerySynthesizer, SynthesizerConfig};
use crate::catalog::{EntityCatalog, EntityMap};
use crate::config::Config;
use crate::error::{with_store_deadline, QueryError, QueryErrorKind};
use crate::knowledge::{KnowledgeConfig, SchemaKnowledgeStore};
use crate::metrics;
use crate::providers::{CompletionProvider, DataStore, Embedder, LLMWorker, SqliteDataSource};
use crate::rag_db::{ChatParams, RagDatabase};

const ANONYMOUS_SESSION: &str = "anonymous";

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub synthesizer: SynthesizerConfig,
    pub composer: ComposerConfig,
    pub row_cap: usize,
    pub data_store_timeout: Duration,
    pub fallback_timeout: Duration,
    pub table_list_ttl: Duration,
    pub cache_conversational: bool,
    pub history_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            synthesizer: SynthesizerConfig::default(),
            composer: ComposerConfig::default(),
            row_cap: 100,
            data_store_timeout: Duration::from_secs(10),
            fallback_timeout: Duration::from_secs(30),
            table_list_ttl: Duration::from_secs(300),
            cache_conversational: false,
            history_enabled: true,
        }
    }
}

impl From<&Config> for OrchestratorConfig {
    fn from(config: &Config) -> Self {
        Self {
            synthesizer: SynthesizerConfig::from(config),
            composer: ComposerConfig::from(config),
            row_cap: config.row_cap,
            data_store_timeout: config.data_store_timeout(),
            fallback_timeout: config.completion_timeout(),
            table_list_ttl: Duration::from_secs(config.table_list_ttl_seconds),
            cache_conversational: config.cache_conversational,
            history_enabled: config.history_enabled,
        }
    }
}

/// Who asked. Used for attribution only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Requester {
    pub id: String,
    pub role: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Question {
    pub text: String,
    pub session_id: Option<String>,
    pub requester: Option<Requester>,
}

impl Question {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            requester: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_requester(mut self, id: impl Into<String>, role: Option<&str>) -> Self {
        self.requester = Some(Requester {
            id: id.into(),
            role: role.map(str::to_string),
        });
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStage {
    Received,
    Classified,
    Planned,
    CacheHit,
    Synthesizing,
    Executing,
    Composing,
    SynthesisFailed,
    ExecutionFailed,
    FallbackAnalyzed,
    Done,
    DoneWithError,
}

impl QueryStage {
    pub fn can_advance_to(self, next: QueryStage) -> bool {
        use QueryStage::*;
        matches!(
            (self, next),
            (Received, Classified)
                | (Received, DoneWithError)
                | (Classified, Planned)
                | (Planned, CacheHit)
                | (Planned, Synthesizing)
                | (Planned, Composing)
                | (CacheHit, Done)
                | (Synthesizing, Executing)
                | (Synthesizing, SynthesisFailed)
                | (Executing, Composing)
                | (Executing, ExecutionFailed)
                | (Composing, Done)
                | (SynthesisFailed, FallbackAnalyzed)
                | (ExecutionFailed, FallbackAnalyzed)
                | (FallbackAnalyzed, DoneWithError)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::DoneWithError)
    }
}

/// Stage trail of one question. Illegal transitions are refused and logged.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    stages: Vec<QueryStage>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            stages: vec![QueryStage::Received],
        }
    }
}

impl Lifecycle {
    pub fn current(&self) -> QueryStage {
        self.stages.last().copied().unwrap_or(QueryStage::Received)
    }

    pub fn advance(&mut self, next: QueryStage) -> bool {
        let current = self.current();
        if !current.can_advance_to(next) || self.stages.contains(&next) {
            warn!("Refusing stage transition {:?} -> {:?}", current, next);
            return false;
        }
        debug!("Stage {:?} -> {:?}", current, next);
        self.stages.push(next);
        true
    }

    pub fn stages(&self) -> &[QueryStage] {
        &self.stages
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourcesSummary {
    pub intent: Option<Intent>,
    pub tables: Vec<String>,
    pub primary_table: Option<String>,
    pub statement: Option<String>,
    pub query_origin: Option<QueryOrigin>,
    pub row_count: usize,
    pub knowledge_documents: Vec<String>,
    pub steps: Vec<String>,
    pub stages: Vec<QueryStage>,
    pub recovered: Vec<QueryErrorKind>,
    pub suggestion: Option<Suggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    pub success: bool,
    pub tokens_used: u32,
    pub response_time_seconds: f64,
    pub cached: bool,
    pub sources_summary: SourcesSummary,
}

/// Mutable state accumulated while one question moves through the pipeline.
#[derive(Default)]
struct PipelineRun {
    lifecycle: Lifecycle,
    summary: SourcesSummary,
    tokens_used: u32,
    cached: bool,
    cache_eligible: bool,
}

impl PipelineRun {
    fn recover(&mut self, error: &QueryError) {
        debug!("Recovered from {}", error);
        self.summary.recovered.push(error.kind);
    }

    fn adopt_plan(&mut self, plan: &QueryPlan) {
        self.summary.intent = Some(plan.intent);
        self.summary.tables = plan.candidate_tables.clone();
        self.summary.primary_table = plan.primary_table.clone();
        self.summary.steps = plan.steps.clone();
    }
}

pub struct QueryOrchestrator {
    catalog: Arc<EntityCatalog>,
    planner: QueryPlanner,
    synthesizer: QuerySynthesizer,
    executor: QueryExecutor,
    composer: ResponseComposer,
    fallback: FallbackAnalyzer,
    knowledge: Arc<SchemaKnowledgeStore>,
    data_store: Arc<dyn DataStore>,
    db: Arc<RagDatabase>,
    table_names: Cache<(), Arc<Vec<String>>>,
    config: OrchestratorConfig,
}

impl QueryOrchestrator {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        data_store: Arc<dyn DataStore>,
        knowledge: Arc<SchemaKnowledgeStore>,
        db: Arc<RagDatabase>,
        catalog: Arc<EntityCatalog>,
        config: OrchestratorConfig,
    ) -> Self {
        let table_names = Cache::builder()
            .max_capacity(1)
            .time_to_live(config.table_list_ttl)
            .build();
        Self {
            planner: QueryPlanner::new(Arc::clone(&catalog)),
            synthesizer: QuerySynthesizer::new(Arc::clone(&provider), config.synthesizer.clone()),
            executor: QueryExecutor::new(Arc::clone(&data_store), config.row_cap, config.data_store_timeout),
            composer: ResponseComposer::new(Arc::clone(&provider), config.composer.clone()),
            fallback: FallbackAnalyzer::new(provider, config.fallback_timeout),
            catalog,
            knowledge,
            data_store,
            db,
            table_names,
            config,
        }
    }

    /// Wire the HTTP model client, the read-only data source and the RAG
    /// database from configuration, loading any persisted knowledge.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let worker = Arc::new(LLMWorker::from_config(config));
        let data_store: Arc<dyn DataStore> = Arc::new(SqliteDataSource::open(&config.data_db_path)?);
        let db = Arc::new(RagDatabase::new(&config.rag_db_path)?);
        let entity_map = match &config.entity_map_path {
            Some(path) => EntityMap::from_json_file(path)?,
            None => EntityMap::default(),
        };

        let embedder: Arc<dyn Embedder> = worker.clone();
        let knowledge = Arc::new(SchemaKnowledgeStore::new(
            embedder,
            Arc::clone(&db),
            KnowledgeConfig::from(config),
        ));
        knowledge.load().await?;

        Ok(Self::new(
            worker,
            data_store,
            knowledge,
            db,
            Arc::new(EntityCatalog::new(entity_map)),
            OrchestratorConfig::from(config),
        ))
    }

    pub fn database(&self) -> &Arc<RagDatabase> {
        &self.db
    }

    pub fn knowledge(&self) -> &Arc<SchemaKnowledgeStore> {
        &self.knowledge
    }

    /// Rebuild the knowledge index from the current schema.
    pub async fn reindex(&self) -> anyhow::Result<usize> {
        self.catalog.forget_columns();
        self.table_names.invalidate_all();
        self.knowledge.reindex(self.data_store.as_ref(), &self.catalog).await
    }

    pub async fn answer_question(&self, question: &str, session_id: Option<&str>, use_cache: bool) -> Answer {
        let mut question = Question::new(question);
        question.session_id = session_id.map(str::to_string);
        self.answer(question, use_cache).await
    }

    pub async fn answer(&self, question: Question, use_cache: bool) -> Answer {
        let request_id = Uuid::new_v4();
        let span = info_span!(
            "answer_question",
            request_id = %request_id,
            session = question.session_id.as_deref().unwrap_or("-"),
            requester = question.requester.as_ref().map(|r| r.id.as_str()).unwrap_or("-"),
            role = question
                .requester
                .as_ref()
                .and_then(|r| r.role.as_deref())
                .unwrap_or("-"),
        );
        self.run(question, use_cache).instrument(span).await
    }

    async fn all_tables(&self) -> Result<Arc<Vec<String>>, QueryError> {
        let store = Arc::clone(&self.data_store);
        let timeout = self.config.data_store_timeout;
        self.table_names
            .try_get_with((), async move {
                with_store_deadline("table listing", timeout, store.list_tables())
                    .await
                    .map(Arc::new)
            })
            .await
            .map_err(|e| (*e).clone())
    }

    async fn run(&self, question: Question, use_cache: bool) -> Answer {
        let started = Instant::now();
        let mut run = PipelineRun::default();
        let text = question.text.trim().to_string();

        if text.is_empty() {
            run.lifecycle.advance(QueryStage::DoneWithError);
            return self
                .finish(&question, run, "Please ask a question.".to_string(), false, started)
                .await;
        }
        info!("Answering: {}", text);

        let classification = QueryClassifier::classify_with_signal(&text);
        let intent = classification.intent;
        if classification.matched.is_none() {
            run.recover(&QueryError::new(
                QueryErrorKind::ClassificationAmbiguous,
                "no intent keyword matched",
            ));
        }
        run.lifecycle.advance(QueryStage::Classified);

        let all_tables = match self.all_tables().await {
            Ok(tables) => tables,
            Err(e) => {
                warn!("Could not list tables: {}", e);
                run.recover(&e);
                Arc::new(Vec::new())
            }
        };
        let mut plan = self.planner.plan(&text, intent, &all_tables);
        if intent.is_data_query() && plan.candidate_tables.is_empty() {
            run.recover(&QueryError::new(
                QueryErrorKind::EntityNotResolved,
                format!("no table found for {:?}", plan.entity),
            ));
        }
        run.adopt_plan(&plan);
        run.lifecycle.advance(QueryStage::Planned);
        info!("Intent {} over {:?}", intent, plan.candidate_tables);

        // a data question with no table never ran a query; its answer must not stick
        let answerable = !(intent.is_data_query() && plan.candidate_tables.is_empty());
        run.cache_eligible =
            use_cache && answerable && (intent.is_data_query() || self.config.cache_conversational);
        if run.cache_eligible {
            let key = text.clone();
            match self.db.run_blocking(move |db| db.cache.lookup(&key)).await {
                Ok(Some(hit)) => {
                    info!("Cache hit ({} hits)", hit.hit_count);
                    run.cached = true;
                    run.summary.statement = hit
                        .context
                        .get("statement")
                        .and_then(|v| v.as_str())
                        .map(str::to_string);
                    run.lifecycle.advance(QueryStage::CacheHit);
                    run.lifecycle.advance(QueryStage::Done);
                    return self.finish(&question, run, hit.response, true, started).await;
                }
                Ok(None) => debug!("Cache miss"),
                Err(e) => warn!("Cache lookup failed: {}", e),
            }
        }

        let snippets = self.knowledge.search(&text).await;
        run.summary.knowledge_documents = snippets.iter().map(|h| h.document.title.clone()).collect();
        let snippet_texts: Vec<String> = snippets.into_iter().map(|h| h.document.content).collect();

        if !plan.needs_synthesized_query {
            run.lifecycle.advance(QueryStage::Composing);
            let composed = self
                .composer
                .compose(&text, &[], &snippet_texts, AnswerPath::Knowledge)
                .await;
            run.tokens_used += composed.tokens_used;
            if let Some(e) = &composed.recovered {
                run.recover(e);
            }
            run.lifecycle.advance(QueryStage::Done);
            return self.finish(&question, run, composed.text, true, started).await;
        }

        self.planner
            .describe_tables(&mut plan, self.data_store.as_ref(), self.config.data_store_timeout)
            .await;
        run.lifecycle.advance(QueryStage::Synthesizing);
        let generated = match self.synthesizer.synthesize(&text, &plan).await {
            Ok(generated) => generated,
            Err(e) => {
                run.lifecycle.advance(QueryStage::SynthesisFailed);
                return self.fail(&question, &text, run, e, &plan, None, &all_tables, started).await;
            }
        };
        run.tokens_used += generated.tokens_used;
        if let Some(e) = &generated.recovered {
            run.recover(e);
        }
        let statement = generated.query.statement().to_string();
        run.summary.statement = Some(statement.clone());
        run.summary.query_origin = Some(generated.origin);

        run.lifecycle.advance(QueryStage::Executing);
        let outcome = self.executor.execute(&generated.query).await;
        if let Some(e) = outcome.error {
            run.lifecycle.advance(QueryStage::ExecutionFailed);
            return self
                .fail(&question, &text, run, e, &plan, Some(&statement), &all_tables, started)
                .await;
        }
        run.summary.row_count = outcome.rows.len();

        run.lifecycle.advance(QueryStage::Composing);
        let composed = self
            .composer
            .compose(&text, &outcome.rows, &snippet_texts, AnswerPath::Data)
            .await;
        run.tokens_used += composed.tokens_used;
        if let Some(e) = &composed.recovered {
            run.recover(e);
        }
        run.lifecycle.advance(QueryStage::Done);
        self.finish(&question, run, composed.text, true, started).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn fail(
        &self,
        question: &Question,
        text: &str,
        mut run: PipelineRun,
        error: QueryError,
        plan: &QueryPlan,
        statement: Option<&str>,
        all_tables: &[String],
        started: Instant,
    ) -> Answer {
        warn!("Question failed: {}", error);
        let suggestion = self
            .fallback
            .analyze(text, &error, plan, statement, all_tables)
            .await;
        run.tokens_used += suggestion.tokens_used;
        run.recover(&error);
        run.lifecycle.advance(QueryStage::FallbackAnalyzed);

        let answer = format!(
            "I could not find the requested information. {}",
            suggestion.advisory_text()
        );
        run.summary.suggestion = Some(suggestion);
        run.lifecycle.advance(QueryStage::DoneWithError);
        self.finish(question, run, answer, false, started).await
    }

    /// Record metrics, cache and history for a finished question.
    async fn finish(
        &self,
        question: &Question,
        mut run: PipelineRun,
        answer: String,
        success: bool,
        started: Instant,
    ) -> Answer {
        let response_time = started.elapsed().as_secs_f64();
        run.summary.stages = run.lifecycle.stages().to_vec();

        let intent_label = run.summary.intent.map_or("NONE", |i| i.as_str());
        let outcome = match (success, run.cached) {
            (_, true) => "cached",
            (true, false) => "success",
            (false, false) => "failure",
        };
        metrics::inc_query(intent_label, outcome);
        metrics::observe_query_duration(response_time);
        metrics::add_tokens(run.tokens_used);
        if run.cached {
            metrics::inc_cache_hit();
        }
        for kind in &run.summary.recovered {
            metrics::inc_recovered(kind.as_str());
        }

        let store_in_cache = success && !run.cached && run.cache_eligible;
        let context = serde_json::to_value(&run.summary).unwrap_or_default();
        let text = question.text.trim().to_string();
        let record_history = self.config.history_enabled && !text.is_empty();
        let session_id = question
            .session_id
            .clone()
            .unwrap_or_else(|| ANONYMOUS_SESSION.to_string());
        let requester = question.requester.clone();
        let knowledge_documents = run.summary.knowledge_documents.clone();
        let statements: Vec<String> = run.summary.statement.iter().cloned().collect();
        let response = answer.clone();
        let tokens_used = run.tokens_used;
        let cached = run.cached;

        let persisted = self
            .db
            .run_blocking(move |db| {
                if let Err(e) = db.metrics.record_outcome(success, response_time, tokens_used, cached) {
                    warn!("Failed to record metrics: {}", e);
                }
                if store_in_cache {
                    if let Err(e) = db.cache.store(&text, &response, &context) {
                        warn!("Failed to cache answer: {}", e);
                    }
                }
                if record_history {
                    db.history.append(ChatParams {
                        session_id: &session_id,
                        requester_id: requester.as_ref().map(|r| r.id.as_str()),
                        requester_role: requester.as_ref().and_then(|r| r.role.as_deref()),
                        query: &text,
                        response: &response,
                        context_used: &knowledge_documents,
                        sql_queries: &statements,
                        tokens_used,
                        response_time,
                        success,
                    })?;
                }
                Ok(())
            })
            .await;
        if let Err(e) = persisted {
            warn!("Failed to record chat history: {}", e);
        }

        info!(
            "Answered in {:.2}s (success={}, cached={}, tokens={})",
            response_time, success, run.cached, run.tokens_used
        );
        Answer {
            answer,
            success,
            tokens_used: run.tokens_used,
            response_time_seconds: response_time,
            cached: run.cached,
            sources_summary: run.summary,
        }
    }
}

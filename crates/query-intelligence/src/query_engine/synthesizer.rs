//! Completion-backed statement generation with mandatory post-validation
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::planner::QueryPlan;
use super::sql_guard::{GuardedQuery, SqlGuard};
use crate::config::Config;
use crate::error::{with_deadline, QueryError, QueryErrorKind};
use crate::providers::{CompletionProvider, CompletionRequest};

const SYSTEM_PROMPT: &str = "You write SQLite queries for a school management database. \
Reply with exactly one read-only SELECT statement and nothing else.";

#[derive(Debug, Clone)]
pub struct SynthesizerConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub row_cap: usize,
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.1,
            max_tokens: 512,
            timeout: Duration::from_secs(30),
            row_cap: 100,
        }
    }
}

impl From<&Config> for SynthesizerConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.completion_timeout(),
            row_cap: config.row_cap,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOrigin {
    Model,
    /// Model output with its table reference repaired.
    ModelRewritten,
    TemplateAfterTimeout,
    TemplateAfterProviderError,
    TemplateAfterRejection,
}

#[derive(Debug, Clone)]
pub struct GeneratedQuery {
    pub query: GuardedQuery,
    pub origin: QueryOrigin,
    pub tokens_used: u32,
    /// Failure that was absorbed by falling back to a template.
    pub recovered: Option<QueryError>,
}

pub struct QuerySynthesizer {
    provider: Arc<dyn CompletionProvider>,
    config: SynthesizerConfig,
}

impl QuerySynthesizer {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: SynthesizerConfig) -> Self {
        Self { provider, config }
    }

    /// Prompt naming only the plan's tables and their columns.
    pub fn build_prompt(&self, question: &str, plan: &QueryPlan) -> CompletionRequest {
        let primary = plan.primary_table.as_deref().unwrap_or_default();
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Question: {}", question);
        let _ = writeln!(prompt, "Intent: {}", plan.intent);
        let _ = writeln!(prompt, "Target table: {} (use exactly this table name)", primary);
        let _ = writeln!(prompt, "\nTables you may use:");
        for table in &plan.candidate_tables {
            match plan.columns_of(table) {
                Some(columns) => {
                    let described: Vec<String> = columns
                        .iter()
                        .map(|c| format!("{} {}", c.name, c.data_type))
                        .collect();
                    let _ = writeln!(prompt, "- {}({})", table, described.join(", "));
                }
                None => {
                    let _ = writeln!(prompt, "- {}", table);
                }
            }
        }
        let _ = writeln!(prompt, "\nRules:");
        let _ = writeln!(prompt, "- Use only the tables listed above; the main table is {}.", primary);
        let _ = writeln!(prompt, "- Only SELECT; never modify data.");
        let _ = writeln!(
            prompt,
            "- Skip soft-deleted rows with (deleted = FALSE OR deleted IS NULL) when a table has a deleted column."
        );
        let _ = writeln!(prompt, "- Return at most {} rows.", self.config.row_cap);
        let _ = writeln!(prompt, "- For counting questions use COUNT(*) AS count.");
        let _ = write!(prompt, "\nSQL:");

        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Produce an executable statement for the plan.
    ///
    /// Fails only when the plan has no primary table; every provider failure
    /// or unusable model output falls back to the safe template.
    pub async fn synthesize(&self, question: &str, plan: &QueryPlan) -> Result<GeneratedQuery, QueryError> {
        let guard = SqlGuard::for_plan(plan, self.config.row_cap).ok_or_else(|| {
            QueryError::new(QueryErrorKind::SynthesisFailed, "no table to query for this question")
        })?;

        let request = self.build_prompt(question, plan);
        let completion = with_deadline(
            "query synthesis",
            self.config.timeout,
            QueryErrorKind::CompletionProviderError,
            self.provider.complete(&request),
        )
        .await;

        let generated = match completion {
            Ok(completion) => match guard.admit(&completion.text) {
                Ok(admitted) => GeneratedQuery {
                    origin: if admitted.rewritten {
                        QueryOrigin::ModelRewritten
                    } else {
                        QueryOrigin::Model
                    },
                    query: admitted.query,
                    tokens_used: completion.tokens_used,
                    recovered: None,
                },
                Err(rejection) => {
                    warn!("Discarding generated statement: {}", rejection);
                    GeneratedQuery {
                        query: guard.template(plan.intent),
                        origin: QueryOrigin::TemplateAfterRejection,
                        tokens_used: completion.tokens_used,
                        recovered: Some(QueryError::new(
                            QueryErrorKind::SynthesisFailed,
                            rejection.to_string(),
                        )),
                    }
                }
            },
            Err(e) => {
                warn!("Query synthesis failed, using template: {}", e);
                GeneratedQuery {
                    query: guard.template(plan.intent),
                    origin: if e.kind == QueryErrorKind::CompletionProviderTimeout {
                        QueryOrigin::TemplateAfterTimeout
                    } else {
                        QueryOrigin::TemplateAfterProviderError
                    },
                    tokens_used: 0,
                    recovered: Some(e),
                }
            }
        };

        info!("Synthesized ({:?}): {}", generated.origin, generated.query.statement());
        Ok(generated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EntityCatalog, EntityMap};
    use crate::query_engine::classifier::Intent;
    use crate::query_engine::planner::QueryPlanner;
    use crate::test_support::MockCompletion;

    fn plan_for(question: &str, intent: Intent, tables: &[&str]) -> QueryPlan {
        let all: Vec<String> = tables.iter().map(|s| s.to_string()).collect();
        QueryPlanner::new(Arc::new(EntityCatalog::new(EntityMap::default()))).plan(question, intent, &all)
    }

    fn synthesizer(provider: Arc<MockCompletion>) -> QuerySynthesizer {
        QuerySynthesizer::new(
            provider,
            SynthesizerConfig {
                timeout: Duration::from_millis(100),
                ..SynthesizerConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_model_statement_is_guarded() {
        let provider = Arc::new(
            MockCompletion::new().then_reply("```sql\nSELECT COUNT(*) AS count FROM teacher_profiles;\n```"),
        );
        let plan = plan_for("How many teachers are there?", Intent::Count, &["teacher_profiles"]);
        let generated = synthesizer(Arc::clone(&provider)).synthesize("How many teachers are there?", &plan).await.unwrap();

        assert_eq!(generated.origin, QueryOrigin::Model);
        assert_eq!(
            generated.query.statement(),
            "SELECT COUNT(*) AS count FROM teacher_profiles WHERE (deleted = FALSE OR deleted IS NULL) LIMIT 100"
        );
        assert_eq!(generated.tokens_used, 10);
        assert!(generated.recovered.is_none());

        let request = &provider.requests()[0];
        assert_eq!(request.temperature, 0.1);
        assert_eq!(request.max_tokens, 512);
        assert!(request.prompt.contains("Target table: teacher_profiles"));
        assert!(!request.prompt.contains("auth_user"));
    }

    #[tokio::test]
    async fn test_invented_table_is_rewritten_to_primary() {
        let provider = Arc::new(MockCompletion::new().then_reply("SELECT COUNT(*) FROM teachers_teacher"));
        let plan = plan_for("How many teachers?", Intent::Count, &["auth_user", "teacher_profiles"]);
        let generated = synthesizer(provider).synthesize("How many teachers?", &plan).await.unwrap();

        assert_eq!(generated.origin, QueryOrigin::ModelRewritten);
        assert!(generated.query.statement().starts_with("SELECT COUNT(*) FROM teacher_profiles"));
        assert!(!generated.query.statement().contains("teachers_teacher"));
    }

    #[tokio::test]
    async fn test_mutating_output_falls_back_to_template() {
        let provider = Arc::new(MockCompletion::new().then_reply("DELETE FROM teacher_profiles"));
        let plan = plan_for("Show teachers", Intent::List, &["teacher_profiles"]);
        let generated = synthesizer(provider).synthesize("Show teachers", &plan).await.unwrap();

        assert_eq!(generated.origin, QueryOrigin::TemplateAfterRejection);
        assert_eq!(
            generated.query.statement(),
            "SELECT * FROM teacher_profiles WHERE (deleted = FALSE OR deleted IS NULL) LIMIT 100"
        );
        assert_eq!(generated.recovered.map(|e| e.kind), Some(QueryErrorKind::SynthesisFailed));
    }

    #[tokio::test]
    async fn test_timeout_falls_back_to_template() {
        let provider = Arc::new(MockCompletion::new().then_hang());
        let plan = plan_for("Show teachers", Intent::List, &["teacher_profiles"]);
        let generated = synthesizer(provider).synthesize("Show teachers", &plan).await.unwrap();

        assert_eq!(generated.origin, QueryOrigin::TemplateAfterTimeout);
        assert!(generated.query.statement().starts_with("SELECT * FROM teacher_profiles"));
        assert!(generated.query.statement().ends_with("LIMIT 100"));
        assert_eq!(
            generated.recovered.map(|e| e.kind),
            Some(QueryErrorKind::CompletionProviderTimeout)
        );
    }

    #[tokio::test]
    async fn test_provider_error_falls_back_to_count_template() {
        let provider = Arc::new(MockCompletion::new().then_fail("502 bad gateway"));
        let plan = plan_for("How many students?", Intent::Count, &["students"]);
        let generated = synthesizer(provider).synthesize("How many students?", &plan).await.unwrap();

        assert_eq!(generated.origin, QueryOrigin::TemplateAfterProviderError);
        assert!(generated.query.statement().starts_with("SELECT COUNT(*) AS count FROM students"));
    }

    #[tokio::test]
    async fn test_no_primary_table_is_a_synthesis_failure() {
        let provider = Arc::new(MockCompletion::new());
        let plan = plan_for("How many vehicles?", Intent::Count, &["students"]);
        let err = synthesizer(Arc::clone(&provider)).synthesize("How many vehicles?", &plan).await.unwrap_err();

        assert_eq!(err.kind, QueryErrorKind::SynthesisFailed);
        assert_eq!(provider.calls(), 0);
    }
}

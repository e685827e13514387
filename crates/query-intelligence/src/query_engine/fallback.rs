//! Advisory diagnosis for failed data queries
//!
//! The analyzer is consulted once per failed question. Its suggestion is
//! returned to the caller; nothing here triggers another attempt.
use serde::Serialize;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::planner::QueryPlan;
use super::sql_guard::referenced_tables;
use crate::error::{with_deadline, QueryError, QueryErrorKind};
use crate::providers::{CompletionProvider, CompletionRequest};
use crate::utils::TextUtils;

pub const DEFAULT_ADVICE: &str = "Try rephrasing or ask about specific tables that exist.";

const SYSTEM_PROMPT: &str = "You are a query analysis assistant. Analyze why a database query failed \
and suggest alternatives.

COMMON ISSUES:
1. Table doesn't exist - suggest a similar table
2. Column doesn't exist - suggest a similar column
3. No data available - suggest where the data might be stored
4. Query too complex - suggest a simpler question

Reply with exactly these lines:
DIAGNOSIS: <one sentence>
ALTERNATIVE_TABLE: <table name or NONE>
REPHRASED: <a simpler question or NONE>";

const MAX_DIAGNOSIS_CHARS: usize = 400;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Suggestion {
    pub diagnosis: String,
    pub alternate_table: Option<String>,
    pub rephrased_question: Option<String>,
    #[serde(skip)]
    pub tokens_used: u32,
}

impl Suggestion {
    /// Text shown to the user; never empty.
    pub fn advisory_text(&self) -> String {
        let mut text = String::new();
        if !self.diagnosis.is_empty() {
            text.push_str(&self.diagnosis);
        }
        if let Some(table) = &self.alternate_table {
            let _ = write!(text, " You might try the {} table.", table);
        }
        if let Some(question) = &self.rephrased_question {
            let _ = write!(text, " Try asking: \"{}\"", question);
        }
        if self.alternate_table.is_none() && self.rephrased_question.is_none() {
            let _ = write!(text, " {}", DEFAULT_ADVICE);
        }
        text.trim().to_string()
    }
}

fn parse_field(reply: &str, key: &str) -> Option<String> {
    reply.lines().find_map(|line| {
        let line = line.trim().trim_start_matches(['-', '*', ' ']);
        let (head, value) = line.split_once(':')?;
        if !head.trim_matches('*').trim().eq_ignore_ascii_case(key) {
            return None;
        }
        let value = value.trim().trim_matches(['*', '`', '"']).trim();
        match value.to_ascii_lowercase().as_str() {
            "" | "none" | "n/a" | "null" => None,
            _ => Some(value.to_string()),
        }
    })
}

pub struct FallbackAnalyzer {
    provider: Arc<dyn CompletionProvider>,
    timeout: Duration,
}

impl FallbackAnalyzer {
    pub fn new(provider: Arc<dyn CompletionProvider>, timeout: Duration) -> Self {
        Self { provider, timeout }
    }

    pub fn build_prompt(
        &self,
        question: &str,
        failure: &QueryError,
        statement: Option<&str>,
        all_tables: &[String],
    ) -> CompletionRequest {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Original question: {}", question);
        let _ = writeln!(prompt, "Failure: {}", failure);
        if let Some(statement) = statement {
            let _ = writeln!(prompt, "Statement: {}", statement);
        }
        if !all_tables.is_empty() {
            let _ = writeln!(prompt, "Existing tables: {}", all_tables.join(", "));
        }
        let _ = write!(prompt, "\nAnalyze the issue and suggest alternatives.");

        CompletionRequest {
            system: SYSTEM_PROMPT.to_string(),
            prompt,
            max_tokens: 512,
            temperature: 0.3,
        }
    }

    /// Diagnose a failed query. Provider failures yield a generic suggestion.
    pub async fn analyze(
        &self,
        question: &str,
        failure: &QueryError,
        plan: &QueryPlan,
        statement: Option<&str>,
        all_tables: &[String],
    ) -> Suggestion {
        let request = self.build_prompt(question, failure, statement, all_tables);
        let reply = with_deadline(
            "failure analysis",
            self.timeout,
            QueryErrorKind::CompletionProviderError,
            self.provider.complete(&request),
        )
        .await;

        let used: Vec<String> = statement
            .map(|s| referenced_tables(s).into_iter().map(|(_, t)| t).collect())
            .unwrap_or_default();
        let unused_candidate = || {
            plan.candidate_tables
                .iter()
                .find(|t| {
                    Some(t.as_str()) != plan.primary_table.as_deref()
                        && !used.iter().any(|u| u.eq_ignore_ascii_case(t))
                })
                .cloned()
        };

        match reply {
            Ok(completion) => {
                let text = completion.text.trim();
                let diagnosis = parse_field(text, "DIAGNOSIS").unwrap_or_else(|| {
                    TextUtils::truncate_with_ellipsis(&TextUtils::normalize_whitespace(text), MAX_DIAGNOSIS_CHARS)
                        .into_owned()
                });
                let alternate_table = parse_field(text, "ALTERNATIVE_TABLE")
                    .and_then(|name| {
                        let found = all_tables.iter().find(|t| t.eq_ignore_ascii_case(&name)).cloned();
                        if found.is_none() {
                            debug!("Ignoring suggested table {} which does not exist", name);
                        }
                        found
                    })
                    .filter(|t| !used.iter().any(|u| u.eq_ignore_ascii_case(t)))
                    .or_else(unused_candidate);

                Suggestion {
                    diagnosis: TextUtils::truncate_with_ellipsis(&diagnosis, MAX_DIAGNOSIS_CHARS).into_owned(),
                    alternate_table,
                    rephrased_question: parse_field(text, "REPHRASED"),
                    tokens_used: completion.tokens_used,
                }
            }
            Err(e) => {
                warn!("Failure analysis unavailable: {}", e);
                Suggestion {
                    diagnosis: format!("The query could not be completed ({}).", failure.kind),
                    alternate_table: unused_candidate(),
                    rephrased_question: None,
                    tokens_used: 0,
                }
            }
        }
    }
}

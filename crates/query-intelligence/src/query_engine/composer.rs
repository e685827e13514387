//! Final natural-language answers from rows and knowledge snippets
use serde_json::Value;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{with_deadline, QueryError, QueryErrorKind};
use crate::providers::{CompletionProvider, CompletionRequest, RetrievedRow};
use crate::utils::TextUtils;

pub const NO_DATA_MESSAGE: &str = "I could not find any matching records for your question.";

pub const CAPABILITY_MESSAGE: &str = "I can answer questions about the school's records: \
counts and lists of teachers, students, classes and subjects, attendance, exams, fees, \
transport and leave. Try asking \"How many teachers are there?\" or \"List all classes\".";

pub(crate) const DATA_SYSTEM_PROMPT: &str = "You are an assistant for a school management system. \
Answer the question from the database results provided. Be specific with numbers. \
If no data was found, say so clearly and never invent figures.";

pub(crate) const KNOWLEDGE_SYSTEM_PROMPT: &str = "You are an assistant for a school management system. \
You can explain what data the system holds and how it is organised, and help users phrase \
questions about teachers, students, classes, subjects, attendance, exams, fees and transport. \
Use the reference notes when they are relevant. Keep answers short and friendly.";

const VALUE_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct ComposerConfig {
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout: Duration,
    pub snippet_chars: usize,
    pub max_snippets: usize,
    pub preview_rows: usize,
}

impl Default for ComposerConfig {
    fn default() -> Self {
        Self {
            temperature: 0.3,
            max_tokens: 2048,
            timeout: Duration::from_secs(30),
            snippet_chars: 300,
            max_snippets: 3,
            preview_rows: 10,
        }
    }
}

impl From<&Config> for ComposerConfig {
    fn from(config: &Config) -> Self {
        Self {
            timeout: config.completion_timeout(),
            max_snippets: config.knowledge_top_k.clamp(1, 3),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerPath {
    /// Rows came from an executed statement (possibly none).
    Data,
    /// Nothing was queried; answer from knowledge snippets.
    Knowledge,
}

#[derive(Debug, Clone)]
pub struct ComposedAnswer {
    pub text: String,
    pub tokens_used: u32,
    pub recovered: Option<QueryError>,
}

/// The value of a one-row, one-column numeric result.
pub fn single_count(rows: &[RetrievedRow]) -> Option<String> {
    let [row] = rows else {
        return None;
    };
    if row.len() != 1 {
        return None;
    }
    match row.iter().next() {
        Some((_, Value::Number(n))) => Some(n.to_string()),
        _ => None,
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => TextUtils::truncate_with_ellipsis(s, VALUE_CHARS).into_owned(),
        other => TextUtils::truncate_with_ellipsis(&other.to_string(), VALUE_CHARS).into_owned(),
    }
}

/// Bounded text rendering of `rows` for prompts and templated answers.
pub fn render_rows(rows: &[RetrievedRow], preview_rows: usize) -> String {
    if let Some(count) = single_count(rows) {
        return format!("Count: {}", count);
    }
    let mut out = String::new();
    for (i, row) in rows.iter().take(preview_rows).enumerate() {
        let fields: Vec<String> = row
            .iter()
            .map(|(column, value)| format!("{}: {}", column, render_value(value)))
            .collect();
        let _ = writeln!(out, "{}. {}", i + 1, fields.join(", "));
    }
    if rows.len() > preview_rows {
        let _ = writeln!(out, "... and {} more records", rows.len() - preview_rows);
    }
    out.trim_end().to_string()
}

pub struct ResponseComposer {
    provider: Arc<dyn CompletionProvider>,
    config: ComposerConfig,
}

impl ResponseComposer {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: ComposerConfig) -> Self {
        Self { provider, config }
    }

    pub fn build_prompt(
        &self,
        question: &str,
        rows: &[RetrievedRow],
        snippets: &[String],
        path: AnswerPath,
    ) -> CompletionRequest {
        let mut prompt = String::new();
        let _ = writeln!(prompt, "Question: {}", question);

        if path == AnswerPath::Data {
            if rows.is_empty() {
                let _ = writeln!(
                    prompt,
                    "\nThe database query returned no results. Say plainly that no matching records were found."
                );
            } else {
                let _ = writeln!(prompt, "\nThe database query returned {} results:", rows.len());
                let _ = writeln!(prompt, "{}", render_rows(rows, self.config.preview_rows));
                if let Some(count) = single_count(rows) {
                    let _ = writeln!(prompt, "State the number {} in your answer.", count);
                }
            }
        }

        let notes: Vec<_> = snippets
            .iter()
            .take(self.config.max_snippets)
            .map(|s| TextUtils::truncate_with_ellipsis(s, self.config.snippet_chars))
            .collect();
        if !notes.is_empty() {
            let _ = writeln!(prompt, "\nReference notes:");
            for note in notes {
                let _ = writeln!(prompt, "- {}", note);
            }
        }
        let _ = write!(prompt, "\nAnswer:");

        CompletionRequest {
            system: match path {
                AnswerPath::Data => DATA_SYSTEM_PROMPT,
                AnswerPath::Knowledge => KNOWLEDGE_SYSTEM_PROMPT,
            }
            .to_string(),
            prompt,
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Templated answer built from raw rows without a completion call.
    pub fn fallback_text(&self, rows: &[RetrievedRow], path: AnswerPath) -> String {
        match path {
            AnswerPath::Data if rows.is_empty() => NO_DATA_MESSAGE.to_string(),
            AnswerPath::Data => format!(
                "Data retrieved: {} rows found.\n\n{}",
                rows.len(),
                render_rows(rows, self.config.preview_rows)
            ),
            AnswerPath::Knowledge => CAPABILITY_MESSAGE.to_string(),
        }
    }

    pub async fn compose(
        &self,
        question: &str,
        rows: &[RetrievedRow],
        snippets: &[String],
        path: AnswerPath,
    ) -> ComposedAnswer {
        let request = self.build_prompt(question, rows, snippets, path);
        let result = with_deadline(
            "answer composition",
            self.config.timeout,
            QueryErrorKind::CompletionProviderError,
            self.provider.complete(&request),
        )
        .await;

        match result {
            Ok(completion) if !completion.text.trim().is_empty() => {
                let mut text = completion.text.trim().to_string();
                if path == AnswerPath::Data {
                    if let Some(count) = single_count(rows) {
                        if !TextUtils::contains_phrase(&text, &count) {
                            debug!("Answer omitted the count; appending it");
                            let _ = write!(text, " The result is {}.", count);
                        }
                    }
                }
                ComposedAnswer {
                    text,
                    tokens_used: completion.tokens_used,
                    recovered: None,
                }
            }
            Ok(completion) => ComposedAnswer {
                text: self.fallback_text(rows, path),
                tokens_used: completion.tokens_used,
                recovered: Some(QueryError::new(
                    QueryErrorKind::CompletionProviderError,
                    "empty completion",
                )),
            },
            Err(e) => {
                warn!("Answer composition failed, using template: {}", e);
                ComposedAnswer {
                    text: self.fallback_text(rows, path),
                    tokens_used: 0,
                    recovered: Some(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{row, MockCompletion};
    use serde_json::json;

    fn composer(provider: Arc<MockCompletion>) -> ResponseComposer {
        ResponseComposer::new(
            provider,
            ComposerConfig {
                timeout: Duration::from_millis(100),
                ..ComposerConfig::default()
            },
        )
    }

    fn count_rows(n: i64) -> Vec<RetrievedRow> {
        vec![row(&[("count", json!(n))])]
    }

    // ===== Rendering =====

    #[test]
    fn test_render_single_count() {
        assert_eq!(single_count(&count_rows(7)).as_deref(), Some("7"));
        assert_eq!(render_rows(&count_rows(7), 10), "Count: 7");
        assert!(single_count(&[row(&[("name", json!("Ada"))])]).is_none());
    }

    #[test]
    fn test_render_large_result_is_bounded() {
        let rows: Vec<_> = (1..=12)
            .map(|i| row(&[("id", json!(i)), ("full_name", json!(format!("Teacher {}", i)))]))
            .collect();
        let text = render_rows(&rows, 10);
        assert!(text.starts_with("1. id: 1, full_name: Teacher 1"));
        assert!(text.contains("10. id: 10"));
        assert!(!text.contains("11. id"));
        assert!(text.ends_with("... and 2 more records"));
    }

    #[test]
    fn test_long_values_are_truncated() {
        let long = "x".repeat(500);
        let text = render_rows(&[row(&[("a", json!(1)), ("notes", json!(long))])], 10);
        assert!(text.len() < 200);
    }

    // ===== Composition =====

    #[tokio::test]
    async fn test_count_is_appended_when_missing() {
        let provider = Arc::new(MockCompletion::new().then_reply("There are several teachers."));
        let answer = composer(Arc::clone(&provider))
            .compose("How many teachers are there?", &count_rows(3), &[], AnswerPath::Data)
            .await;
        assert_eq!(answer.text, "There are several teachers. The result is 3.");
        assert_eq!(answer.tokens_used, 10);

        let request = &provider.requests()[0];
        assert!(request.prompt.contains("Count: 3"));
        assert_eq!(request.temperature, 0.3);
        assert_eq!(request.max_tokens, 2048);
    }

    #[tokio::test]
    async fn test_count_not_duplicated() {
        let provider = Arc::new(MockCompletion::new().then_reply("There are 3 teachers."));
        let answer = composer(provider)
            .compose("How many teachers?", &count_rows(3), &[], AnswerPath::Data)
            .await;
        assert_eq!(answer.text, "There are 3 teachers.");
    }

    #[tokio::test]
    async fn test_count_inside_other_number_is_still_appended() {
        let provider = Arc::new(MockCompletion::new().then_reply("There are 13 teachers."));
        let answer = composer(provider)
            .compose("How many teachers?", &count_rows(3), &[], AnswerPath::Data)
            .await;
        assert_eq!(answer.text, "There are 13 teachers. The result is 3.");

        let provider = Arc::new(MockCompletion::new().then_reply("Teachers: 3."));
        let answer = composer(provider)
            .compose("How many teachers?", &count_rows(3), &[], AnswerPath::Data)
            .await;
        assert_eq!(answer.text, "Teachers: 3.");
    }

    #[tokio::test]
    async fn test_timeout_uses_row_template() {
        let provider = Arc::new(MockCompletion::new().then_hang());
        let rows = vec![row(&[("full_name", json!("Ada"))]), row(&[("full_name", json!("Grace"))])];
        let answer = composer(provider).compose("List teachers", &rows, &[], AnswerPath::Data).await;

        assert!(answer.text.starts_with("Data retrieved: 2 rows found."));
        assert!(answer.text.contains("Grace"));
        assert_eq!(
            answer.recovered.map(|e| e.kind),
            Some(QueryErrorKind::CompletionProviderTimeout)
        );
    }

    #[tokio::test]
    async fn test_provider_error_without_rows_says_no_data() {
        let provider = Arc::new(MockCompletion::new().then_fail("503"));
        let answer = composer(provider).compose("List vehicles", &[], &[], AnswerPath::Data).await;
        assert_eq!(answer.text, NO_DATA_MESSAGE);
    }

    #[tokio::test]
    async fn test_knowledge_path_uses_snippets() {
        let provider = Arc::new(MockCompletion::new().then_reply("Hi! I can help with school data."));
        let snippets = vec!["a".repeat(1000), "second".to_string(), "third".to_string(), "fourth".to_string()];
        let answer = composer(Arc::clone(&provider))
            .compose("Hello, what can you do?", &[], &snippets, AnswerPath::Knowledge)
            .await;
        assert_eq!(answer.text, "Hi! I can help with school data.");

        let request = &provider.requests()[0];
        assert!(request.system.contains("school management system"));
        assert!(request.prompt.contains("- third"));
        assert!(!request.prompt.contains("fourth"));
        assert!(!request.prompt.contains(&"a".repeat(400)));
    }

    #[tokio::test]
    async fn test_knowledge_fallback_is_capability_message() {
        let provider = Arc::new(MockCompletion::new().then_fail("down"));
        let answer = composer(provider)
            .compose("Hello", &[], &[], AnswerPath::Knowledge)
            .await;
        assert_eq!(answer.text, CAPABILITY_MESSAGE);
    }
}

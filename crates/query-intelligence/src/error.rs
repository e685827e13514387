//! Error taxonomy for the question-answering pipeline
//!
//! Internal code propagates `anyhow::Error`; the kinds below are what the
//! orchestrator records when it recovers from a failure.

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryErrorKind {
    ClassificationAmbiguous,
    EntityNotResolved,
    SynthesisFailed,
    ExecutionFailed,
    CompletionProviderTimeout,
    CompletionProviderError,
}

impl QueryErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClassificationAmbiguous => "classification_ambiguous",
            Self::EntityNotResolved => "entity_not_resolved",
            Self::SynthesisFailed => "synthesis_failed",
            Self::ExecutionFailed => "execution_failed",
            Self::CompletionProviderTimeout => "completion_provider_timeout",
            Self::CompletionProviderError => "completion_provider_error",
        }
    }

    /// Provider failures that a caller recovers from with a templated result.
    pub fn is_provider_failure(&self) -> bool {
        matches!(self, Self::CompletionProviderTimeout | Self::CompletionProviderError)
    }
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub message: String,
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Recover the kind from an `anyhow::Error`, treating anything foreign as `fallback`.
    pub fn from_anyhow(err: &anyhow::Error, fallback: QueryErrorKind) -> Self {
        match err.downcast_ref::<QueryError>() {
            Some(query_err) => query_err.clone(),
            None => Self::new(fallback, err.to_string()),
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for QueryError {}

/// Await an external call under a deadline.
///
/// An elapsed deadline becomes `CompletionProviderTimeout`; an error from the
/// call itself becomes `on_error`.
pub async fn with_deadline<T, F>(
    what: &str,
    deadline: Duration,
    on_error: QueryErrorKind,
    fut: F,
) -> Result<T, QueryError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(QueryError::from_anyhow(&e, on_error)),
        Err(_) => Err(QueryError::new(
            QueryErrorKind::CompletionProviderTimeout,
            format!("{} timed out after {:.1}s", what, deadline.as_secs_f64()),
        )),
    }
}

/// [`with_deadline`] for data-store calls: timeouts and failures alike are `ExecutionFailed`.
pub async fn with_store_deadline<T, F>(what: &str, deadline: Duration, fut: F) -> Result<T, QueryError>
where
    F: Future<Output = anyhow::Result<T>>,
{
    with_deadline(what, deadline, QueryErrorKind::ExecutionFailed, fut)
        .await
        .map_err(|e| QueryError::new(QueryErrorKind::ExecutionFailed, e.message))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_display_matches_serde_name() {
        let kind = QueryErrorKind::ExecutionFailed;
        let json = serde_json::to_string(&kind).unwrap();
        assert_eq!(json, format!("\"{}\"", kind));
    }

    #[test]
    fn test_from_anyhow_keeps_query_error_kind() {
        let err: anyhow::Error = QueryError::new(QueryErrorKind::SynthesisFailed, "bad sql").into();
        let recovered = QueryError::from_anyhow(&err, QueryErrorKind::CompletionProviderError);
        assert_eq!(recovered.kind, QueryErrorKind::SynthesisFailed);
        assert_eq!(recovered.message, "bad sql");
    }

    #[test]
    fn test_from_anyhow_uses_fallback_for_foreign_errors() {
        let err = anyhow::anyhow!("connection refused");
        let recovered = QueryError::from_anyhow(&err, QueryErrorKind::ExecutionFailed);
        assert_eq!(recovered.kind, QueryErrorKind::ExecutionFailed);
        assert!(recovered.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_with_deadline_times_out() {
        let result: Result<(), QueryError> = with_deadline(
            "slow call",
            Duration::from_millis(10),
            QueryErrorKind::CompletionProviderError,
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;
        let err = result.unwrap_err();
        assert_eq!(err.kind, QueryErrorKind::CompletionProviderTimeout);
        assert!(err.message.contains("slow call"));
    }

    #[tokio::test]
    async fn test_store_deadline_reports_execution_failure() {
        let result: Result<(), QueryError> = with_store_deadline("table listing", Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result.unwrap_err().kind, QueryErrorKind::ExecutionFailed);
    }

    #[tokio::test]
    async fn test_with_deadline_maps_errors() {
        let result: Result<u32, QueryError> = with_deadline(
            "failing call",
            Duration::from_secs(1),
            QueryErrorKind::CompletionProviderError,
            async { Err(anyhow::anyhow!("503 upstream")) },
        )
        .await;
        assert_eq!(result.unwrap_err().kind, QueryErrorKind::CompletionProviderError);
    }
}

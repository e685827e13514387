//! Guarded statement execution against the data store
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::sql_guard::{validate_read_only, GuardedQuery};
use crate::error::{with_store_deadline, QueryError, QueryErrorKind};
use crate::providers::{DataStore, RetrievedRow};

#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub rows: Vec<RetrievedRow>,
    pub error: Option<QueryError>,
}

impl ExecutionOutcome {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            rows: Vec::new(),
            error: Some(QueryError::new(QueryErrorKind::ExecutionFailed, message)),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

pub struct QueryExecutor {
    store: Arc<dyn DataStore>,
    row_cap: usize,
    timeout: Duration,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn DataStore>, row_cap: usize, timeout: Duration) -> Self {
        Self { store, row_cap, timeout }
    }

    /// Run `query`; failures are reported in the outcome, never raised.
    pub async fn execute(&self, query: &GuardedQuery) -> ExecutionOutcome {
        let statement = query.statement();
        if let Err(rejection) = validate_read_only(statement) {
            warn!("Refusing to execute statement: {}", rejection);
            return ExecutionOutcome::failed(rejection.to_string());
        }

        let result = with_store_deadline(
            "query execution",
            self.timeout,
            self.store.run_read_only_query(statement, self.row_cap),
        )
        .await;

        match result {
            Ok(mut rows) => {
                rows.truncate(self.row_cap);
                debug!("Query returned {} rows", rows.len());
                ExecutionOutcome { rows, error: None }
            }
            Err(e) => {
                warn!("Query execution failed: {}", e);
                ExecutionOutcome::failed(e.message)
            }
        }
    }
}

//! Question + intent -> execution plan
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::classifier::Intent;
use crate::catalog::EntityCatalog;
use crate::error::with_store_deadline;
use crate::providers::{ColumnInfo, DataStore};
use crate::utils::content_words;

const MAX_CANDIDATES: usize = 3;
const MAX_DESCRIBED_TABLES: usize = 2;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub intent: Intent,
    pub entity: Option<String>,
    /// Most likely first; `primary_table` is always the first element.
    pub candidate_tables: Vec<String>,
    pub primary_table: Option<String>,
    pub needs_synthesized_query: bool,
    pub needs_knowledge_search: bool,
    pub steps: Vec<String>,
    pub table_columns: BTreeMap<String, Vec<ColumnInfo>>,
    pub has_soft_delete: BTreeMap<String, bool>,
}

impl QueryPlan {
    fn new(intent: Intent, entity: Option<String>, candidate_tables: Vec<String>) -> Self {
        let primary_table = candidate_tables.first().cloned();
        let has_tables = !candidate_tables.is_empty();
        let mut plan = Self {
            intent,
            entity,
            candidate_tables,
            primary_table,
            needs_synthesized_query: has_tables && intent.is_data_query(),
            needs_knowledge_search: !has_tables
                || matches!(intent, Intent::Conversational | Intent::Procedural),
            steps: Vec::new(),
            table_columns: BTreeMap::new(),
            has_soft_delete: BTreeMap::new(),
        };
        plan.steps = plan.describe_steps();
        plan
    }

    fn describe_steps(&self) -> Vec<String> {
        let mut steps = Vec::new();
        if let (Some(table), true) = (&self.primary_table, self.needs_synthesized_query) {
            steps.push(format!(
                "Query {} table for {} information",
                table,
                self.entity.as_deref().unwrap_or("requested")
            ));
            steps.push(
                match self.intent {
                    Intent::Count => "Count results and return total",
                    Intent::List => "Format results as a list",
                    Intent::Analytical => "Aggregate and analyze results",
                    _ => "Return matching record details",
                }
                .to_string(),
            );
        }
        if self.needs_knowledge_search {
            steps.push("Search knowledge base for relevant context".to_string());
        }
        steps.push("Generate final response".to_string());
        steps
    }

    pub fn columns_of(&self, table: &str) -> Option<&[ColumnInfo]> {
        self.table_columns.get(table).map(Vec::as_slice)
    }
}

pub struct QueryPlanner {
    catalog: Arc<EntityCatalog>,
}

impl QueryPlanner {
    pub fn new(catalog: Arc<EntityCatalog>) -> Self {
        Self { catalog }
    }

    /// Entity words in the question, in order, without repeats.
    ///
    /// A word counts when the entity vocabulary knows it or when it is
    /// literally one of the table names.
    pub fn extract_entities(&self, question: &str, all_tables: &[String]) -> Vec<String> {
        let mut entities: Vec<String> = Vec::new();
        for word in content_words(question) {
            let entity = self.catalog.canonical_entity(&word).or_else(|| {
                all_tables
                    .iter()
                    .find(|t| t.eq_ignore_ascii_case(&word))
                    .map(|_| word.clone())
            });
            if let Some(entity) = entity {
                if !entities.contains(&entity) {
                    entities.push(entity);
                }
            }
        }
        entities
    }

    /// Build a plan from names alone; no I/O.
    pub fn plan(&self, question: &str, intent: Intent, all_tables: &[String]) -> QueryPlan {
        let entities = self.extract_entities(question, all_tables);
        if entities.is_empty() {
            debug!("No entity mentioned; planning knowledge search only");
            return QueryPlan::new(intent, None, Vec::new());
        }

        let mut resolved = entities
            .iter()
            .filter_map(|e| self.catalog.resolve(e, all_tables).map(|t| (e.clone(), t)));

        let Some((entity, primary)) = resolved.next() else {
            debug!("Entities {:?} did not resolve to any table", entities);
            return QueryPlan::new(intent, entities.first().cloned(), Vec::new());
        };

        let mut candidates = vec![primary];
        for table in self.catalog.direct_candidates(&entity, all_tables) {
            push_unique(&mut candidates, table);
        }
        if let Some((_, related)) = resolved.next() {
            push_unique(&mut candidates, related);
        }
        candidates.truncate(MAX_CANDIDATES);

        debug!("Planned {} for '{}' over {:?}", intent, entity, candidates);
        QueryPlan::new(intent, Some(entity), candidates)
    }

    /// Plan, then describe the leading candidate tables from the data store.
    pub async fn plan_with_schema(
        &self,
        question: &str,
        intent: Intent,
        all_tables: &[String],
        store: &dyn DataStore,
        timeout: Duration,
    ) -> QueryPlan {
        let mut plan = self.plan(question, intent, all_tables);
        self.describe_tables(&mut plan, store, timeout).await;
        plan
    }

    /// Fill in columns and soft-delete flags for the first candidate tables.
    ///
    /// Column lists are memoized in the catalog, so a table is described at
    /// most once per process until the memo is cleared.
    pub async fn describe_tables(&self, plan: &mut QueryPlan, store: &dyn DataStore, timeout: Duration) {
        let described: Vec<String> = plan
            .candidate_tables
            .iter()
            .take(MAX_DESCRIBED_TABLES)
            .cloned()
            .collect();
        for table in described {
            let columns = match self.catalog.known_columns(&table) {
                Some(columns) => columns,
                None => match with_store_deadline("column lookup", timeout, store.get_columns(&table)).await {
                    Ok(columns) => {
                        self.catalog.remember_columns(&table, columns.clone());
                        columns
                    }
                    Err(e) => {
                        warn!("Could not describe {}: {}", table, e);
                        continue;
                    }
                },
            };
            let has_deleted = columns.iter().any(|c| c.name.eq_ignore_ascii_case("deleted"));
            plan.has_soft_delete.insert(table.clone(), has_deleted);
            plan.table_columns.insert(table, columns);
        }
    }
}

fn push_unique(tables: &mut Vec<String>, table: String) {
    if !tables.iter().any(|t| t.eq_ignore_ascii_case(&table)) {
        tables.push(table);
    }
}

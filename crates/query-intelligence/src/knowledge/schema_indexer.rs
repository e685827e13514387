//! Knowledge documents generated from the live schema
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::catalog::EntityCatalog;
use crate::error::with_store_deadline;
use crate::providers::{ColumnInfo, DataStore, ForeignKey};
use crate::query_engine::sql_guard::{SoftDeleteQuery, SOFT_DELETE_PREDICATE};
use crate::rag_db::{DocumentType, SchemaDocument};

const PATTERN_TITLE: &str = "Query patterns and conventions";

pub struct SchemaIndexer<'a> {
    store: &'a dyn DataStore,
    catalog: &'a EntityCatalog,
    timeout: Duration,
    row_cap: usize,
}

impl<'a> SchemaIndexer<'a> {
    pub fn new(store: &'a dyn DataStore, catalog: &'a EntityCatalog, timeout: Duration, row_cap: usize) -> Self {
        Self {
            store,
            catalog,
            timeout,
            row_cap,
        }
    }

    /// One pattern document, then a schema document per table and a
    /// relationship document per foreign key. Embeddings are left empty.
    pub async fn build_documents(&self) -> anyhow::Result<Vec<SchemaDocument>> {
        let tables = with_store_deadline(
            "table listing",
            self.timeout,
            self.store.list_tables(),
        )
        .await?;
        info!("Indexing schema of {} tables", tables.len());

        let mut documents = vec![pattern_document(self.row_cap)];
        for table in &tables {
            let columns = match with_store_deadline(
                "column lookup",
                self.timeout,
                self.store.get_columns(table),
            )
            .await
            {
                Ok(columns) => columns,
                Err(e) => {
                    warn!("Skipping {}: {}", table, e);
                    continue;
                }
            };
            let foreign_keys = with_store_deadline(
                "foreign key lookup",
                self.timeout,
                self.store.foreign_keys(table),
            )
            .await
            .unwrap_or_default();

            self.catalog.remember_columns(table, columns.clone());
            let junction = self.catalog.is_junction(table);
            documents.push(table_document(table, &columns, &foreign_keys, junction, self.row_cap));
            for fk in &foreign_keys {
                documents.push(relationship_document(table, fk));
            }
            debug!("Indexed {} ({} columns, {} relationships)", table, columns.len(), foreign_keys.len());
        }
        Ok(documents)
    }
}

pub fn pattern_document(row_cap: usize) -> SchemaDocument {
    let content = format!(
        "QUERY PATTERNS
Counting: SELECT COUNT(*) AS count FROM table_name WHERE {p}
Counting by group: SELECT category, COUNT(*) AS count FROM table_name WHERE {p} GROUP BY category
Filtering text: WHERE column_name LIKE '%term%'
Filtering dates: WHERE date_column BETWEEN '2024-01-01' AND '2024-12-31'
Aggregation: SELECT AVG(column), SUM(column), MIN(column), MAX(column) FROM table_name WHERE {p}
Sorting: ORDER BY column_name DESC LIMIT {cap}
Soft delete: rows with deleted = TRUE are removed records; always filter with {p}.
Junction tables only link two entities (for example teacher_subjects); count the entity tables instead.
Return at most {cap} rows.",
        p = SOFT_DELETE_PREDICATE,
        cap = row_cap
    );
    SchemaDocument {
        title: PATTERN_TITLE.to_string(),
        content,
        category: "general".to_string(),
        document_type: DocumentType::Pattern,
        table_name: None,
        embedding: Vec::new(),
    }
}

pub fn table_document(
    table: &str,
    columns: &[ColumnInfo],
    foreign_keys: &[ForeignKey],
    junction: bool,
    row_cap: usize,
) -> SchemaDocument {
    let has_deleted = columns.iter().any(|c| c.name.eq_ignore_ascii_case("deleted"));
    let mut content = String::new();
    let _ = writeln!(content, "TABLE: {}", table);
    if junction {
        let _ = writeln!(content, "Links other entities; not an entity table itself.");
    }

    let _ = writeln!(content, "COLUMNS:");
    for column in columns {
        let _ = writeln!(
            content,
            "- {}: {}{}{}",
            column.name,
            column.data_type,
            if column.primary_key { " [PRIMARY KEY]" } else { "" },
            if column.nullable { " [NULLABLE]" } else { " [NOT NULL]" }
        );
    }

    if !foreign_keys.is_empty() {
        let _ = writeln!(content, "RELATIONSHIPS:");
        for fk in foreign_keys {
            let _ = writeln!(
                content,
                "- {} -> {}.{}",
                fk.column, fk.referenced_table, fk.referenced_column
            );
        }
    }

    let count = SoftDeleteQuery::new(format!("SELECT COUNT(*) AS count FROM {}", table))
        .soft_delete(has_deleted)
        .row_cap(row_cap)
        .build();
    let list = SoftDeleteQuery::new(format!("SELECT * FROM {}", table))
        .soft_delete(has_deleted)
        .row_cap(row_cap)
        .build();
    let _ = writeln!(content, "COMMON QUERIES:");
    let _ = writeln!(content, "Count all records: {}", count);
    let _ = writeln!(content, "List records: {}", list);

    SchemaDocument {
        title: format!("Table {}", table),
        content: content.trim_end().to_string(),
        category: EntityCatalog::categorize(table).to_string(),
        document_type: DocumentType::Schema,
        table_name: Some(table.to_string()),
        embedding: Vec::new(),
    }
}

pub fn relationship_document(table: &str, fk: &ForeignKey) -> SchemaDocument {
    let content = format!(
        "{table}.{col} references {rt}.{rc}. Join with: SELECT * FROM {table} JOIN {rt} ON {table}.{col} = {rt}.{rc}",
        table = table,
        col = fk.column,
        rt = fk.referenced_table,
        rc = fk.referenced_column
    );
    SchemaDocument {
        title: format!("{} to {}", table, fk.referenced_table),
        content,
        category: EntityCatalog::categorize(table).to_string(),
        document_type: DocumentType::Relationship,
        table_name: Some(table.to_string()),
        embedding: Vec::new(),
    }
}

//! Persistent knowledge documents with their embedding vectors
use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Row};
use std::sync::Arc;
use tracing::info;

use crate::rag_db::schema::*;

pub struct DocumentStore {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl DocumentStore {
    pub fn new(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    fn get_conn(&self) -> anyhow::Result<r2d2::PooledConnection<SqliteConnectionManager>> {
        self.pool
            .get()
            .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))
    }

    /// Swap the whole document set in one transaction.
    pub fn replace_all(&self, documents: &[SchemaDocument], embedding_model: &str) -> anyhow::Result<usize> {
        let mut conn = self.get_conn()?;
        let now = format_timestamp(&Utc::now());

        let tx = conn.transaction()?;
        tx.execute("DELETE FROM schema_documents", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO schema_documents
                 (title, content, category, document_type, table_name, embedding, embedding_model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for doc in documents {
                let embedding_bytes = bincode::serialize(&doc.embedding)?;
                stmt.execute(params![
                    doc.title,
                    doc.content,
                    doc.category,
                    doc.document_type.as_str(),
                    doc.table_name,
                    embedding_bytes,
                    embedding_model,
                    now,
                ])?;
            }
        }
        tx.commit()?;

        info!("Stored {} schema documents ({})", documents.len(), embedding_model);
        Ok(documents.len())
    }

    pub fn load_all(&self) -> anyhow::Result<Vec<SchemaDocument>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT title, content, category, document_type, table_name, embedding
             FROM schema_documents ORDER BY id",
        )?;
        let docs = stmt
            .query_map([], |row| Self::row_to_document(row))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(docs)
    }

    pub fn counts_by_type(&self) -> anyhow::Result<Vec<(String, i64)>> {
        let conn = self.get_conn()?;
        let mut stmt = conn.prepare(
            "SELECT document_type, COUNT(*) FROM schema_documents
             GROUP BY document_type ORDER BY document_type",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    fn row_to_document(row: &Row) -> rusqlite::Result<SchemaDocument> {
        let document_type: String = row.get(3)?;
        let embedding_bytes: Vec<u8> = row.get(5)?;
        let embedding: Vec<f32> = bincode::deserialize(&embedding_bytes)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, rusqlite::types::Type::Blob, e))?;

        Ok(SchemaDocument {
            title: row.get(0)?,
            content: row.get(1)?,
            category: row.get(2)?,
            document_type: document_type.parse().map_err(|e: anyhow::Error| {
                rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
            })?,
            table_name: row.get(4)?,
            embedding,
        })
    }
}

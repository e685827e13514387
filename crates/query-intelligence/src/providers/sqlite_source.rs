//! Read-only SQLite implementation of [`DataStore`]
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::ValueRef;
use serde_json::Value;
use tracing::{debug, info};

use super::{ColumnInfo, DataStore, ForeignKey, RetrievedRow};

pub struct SqliteDataSource {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl SqliteDataSource {
    /// Open an existing database file without write access.
    pub fn open(db_path: &Path) -> anyhow::Result<Self> {
        info!("Opening data source at: {}", db_path.display());
        if !db_path.exists() {
            return Err(anyhow::anyhow!("Data source not found at: {}", db_path.display()));
        }
        let manager = SqliteConnectionManager::file(db_path).with_flags(
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        );
        let pool = Pool::builder()
            .max_size(8)
            .build(manager)
            .map_err(|e| anyhow::anyhow!("Failed to create data source pool: {}", e))?;
        Ok(Self { pool: Arc::new(pool) })
    }

    pub fn from_pool(pool: Arc<Pool<SqliteConnectionManager>>) -> Self {
        Self { pool }
    }

    async fn with_conn<T, F>(&self, f: F) -> anyhow::Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&rusqlite::Connection) -> anyhow::Result<T> + Send + 'static,
    {
        let pool = Arc::clone(&self.pool);
        tokio::task::spawn_blocking(move || {
            let conn = pool
                .get()
                .map_err(|e| anyhow::anyhow!("Failed to get connection from pool: {}", e))?;
            f(&conn)
        })
        .await
        .map_err(|e| anyhow::anyhow!("Data source task failed: {}", e))?
    }
}

fn to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => Value::String(format!("<{} bytes>", bytes.len())),
    }
}

#[async_trait]
impl DataStore for SqliteDataSource {
    async fn list_tables(&self) -> anyhow::Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let tables = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(tables)
        })
        .await
    }

    async fn get_columns(&self, table: &str) -> anyhow::Result<Vec<ColumnInfo>> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid",
            )?;
            let columns = stmt
                .query_map([&table], |row| {
                    let not_null: i64 = row.get(2)?;
                    let pk: i64 = row.get(3)?;
                    Ok(ColumnInfo {
                        name: row.get(0)?,
                        data_type: row.get(1)?,
                        nullable: not_null == 0,
                        primary_key: pk > 0,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(columns)
        })
        .await
    }

    async fn foreign_keys(&self, table: &str) -> anyhow::Result<Vec<ForeignKey>> {
        let table = table.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT \"from\", \"table\", COALESCE(\"to\", 'id') FROM pragma_foreign_key_list(?1)",
            )?;
            let keys = stmt
                .query_map([&table], |row| {
                    Ok(ForeignKey {
                        column: row.get(0)?,
                        referenced_table: row.get(1)?,
                        referenced_column: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(keys)
        })
        .await
    }

    async fn run_read_only_query(
        &self,
        statement: &str,
        row_cap: usize,
    ) -> anyhow::Result<Vec<RetrievedRow>> {
        let statement = statement.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&statement)
                .map_err(|e| anyhow::anyhow!("Failed to prepare statement: {}", e))?;
            if !stmt.readonly() {
                return Err(anyhow::anyhow!("Refusing to run a statement that writes data"));
            }
            let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query([])?;
            let mut results = Vec::new();
            while let Some(row) = rows.next()? {
                if results.len() >= row_cap {
                    break;
                }
                let mut columns = Vec::with_capacity(names.len());
                for (i, name) in names.iter().enumerate() {
                    columns.push((name.clone(), to_json(row.get_ref(i)?)));
                }
                results.push(RetrievedRow::new(columns));
            }
            debug!("Data source returned {} row(s)", results.len());
            Ok(results)
        })
        .await
    }
}

//! Scripted stand-ins for the external providers, shared by unit tests
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::providers::{
    ColumnInfo, Completion, CompletionProvider, CompletionRequest, DataStore, Embedder,
    ForeignKey, RetrievedRow, SqliteDataSource,
};

pub enum Step {
    Reply(String),
    Fail(String),
    Hang,
}

/// Completion provider that plays back a script, then a default reply.
pub struct MockCompletion {
    script: Mutex<VecDeque<Step>>,
    default_reply: String,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletion {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: "OK".to_string(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_default(mut self, reply: &str) -> Self {
        self.default_reply = reply.to_string();
        self
    }

    pub fn then_reply(self, text: &str) -> Self {
        self.push(Step::Reply(text.to_string()))
    }

    pub fn then_fail(self, message: &str) -> Self {
        self.push(Step::Fail(message.to_string()))
    }

    /// Next call never completes; only a caller-side timeout ends it.
    pub fn then_hang(self) -> Self {
        self.push(Step::Hang)
    }

    fn push(self, step: Step) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletion {
    async fn complete(&self, request: &CompletionRequest) -> anyhow::Result<Completion> {
        self.requests.lock().unwrap().push(request.clone());
        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Reply(text)) => Ok(Completion { text, tokens_used: 10 }),
            Some(Step::Fail(message)) => Err(anyhow::anyhow!(message)),
            Some(Step::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(anyhow::anyhow!("hang finished"))
            }
            None => Ok(Completion {
                text: self.default_reply.clone(),
                tokens_used: 10,
            }),
        }
    }
}

/// Deterministic bag-of-words embedder: texts sharing words get similar vectors.
pub struct MockEmbedder {
    pub dimension: usize,
    fail: bool,
    calls: AtomicUsize,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self { dimension: 64, fail: false, calls: AtomicUsize::new(0) }
    }

    pub fn failing() -> Self {
        Self { fail: true, ..Self::new() }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(anyhow::anyhow!("embedding service unavailable"));
        }
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
        {
            let word = crate::utils::singularize(word);
            let bucket = blake3::hash(word.as_bytes()).as_bytes()[0] as usize % self.dimension;
            vector[bucket] += 1.0;
        }
        Ok(vector)
    }
}

/// In-memory schema with canned query results keyed by statement fragments.
#[derive(Default)]
pub struct MockDataStore {
    tables: BTreeMap<String, Vec<ColumnInfo>>,
    foreign_keys: HashMap<String, Vec<ForeignKey>>,
    responses: Vec<(String, Result<Vec<RetrievedRow>, String>)>,
    statements: Mutex<Vec<String>>,
    list_calls: AtomicUsize,
}

impl MockDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, name: &str, columns: &[&str]) -> Self {
        let columns = columns
            .iter()
            .map(|c| ColumnInfo::new(c, if *c == "id" || c.ends_with("_id") { "INTEGER" } else { "TEXT" }))
            .collect();
        self.tables.insert(name.to_string(), columns);
        self
    }

    pub fn with_foreign_key(mut self, table: &str, column: &str, referenced: &str) -> Self {
        self.foreign_keys.entry(table.to_string()).or_default().push(ForeignKey {
            column: column.to_string(),
            referenced_table: referenced.to_string(),
            referenced_column: "id".to_string(),
        });
        self
    }

    /// Statements containing `fragment` return `rows`.
    pub fn on_query(mut self, fragment: &str, rows: Vec<RetrievedRow>) -> Self {
        self.responses.push((fragment.to_string(), Ok(rows)));
        self
    }

    pub fn fail_query(mut self, fragment: &str, message: &str) -> Self {
        self.responses.push((fragment.to_string(), Err(message.to_string())));
        self
    }

    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataStore for MockDataStore {
    async fn list_tables(&self) -> anyhow::Result<Vec<String>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tables.keys().cloned().collect())
    }

    async fn get_columns(&self, table: &str) -> anyhow::Result<Vec<ColumnInfo>> {
        self.tables
            .get(table)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no such table: {}", table))
    }

    async fn foreign_keys(&self, table: &str) -> anyhow::Result<Vec<ForeignKey>> {
        Ok(self.foreign_keys.get(table).cloned().unwrap_or_default())
    }

    async fn run_read_only_query(
        &self,
        statement: &str,
        row_cap: usize,
    ) -> anyhow::Result<Vec<RetrievedRow>> {
        self.statements.lock().unwrap().push(statement.to_string());
        for (fragment, response) in &self.responses {
            if statement.contains(fragment.as_str()) {
                return match response {
                    Ok(rows) => Ok(rows.iter().take(row_cap).cloned().collect()),
                    Err(message) => Err(anyhow::anyhow!(message.clone())),
                };
            }
        }
        Ok(Vec::new())
    }
}

pub fn row(pairs: &[(&str, serde_json::Value)]) -> RetrievedRow {
    RetrievedRow::new(pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
}

/// A small school database on disk, opened read-only.
pub fn school_database(dir: &Path) -> SqliteDataSource {
    let path = dir.join("school.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(
        "CREATE TABLE departments (
             id INTEGER PRIMARY KEY,
             name TEXT NOT NULL,
             deleted BOOLEAN DEFAULT FALSE
         );
         CREATE TABLE teacher_profiles (
             id INTEGER PRIMARY KEY,
             full_name TEXT NOT NULL,
             department_id INTEGER REFERENCES departments(id),
             deleted BOOLEAN DEFAULT FALSE
         );
         CREATE TABLE students (
             id INTEGER PRIMARY KEY,
             full_name TEXT NOT NULL,
             grade TEXT,
             deleted BOOLEAN DEFAULT FALSE
         );
         CREATE TABLE teacher_subjects (
             id INTEGER PRIMARY KEY,
             teacher_id INTEGER,
             subject_id INTEGER
         );
         INSERT INTO departments (name) VALUES ('Science'), ('Arts');
         INSERT INTO teacher_profiles (full_name, department_id, deleted) VALUES
             ('Ada Lovelace', 1, 0), ('Grace Hopper', 1, 0), ('Alan Turing', 2, 0),
             ('Left Already', 2, 1);
         INSERT INTO students (full_name, grade, deleted) VALUES
             ('Sam', '5', 0), ('Kim', '6', NULL);",
    )
    .unwrap();
    drop(conn);
    SqliteDataSource::open(&path).unwrap()
}

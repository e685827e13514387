//! Read-only statement guard
//!
//! Every statement that reaches the data store passes through here. The guard
//! strips model chatter, refuses anything that could write, pins table
//! references to the plan's candidates, and appends the soft-delete predicate
//! and row cap. [`GuardedQuery`] can only be built by this module.
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use super::classifier::Intent;
use super::planner::QueryPlan;
use crate::utils::TextUtils;

pub const SOFT_DELETE_PREDICATE: &str = "(deleted = FALSE OR deleted IS NULL)";

lazy_static! {
    static ref FENCE: Regex = Regex::new(r"```[A-Za-z]*").unwrap();
    static ref BLOCK_COMMENT: Regex = Regex::new(r"(?s)/\*.*?\*/").unwrap();
    static ref LINE_COMMENT: Regex = Regex::new(r"--[^\n]*").unwrap();
    static ref FIRST_SELECT: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref CTE_START: Regex = Regex::new(r"(?i)\bWITH\s+(?:RECURSIVE\s+)?\w+\s+AS\s*\(").unwrap();
    static ref BLOCKED: Regex = Regex::new(
        r"(?i)\b(DROP|DELETE|UPDATE|INSERT|ALTER|CREATE|TRUNCATE|EXEC|EXECUTE|GRANT|REVOKE|REPLACE|ATTACH|DETACH|PRAGMA|VACUUM)\b"
    )
    .unwrap();
    static ref COMPOUND: Regex = Regex::new(r"(?i)\b(UNION|INTERSECT|EXCEPT)\b").unwrap();
    static ref TABLE_REF: Regex =
        Regex::new(r#"(?i)\b(FROM|JOIN)\b(\s*(?:\(\s*)*)["`\[]?([A-Za-z_][\w.]*)["`\]]?"#).unwrap();
    static ref IMPLICIT_JOIN: Regex = Regex::new(
        r#"(?i)\b(?:FROM|JOIN)\b\s*(?:\(\s*)*["`\[]?([A-Za-z_][\w.]*)["`\]]?\s*\)*(?:\s+(?:AS\s+)?[A-Za-z_]\w*)?\s*,"#
    )
    .unwrap();
    static ref FROM_CLAUSE: Regex = Regex::new(
        r#"(?i)^FROM\s+["`\[]?([A-Za-z_][\w.]*)["`\]]?(?:\s+(?:AS\s+)?([A-Za-z_]\w*))?"#
    )
    .unwrap();
    static ref LIMIT_CLAUSE: Regex = Regex::new(r"(?i)^LIMIT\s+(\d+)(\s+OFFSET\s+\d+)?\s*$").unwrap();
}

const NOT_AN_ALIAS: &[&str] = &[
    "WHERE", "JOIN", "INNER", "LEFT", "RIGHT", "OUTER", "CROSS", "FULL", "NATURAL", "ON",
    "GROUP", "ORDER", "LIMIT", "HAVING", "WINDOW", "USING",
];

/// Why a statement was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardRejection {
    Empty,
    NotSelect,
    BlockedKeyword(String),
    MultipleStatements,
    Compound,
    ImplicitJoin,
    UnknownTable(String),
    NoTable,
}

impl fmt::Display for GuardRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "statement is empty"),
            Self::NotSelect => write!(f, "statement must start with SELECT"),
            Self::BlockedKeyword(k) => write!(f, "statement contains forbidden keyword {}", k),
            Self::MultipleStatements => write!(f, "multiple statements are not allowed"),
            Self::Compound => write!(f, "compound statements are not allowed"),
            Self::ImplicitJoin => write!(f, "comma-separated FROM lists are not allowed"),
            Self::UnknownTable(t) => write!(f, "statement reads unplanned table {}", t),
            Self::NoTable => write!(f, "statement names no table"),
        }
    }
}

impl std::error::Error for GuardRejection {}

/// Strip code fences, comments, leading prose and trailing semicolons.
pub fn sanitize(raw: &str) -> String {
    let text = FENCE.replace_all(raw, " ");
    let text = BLOCK_COMMENT.replace_all(&text, " ");
    let text = LINE_COMMENT.replace_all(&text, " ");
    let text = TextUtils::normalize_whitespace(&text).into_owned();

    let select_at = FIRST_SELECT.find(&text).map(|m| m.start());
    let cte_at = CTE_START.find(&text).map(|m| m.start());
    let start = match (cte_at, select_at) {
        (Some(cte), Some(select)) if cte < select => cte,
        (_, Some(select)) => select,
        _ => 0,
    };

    text[start..]
        .trim()
        .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
        .to_string()
}

pub fn validate_read_only(statement: &str) -> Result<(), GuardRejection> {
    let trimmed = statement.trim();
    if trimmed.is_empty() {
        return Err(GuardRejection::Empty);
    }
    let head = trimmed
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    if head != "SELECT" && head != "WITH" {
        return Err(GuardRejection::NotSelect);
    }
    if trimmed.contains(';') {
        return Err(GuardRejection::MultipleStatements);
    }
    if let Some(m) = BLOCKED.find(trimmed) {
        return Err(GuardRejection::BlockedKeyword(m.as_str().to_ascii_uppercase()));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind {
    From,
    Join,
}

/// Tables named after `FROM` and `JOIN`, in statement order, schema
/// qualifiers dropped.
/// Parenthesized names count; subqueries are skipped here and their own
/// `FROM` is picked up separately.
pub fn referenced_tables(statement: &str) -> Vec<(RefKind, String)> {
    TABLE_REF
        .captures_iter(statement)
        .filter(|caps| !is_subquery_keyword(&caps[3]))
        .map(|caps| {
            let kind = if caps[1].eq_ignore_ascii_case("JOIN") {
                RefKind::Join
            } else {
                RefKind::From
            };
            (kind, bare_name(&caps[3]).to_string())
        })
        .collect()
}

fn is_subquery_keyword(name: &str) -> bool {
    ["SELECT", "WITH", "VALUES"].iter().any(|k| k.eq_ignore_ascii_case(name))
}

/// A comma after the first table of a `FROM` or `JOIN`, parenthesized or not.
fn has_implicit_join(statement: &str) -> bool {
    IMPLICIT_JOIN
        .captures_iter(statement)
        .any(|caps| !is_subquery_keyword(&caps[1]))
}

fn bare_name(name: &str) -> &str {
    name.rsplit('.').next().unwrap_or(name)
}

fn is_candidate(candidates: &[String], table: &str) -> bool {
    candidates.iter().any(|c| c.eq_ignore_ascii_case(table))
}

/// Point every `FROM` whose table is not a candidate at `primary`.
/// Returns the statement and whether anything changed.
pub fn rewrite_primary_table(statement: &str, candidates: &[String], primary: &str) -> (String, bool) {
    let mut changed = false;
    let rewritten = TABLE_REF.replace_all(statement, |caps: &Captures| {
        let keyword = &caps[1];
        let name = &caps[3];
        if keyword.eq_ignore_ascii_case("FROM")
            && !is_subquery_keyword(name)
            && !is_candidate(candidates, bare_name(name))
        {
            changed = true;
            let opener = match &caps[2] {
                "" => " ",
                opener => opener,
            };
            format!("{}{}{}", keyword, opener, primary)
        } else {
            caps[0].to_string()
        }
    });
    (rewritten.into_owned(), changed)
}

/// Byte offsets of `keyword` outside parentheses and quoted text.
fn top_level_positions(sql: &str, keyword: &str) -> Vec<usize> {
    let bytes = sql.as_bytes();
    let kw = keyword.as_bytes();
    let is_word = |b: u8| b.is_ascii_alphanumeric() || b == b'_';
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut found = Vec::new();

    for i in 0..bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            continue;
        }
        match b {
            b'\'' | b'"' | b'`' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ if depth == 0 => {
                let end = i + kw.len();
                if end <= bytes.len()
                    && bytes[i..end].eq_ignore_ascii_case(kw)
                    && (i == 0 || !is_word(bytes[i - 1]))
                    && (end == bytes.len() || !is_word(bytes[end]))
                {
                    found.push(i);
                }
            }
            _ => {}
        }
    }
    found
}

/// The single place the soft-delete predicate and row cap are attached.
#[derive(Debug, Clone)]
pub struct SoftDeleteQuery {
    statement: String,
    soft_delete: bool,
    row_cap: usize,
}

impl SoftDeleteQuery {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            soft_delete: true,
            row_cap: 100,
        }
    }

    pub fn soft_delete(mut self, apply: bool) -> Self {
        self.soft_delete = apply;
        self
    }

    pub fn row_cap(mut self, row_cap: usize) -> Self {
        self.row_cap = row_cap;
        self
    }

    pub fn build(&self) -> String {
        let sql = self
            .statement
            .trim()
            .trim_end_matches(|c: char| c == ';' || c.is_whitespace())
            .to_string();
        let sql = if self.soft_delete {
            self.with_predicate(sql)
        } else {
            sql
        };
        self.with_limit(sql)
    }

    fn with_predicate(&self, sql: String) -> String {
        let Some(&from_at) = top_level_positions(&sql, "FROM").first() else {
            return sql;
        };

        let mut qualifier = None;
        if let Some(caps) = FROM_CLAUSE.captures(&sql[from_at..]) {
            let table = bare_name(&caps[1]).to_string();
            let alias = caps
                .get(2)
                .map(|m| m.as_str())
                .filter(|a| !NOT_AN_ALIAS.iter().any(|k| k.eq_ignore_ascii_case(a)));
            qualifier = match alias {
                Some(alias) => Some(alias.to_string()),
                None if !top_level_positions(&sql, "JOIN").is_empty() => Some(table),
                None => None,
            };
        }
        let predicate = match &qualifier {
            Some(q) => format!("({q}.deleted = FALSE OR {q}.deleted IS NULL)"),
            None => SOFT_DELETE_PREDICATE.to_string(),
        };
        if sql.contains(&predicate) {
            return sql;
        }

        let clause_end = ["GROUP BY", "HAVING", "WINDOW", "ORDER BY", "LIMIT"]
            .iter()
            .flat_map(|kw| top_level_positions(&sql, kw))
            .filter(|&pos| pos > from_at)
            .min()
            .unwrap_or(sql.len());
        let tail = if clause_end < sql.len() {
            format!(" {}", sql[clause_end..].trim_start())
        } else {
            String::new()
        };

        let where_at = top_level_positions(&sql, "WHERE")
            .into_iter()
            .find(|&pos| pos > from_at && pos < clause_end);
        match where_at {
            Some(where_at) => {
                let conditions = sql[where_at + "WHERE".len()..clause_end].trim();
                format!(
                    "{} WHERE ({}) AND {}{}",
                    sql[..where_at].trim_end(),
                    conditions,
                    predicate,
                    tail
                )
            }
            None => format!("{} WHERE {}{}", sql[..clause_end].trim_end(), predicate, tail),
        }
    }

    fn with_limit(&self, sql: String) -> String {
        let Some(&limit_at) = top_level_positions(&sql, "LIMIT").last() else {
            return format!("{} LIMIT {}", sql, self.row_cap);
        };
        if let Some(caps) = LIMIT_CLAUSE.captures(&sql[limit_at..]) {
            let requested: usize = caps[1].parse().unwrap_or(usize::MAX);
            if requested <= self.row_cap {
                return sql;
            }
            let offset = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            return format!("{}LIMIT {}{}", &sql[..limit_at], self.row_cap, offset);
        }
        format!("{}LIMIT {}", &sql[..limit_at], self.row_cap)
    }
}

/// A statement that passed the guard for a specific plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardedQuery {
    statement: String,
    tables: Vec<String>,
}

impl GuardedQuery {
    pub fn statement(&self) -> &str {
        &self.statement
    }

    pub fn tables(&self) -> &[String] {
        &self.tables
    }
}

#[derive(Debug, Clone)]
pub struct Admitted {
    pub query: GuardedQuery,
    /// The model named a table outside the plan and it was replaced.
    pub rewritten: bool,
}

pub struct SqlGuard<'a> {
    candidate_tables: &'a [String],
    primary_table: &'a str,
    soft_delete: &'a BTreeMap<String, bool>,
    row_cap: usize,
}

impl<'a> SqlGuard<'a> {
    pub fn new(
        candidate_tables: &'a [String],
        primary_table: &'a str,
        soft_delete: &'a BTreeMap<String, bool>,
        row_cap: usize,
    ) -> Self {
        Self {
            candidate_tables,
            primary_table,
            soft_delete,
            row_cap,
        }
    }

    /// `None` when the plan has no table to target.
    pub fn for_plan(plan: &'a QueryPlan, row_cap: usize) -> Option<Self> {
        let primary = plan.primary_table.as_deref()?;
        Some(Self::new(&plan.candidate_tables, primary, &plan.has_soft_delete, row_cap))
    }

    /// Tables without a known `deleted` column state are filtered anyway.
    fn needs_soft_delete(&self, table: &str) -> bool {
        self.soft_delete
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(table))
            .map_or(true, |(_, has)| *has)
    }

    pub fn admit(&self, raw: &str) -> Result<Admitted, GuardRejection> {
        let statement = sanitize(raw);
        validate_read_only(&statement)?;
        if COMPOUND.is_match(&statement) {
            return Err(GuardRejection::Compound);
        }
        if has_implicit_join(&statement) {
            return Err(GuardRejection::ImplicitJoin);
        }
        if let Some((_, table)) = referenced_tables(&statement)
            .into_iter()
            .find(|(kind, table)| *kind == RefKind::Join && !is_candidate(self.candidate_tables, table))
        {
            return Err(GuardRejection::UnknownTable(table));
        }

        let (statement, rewritten) =
            rewrite_primary_table(&statement, self.candidate_tables, self.primary_table);
        if rewritten {
            debug!("Rewrote unplanned table reference to {}", self.primary_table);
        }

        let tables = referenced_tables(&statement);
        let main_table = tables
            .iter()
            .find(|(kind, _)| *kind == RefKind::From)
            .map(|(_, t)| t.clone())
            .unwrap_or_else(|| self.primary_table.to_string());

        let query = self.finish(statement, &main_table);
        self.check_tables(&query)?;
        Ok(Admitted { query, rewritten })
    }

    /// The finished statement must name at least one table, and only candidates.
    fn check_tables(&self, query: &GuardedQuery) -> Result<(), GuardRejection> {
        if query.tables.is_empty() {
            return Err(GuardRejection::NoTable);
        }
        match query
            .tables
            .iter()
            .find(|t| !is_candidate(self.candidate_tables, t))
        {
            Some(table) => Err(GuardRejection::UnknownTable(table.clone())),
            None => Ok(()),
        }
    }

    /// Minimal statement for `intent` against the primary table.
    pub fn template(&self, intent: Intent) -> GuardedQuery {
        let statement = match intent {
            Intent::Count => format!("SELECT COUNT(*) AS count FROM {}", self.primary_table),
            _ => format!("SELECT * FROM {}", self.primary_table),
        };
        self.finish(statement, self.primary_table)
    }

    fn finish(&self, statement: String, main_table: &str) -> GuardedQuery {
        let built = SoftDeleteQuery::new(statement)
            .soft_delete(self.needs_soft_delete(main_table))
            .row_cap(self.row_cap)
            .build();
        let mut tables: Vec<String> = referenced_tables(&built).into_iter().map(|(_, t)| t).collect();
        tables.dedup();
        GuardedQuery {
            statement: built,
            tables,
        }
    }
}

//! Entity name -> table name resolution
//!
//! Resolution is one ordered chain of strategies that stops at the first hit:
//! verbatim name, direct map, singular/plural variant, substring containment
//! (skipping link tables), synonym association, then known prefixes.
use dashmap::DashMap;
use tracing::debug;

use super::entity_map::EntityMap;
use crate::providers::ColumnInfo;
use crate::utils::{pluralize, singularize};

pub struct EntityCatalog {
    map: EntityMap,
    columns: DashMap<String, Vec<ColumnInfo>>,
}

/// Whether a table only links other tables (or is bookkeeping) rather than
/// holding an entity of its own.
///
/// Pure: depends only on the name, the optional column list and the
/// configured markers/entity words.
pub fn is_junction_table(
    table_name: &str,
    columns: Option<&[ColumnInfo]>,
    map: &EntityMap,
) -> bool {
    let name = table_name.to_lowercase();
    let parts: Vec<&str> = name.split('_').collect();
    let prefixed = map.prefixes.iter().any(|p| name.starts_with(p.as_str()));
    let is_entity = |part: &str| map.direct.contains_key(&singularize(part));

    let marked = parts.iter().any(|part| {
        let single = singularize(part);
        map.junction_markers
            .iter()
            .any(|m| m.eq_ignore_ascii_case(part) || m.eq_ignore_ascii_case(&single))
    });
    if marked && !columns.map_or(false, describes_entity) {
        return true;
    }

    // entity_entity, unless the first part is a module prefix (fee_payments)
    if parts.len() == 2 && !prefixed {
        if is_entity(parts[0]) && is_entity(parts[1]) {
            return true;
        }
    }

    if let Some(columns) = columns {
        if !columns.is_empty() {
            let (fk_like, non_key) = column_shape(columns);
            if (fk_like >= 2 && non_key <= 1) || (fk_like >= 1 && non_key == 0) {
                return true;
            }
        }
    }

    false
}

/// `(link columns, descriptive columns)`; keys and timestamps count as neither.
fn column_shape(columns: &[ColumnInfo]) -> (usize, usize) {
    let fk_like = columns.iter().filter(|c| c.name.ends_with("_id")).count();
    let non_key = columns
        .iter()
        .filter(|c| {
            let n = c.name.to_lowercase();
            !c.primary_key
                && n != "id"
                && !n.ends_with("_id")
                && !matches!(n.as_str(), "created_at" | "updated_at" | "deleted" | "deleted_at")
        })
        .count();
    (fk_like, non_key)
}

/// Columns that outweigh a marker in the name: no links, several descriptive fields.
fn describes_entity(columns: &[ColumnInfo]) -> bool {
    let (fk_like, non_key) = column_shape(columns);
    fk_like == 0 && non_key >= 2
}

impl EntityCatalog {
    pub fn new(map: EntityMap) -> Self {
        Self {
            map,
            columns: DashMap::new(),
        }
    }

    pub fn entity_map(&self) -> &EntityMap {
        &self.map
    }

    pub fn remember_columns(&self, table: &str, columns: Vec<ColumnInfo>) {
        self.columns.insert(table.to_string(), columns);
    }

    pub fn known_columns(&self, table: &str) -> Option<Vec<ColumnInfo>> {
        self.columns.get(table).map(|entry| entry.value().clone())
    }

    /// Drop memoized column lists, e.g. after the schema changed.
    pub fn forget_columns(&self) {
        self.columns.clear();
    }

    pub fn canonical_entity(&self, word: &str) -> Option<String> {
        self.map.canonical_entity(word)
    }

    pub fn is_junction(&self, table: &str) -> bool {
        let columns = self.known_columns(table);
        is_junction_table(table, columns.as_deref(), &self.map)
    }

    /// Direct-map candidates for `entity` that exist, in map order.
    pub fn direct_candidates(&self, entity: &str, all_tables: &[String]) -> Vec<String> {
        let key = self
            .map
            .canonical_entity(entity)
            .unwrap_or_else(|| entity.to_lowercase());
        self.map
            .direct
            .get(&key)
            .map(|candidates| {
                candidates
                    .iter()
                    .filter_map(|c| find_table(all_tables, c))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn resolve(&self, entity_name: &str, all_tables: &[String]) -> Option<String> {
        let entity = entity_name.trim().to_lowercase();
        if entity.is_empty() || all_tables.is_empty() {
            return None;
        }

        if let Some(table) = find_table(all_tables, &entity) {
            debug!("Resolved '{}' verbatim", entity);
            return Some(table);
        }

        if let Some(table) = self.direct_candidates(&entity, all_tables).into_iter().next() {
            debug!("Resolved '{}' via direct map -> {}", entity, table);
            return Some(table);
        }

        let singular = singularize(&entity);
        let plural = pluralize(&singular);
        for variant in [&singular, &plural] {
            if let Some(table) = find_table(all_tables, variant) {
                debug!("Resolved '{}' via singular/plural -> {}", entity, table);
                return Some(table);
            }
        }

        let contains: Vec<&String> = all_tables
            .iter()
            .filter(|t| {
                let lower = t.to_lowercase();
                lower.contains(&entity) || lower.contains(&singular)
            })
            .collect();
        if let Some(table) = self.first_main_table(&contains) {
            debug!("Resolved '{}' via containment -> {}", entity, table);
            return Some(table);
        }
        // link tables only win when nothing later in the chain matches
        let junction_fallback = contains.first().map(|t| t.to_string());

        if let Some(key) = self.map.canonical_entity(&entity) {
            if let Some(synonyms) = self.map.related_keywords.get(&key) {
                for synonym in synonyms {
                    let matching: Vec<&String> = all_tables
                        .iter()
                        .filter(|t| t.to_lowercase().contains(synonym.as_str()))
                        .collect();
                    let found = self
                        .first_main_table(&matching)
                        .or_else(|| matching.first().map(|t| t.to_string()));
                    if let Some(table) = found {
                        debug!("Resolved '{}' via keyword '{}' -> {}", entity, synonym, table);
                        return Some(table);
                    }
                }
            }
        }

        for prefix in &self.map.prefixes {
            for variant in [&entity, &singular, &plural] {
                if let Some(table) = find_table(all_tables, &format!("{}{}", prefix, variant)) {
                    debug!("Resolved '{}' via prefix '{}' -> {}", entity, prefix, table);
                    return Some(table);
                }
            }
        }

        if junction_fallback.is_none() {
            debug!("Could not resolve entity '{}'", entity);
        }
        junction_fallback
    }

    fn first_main_table(&self, matches: &[&String]) -> Option<String> {
        matches
            .iter()
            .find(|t| !self.is_junction(t))
            .map(|t| t.to_string())
    }

    /// Coarse subject-area tag for a table.
    pub fn categorize(table_name: &str) -> &'static str {
        let name = table_name.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| name.contains(n));

        if has(&["teacher", "staff"]) {
            "teachers"
        } else if has(&["student"]) {
            "students"
        } else if has(&["class", "course"]) {
            "classes"
        } else if has(&["subject"]) {
            "subjects"
        } else if has(&["attendance"]) {
            "attendance"
        } else if has(&["grade", "mark", "exam"]) {
            "academics"
        } else if has(&["fee", "payment"]) {
            "finance"
        } else if has(&["user", "employee"]) {
            "users"
        } else {
            "general"
        }
    }
}

/// Case-insensitive lookup returning the table's own spelling.
fn find_table(all_tables: &[String], name: &str) -> Option<String> {
    all_tables
        .iter()
        .find(|t| t.eq_ignore_ascii_case(name))
        .cloned()
}

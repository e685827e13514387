//! Entity vocabulary and the entity -> table candidate mapping.
//!
//! Table names are deployment specific, so the built-in values are only a
//! starting point; a JSON file can replace any entry.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::utils::singularize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMap {
    /// Entity -> table names to try, most likely first.
    pub direct: BTreeMap<String, Vec<String>>,
    /// Entity -> domain synonyms that may appear in table names or questions.
    pub related_keywords: BTreeMap<String, Vec<String>>,
    /// Module-style prefixes seen in table names.
    pub prefixes: Vec<String>,
    /// Name fragments that mark link/bookkeeping tables.
    pub junction_markers: Vec<String>,
}

/// Partial map read from disk; present keys replace the defaults.
#[derive(Debug, Default, Deserialize)]
struct EntityMapOverlay {
    #[serde(default)]
    direct: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    related_keywords: BTreeMap<String, Vec<String>>,
    prefixes: Option<Vec<String>>,
    junction_markers: Option<Vec<String>>,
}

fn owned(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.iter().map(|s| s.to_string()).collect()))
        .collect()
}

impl Default for EntityMap {
    fn default() -> Self {
        let direct = owned(&[
            ("user", &["users_user", "auth_user"]),
            ("student", &["students", "students_student", "student_profiles"]),
            ("teacher", &["teacher_profiles", "teachers", "teachers_teacher"]),
            ("parent", &["parents"]),
            ("role", &["users_role", "roles", "auth_group"]),
            ("permission", &["users_permission", "auth_permission"]),
            ("class", &["classes"]),
            ("section", &["sections"]),
            ("subject", &["subjects"]),
            ("course", &["courses"]),
            ("exam", &["exams", "exam_results"]),
            ("fee", &["fee_invoices", "fee_payments"]),
            ("payment", &["fee_payments"]),
            ("attendance", &["daily_attendance", "attendance_summary"]),
            ("vehicle", &["vehicles"]),
            ("route", &["routes"]),
            ("employee", &["users_employee"]),
            ("department", &["departments"]),
            ("leave", &["leave_applications"]),
            ("assignment", &["assignments"]),
        ]);
        let related_keywords = owned(&[
            ("teacher", &["faculty", "staff", "instructor"]),
            ("student", &["pupil", "learner"]),
            ("fee", &["payment", "invoice", "billing"]),
            ("exam", &["test", "result", "marks"]),
            ("vehicle", &["bus", "transport"]),
            ("route", &["journey"]),
            ("class", &["grade", "section"]),
            ("user", &["account", "profile"]),
            ("role", &["designation", "position"]),
            ("parent", &["guardian"]),
            ("employee", &["staff", "worker"]),
        ]);
        Self {
            direct,
            related_keywords,
            prefixes: ["users_", "students_", "teachers_", "fee_", "auth_", "django_", "rag_"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            junction_markers: [
                "permission", "group", "token", "history", "log", "mapping", "junction",
                "relation", "link", "blacklist", "session", "migration", "admin",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

impl EntityMap {
    /// Load a JSON overlay on top of the built-in defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read entity map {}: {}", path.display(), e))?;
        let map = Self::from_json_str(&raw)?;
        info!(
            "Loaded entity map from {} ({} entities)",
            path.display(),
            map.direct.len()
        );
        Ok(map)
    }

    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let overlay: EntityMapOverlay = serde_json::from_str(raw)
            .map_err(|e| anyhow::anyhow!("Invalid entity map: {}", e))?;
        let mut map = Self::default();
        for (entity, tables) in overlay.direct {
            map.direct.insert(entity.to_lowercase(), tables);
        }
        for (entity, keywords) in overlay.related_keywords {
            map.related_keywords.insert(entity.to_lowercase(), keywords);
        }
        if let Some(prefixes) = overlay.prefixes {
            map.prefixes = prefixes;
        }
        if let Some(markers) = overlay.junction_markers {
            map.junction_markers = markers;
        }
        Ok(map)
    }

    /// Fold a word ("teachers", "faculty") to the entity key it names.
    pub fn canonical_entity(&self, word: &str) -> Option<String> {
        let word = word.trim().to_lowercase();
        if word.is_empty() {
            return None;
        }
        let singular = singularize(&word);
        for candidate in [&word, &singular] {
            if self.direct.contains_key(candidate.as_str())
                || self.related_keywords.contains_key(candidate.as_str())
            {
                return Some(candidate.clone());
            }
        }
        self.related_keywords
            .iter()
            .find(|(_, synonyms)| synonyms.iter().any(|s| *s == word || *s == singular))
            .map(|(entity, _)| entity.clone())
    }

    /// Every entity key, sorted.
    pub fn entities(&self) -> Vec<String> {
        let mut entities: Vec<String> = self
            .direct
            .keys()
            .chain(self.related_keywords.keys())
            .cloned()
            .collect();
        entities.sort();
        entities.dedup();
        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_common_entities() {
        let map = EntityMap::default();
        assert_eq!(map.direct["teacher"][0], "teacher_profiles");
        assert!(map.direct["role"].contains(&"users_role".to_string()));
        assert!(map.prefixes.contains(&"users_".to_string()));
        assert!(map.junction_markers.contains(&"permission".to_string()));
    }

    #[test]
    fn test_canonical_entity_folds_plurals_and_synonyms() {
        let map = EntityMap::default();
        assert_eq!(map.canonical_entity("Teachers").as_deref(), Some("teacher"));
        assert_eq!(map.canonical_entity("classes").as_deref(), Some("class"));
        assert_eq!(map.canonical_entity("faculty").as_deref(), Some("teacher"));
        assert_eq!(map.canonical_entity("bus").as_deref(), Some("vehicle"));
        assert_eq!(map.canonical_entity("weather"), None);
        assert_eq!(map.canonical_entity("  "), None);
    }

    #[test]
    fn test_overlay_replaces_entries_and_keeps_the_rest() {
        let map = EntityMap::from_json_str(
            r#"{
                "direct": {"Role": ["roles"], "library": ["library_books"]},
                "prefixes": ["core_"]
            }"#,
        )
        .unwrap();
        assert_eq!(map.direct["role"], vec!["roles"]);
        assert_eq!(map.direct["library"], vec!["library_books"]);
        assert_eq!(map.direct["teacher"][0], "teacher_profiles");
        assert_eq!(map.prefixes, vec!["core_"]);
        assert!(!map.junction_markers.is_empty());
    }

    #[test]
    fn test_overlay_rejects_invalid_json() {
        assert!(EntityMap::from_json_str("{ not json").is_err());
    }

    #[test]
    fn test_from_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("entities.json");
        std::fs::write(&path, r#"{"direct": {"teacher": ["staff_members"]}}"#).unwrap();
        let map = EntityMap::from_json_file(&path).unwrap();
        assert_eq!(map.direct["teacher"], vec!["staff_members"]);
    }
}

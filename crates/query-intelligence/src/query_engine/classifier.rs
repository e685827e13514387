//! Keyword-bucket intent classification
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::utils::TextUtils;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    Count,
    List,
    Detail,
    Analytical,
    Conversational,
    Procedural,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::List => "LIST",
            Self::Detail => "DETAIL",
            Self::Analytical => "ANALYTICAL",
            Self::Conversational => "CONVERSATIONAL",
            Self::Procedural => "PROCEDURAL",
        }
    }

    /// Intents answered by running a statement against the data store.
    pub fn is_data_query(&self) -> bool {
        matches!(self, Self::Count | Self::List | Self::Detail | Self::Analytical)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checked top to bottom; the first bucket with a matching phrase wins.
const BUCKETS: &[(Intent, &[&str])] = &[
    (Intent::Count, &["how many", "count", "total", "number of"]),
    (
        Intent::Analytical,
        &["analyze", "analyse", "compare", "summarize", "average", "calculate", "ratio"],
    ),
    (Intent::List, &["show", "list", "display", "get all"]),
    (Intent::Procedural, &["how to", "how do i", "steps", "guide"]),
    (Intent::Detail, &["find", "search", "get", "tell me about"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub intent: Intent,
    /// The phrase that decided the bucket; `None` means the default was used.
    pub matched: Option<&'static str>,
}

pub struct QueryClassifier;

impl QueryClassifier {
    pub fn classify(question: &str) -> Intent {
        Self::classify_with_signal(question).intent
    }

    pub fn classify_with_signal(question: &str) -> Classification {
        for (intent, phrases) in BUCKETS {
            if let Some(phrase) = phrases.iter().find(|p| TextUtils::contains_phrase(question, p)) {
                return Classification {
                    intent: *intent,
                    matched: Some(*phrase),
                };
            }
        }
        Classification {
            intent: Intent::Conversational,
            matched: None,
        }
    }
}

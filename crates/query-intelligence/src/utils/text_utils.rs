//! Text normalization helpers shared by the cache, classifier and composer

use lazy_static::lazy_static;
use regex::Regex;
use std::borrow::Cow;

lazy_static! {
    static ref WHITESPACE_REGEX: Regex = Regex::new(r"\s+").unwrap();
}

pub struct TextUtils;

impl TextUtils {
    /// Collapse runs of whitespace into single spaces and trim the ends.
    pub fn normalize_whitespace(text: &str) -> Cow<'_, str> {
        let trimmed = text.trim();
        let dirty = trimmed.len() != text.len()
            || text.contains("  ")
            || text.contains(|c: char| c.is_whitespace() && c != ' ');
        if dirty {
            Cow::Owned(WHITESPACE_REGEX.replace_all(trimmed, " ").into_owned())
        } else {
            Cow::Borrowed(text)
        }
    }

    /// The canonical form of a question used for cache keys: trimmed,
    /// lowercased, whitespace collapsed.
    pub fn normalize_question(text: &str) -> String {
        Self::normalize_whitespace(text).to_lowercase()
    }

    /// Check whether `phrase` occurs in `text` on word boundaries, ignoring case.
    pub fn contains_phrase(text: &str, phrase: &str) -> bool {
        let text = text.to_lowercase();
        let phrase = phrase.to_lowercase();
        if phrase.is_empty() {
            return false;
        }
        let mut start = 0;
        while let Some(pos) = text[start..].find(&phrase) {
            let begin = start + pos;
            let end = begin + phrase.len();
            let before_ok = text[..begin]
                .chars()
                .next_back()
                .map_or(true, |c| !c.is_alphanumeric());
            let after_ok = text[end..]
                .chars()
                .next()
                .map_or(true, |c| !c.is_alphanumeric());
            if before_ok && after_ok {
                return true;
            }
            start = begin + phrase.chars().next().map_or(1, char::len_utf8);
        }
        false
    }

    /// Truncate to at most `max_chars` characters, appending "..." when cut.
    pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> Cow<'_, str> {
        if text.chars().count() <= max_chars {
            Cow::Borrowed(text)
        } else if max_chars <= 3 {
            Cow::Borrowed("...")
        } else {
            let mut result: String = text.chars().take(max_chars - 3).collect();
            result.push_str("...");
            Cow::Owned(result)
        }
    }
}

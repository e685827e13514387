//! Utilities module - text normalization and content-word extraction

pub mod text_utils;
pub mod topic_extractor;

pub use text_utils::TextUtils;
pub use topic_extractor::{content_words, pluralize, singularize};

// src/relevance.rs
//! Keyword relevance gate for broad feeds.
//!
//! An article is relevant iff its title or body contains at least one configured
//! keyword (case-insensitive substring). Query-scoped sources skip the gate.

use std::collections::BTreeSet;

/// Result of a relevance check: which keywords hit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Relevance {
    pub matched: Vec<String>,
}

impl Relevance {
    pub fn passed(&self) -> bool {
        !self.matched.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeywordFilter {
    keywords: Vec<String>, // lowercased, trimmed, unique, sorted
}

impl KeywordFilter {
    pub fn new<I, S>(keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let set: BTreeSet<String> = keywords
            .into_iter()
            .map(|k| k.as_ref().trim().to_lowercase())
            .filter(|k| !k.is_empty())
            .collect();
        Self {
            keywords: set.into_iter().collect(),
        }
    }

    /// Union of two keyword sets (category + global).
    pub fn merged(&self, other: &KeywordFilter) -> KeywordFilter {
        KeywordFilter::new(self.keywords.iter().chain(other.keywords.iter()))
    }

    pub fn is_empty(&self) -> bool {
        self.keywords.is_empty()
    }

    pub fn keywords(&self) -> &[String] {
        &self.keywords
    }

    pub fn evaluate(&self, title: &str, body: &str) -> Relevance {
        let title = title.to_lowercase();
        let body = body.to_lowercase();
        let matched = self
            .keywords
            .iter()
            .filter(|k| title.contains(k.as_str()) || body.contains(k.as_str()))
            .cloned()
            .collect();
        Relevance { matched }
    }

    pub fn is_relevant(&self, title: &str, body: &str) -> bool {
        self.evaluate(title, body).passed()
    }
}

// src/ingest/mod.rs
pub mod providers;
pub mod types;

use crate::ingest::types::ArticleSource;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Normalize already-decoded plain text: fold smart quotes, collapse whitespace.
/// Does not touch `<` or `>`; in decoded text they are content.
pub fn normalize_text(s: &str) -> String {
    // 1) Normalize “ ” ‘ ’ « » to ASCII quotes
    let out = s
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    // 2) Collapse whitespace
    static RE_WS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_ws = RE_WS.get_or_init(|| regex::Regex::new(r"\s+").unwrap());
    re_ws.replace_all(&out, " ").trim().to_string()
}

/// Turn an HTML fragment (RSS descriptions) into plain text.
///
/// Tags are stripped before entities are decoded, so an escaped `&lt;LLN`
/// survives as the comparison it is.
pub fn html_to_text(s: &str) -> String {
    static RE_TAGS: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re_tags = RE_TAGS.get_or_init(|| regex::Regex::new(r"(?is)</?[a-z][^>]*>").unwrap());
    let stripped = re_tags.replace_all(s, "");
    normalize_text(&html_escape::decode_html_entities(&stripped))
}

/// Named article sources. Category bindings refer to sources by name.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: BTreeMap<String, Arc<dyn ArticleSource>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `source.name()`. A later registration with the same name replaces the earlier one.
    pub fn register(&mut self, source: Arc<dyn ArticleSource>) -> &mut Self {
        self.sources.insert(source.name().to_string(), source);
        self
    }

    pub fn with(mut self, source: Arc<dyn ArticleSource>) -> Self {
        self.register(source);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ArticleSource>> {
        self.sources.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sources.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}

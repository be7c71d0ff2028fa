// src/ingest/types.rs
use crate::errors::SourceUnavailable;

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct Article {
    pub source: String,              // producing source, e.g. "pubmed", "rss"
    pub category: String,            // category the candidate was fetched for
    pub title: String,               // normalized
    pub body: String,                // abstract / summary, normalized
    pub link: String,                // canonical URL
    pub external_id: Option<String>, // source-native id (PMID, RSS guid)
    pub language: Option<String>,    // as reported by the source, e.g. "eng"
    pub published_at: Option<i64>,   // unix seconds
}

impl Article {
    /// Dedup identity: the source-native id when present, else the canonical link.
    /// Titles never take part (they get translated).
    pub fn identity_key(&self) -> Option<&str> {
        let id = self
            .external_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty());
        id.or_else(|| Some(self.link.trim()).filter(|s| !s.is_empty()))
    }
}

/// A place articles come from. `query` is source-specific (a search term for
/// PubMed, a feed URL for RSS).
#[async_trait::async_trait]
pub trait ArticleSource: Send + Sync {
    async fn fetch(
        &self,
        category: &str,
        query: &str,
        limit: usize,
    ) -> Result<Vec<Article>, SourceUnavailable>;

    fn name(&self) -> &str;

    /// True when results are already scoped by the query, so the keyword
    /// relevance filter is not needed by default.
    fn query_scoped(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn art(id: Option<&str>, link: &str) -> Article {
        Article {
            source: "test".into(),
            category: "c".into(),
            title: "t".into(),
            body: "b".into(),
            link: link.into(),
            external_id: id.map(str::to_string),
            language: None,
            published_at: None,
        }
    }

    #[test]
    fn identity_prefers_external_id() {
        assert_eq!(art(Some("123"), "https://x/1").identity_key(), Some("123"));
        assert_eq!(art(None, "https://x/1").identity_key(), Some("https://x/1"));
        assert_eq!(art(Some("  "), "https://x/1").identity_key(), Some("https://x/1"));
        assert_eq!(art(None, " ").identity_key(), None);
    }
}

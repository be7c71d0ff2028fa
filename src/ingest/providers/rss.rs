use anyhow::{Context, Result};
use async_trait::async_trait;
use metrics::histogram;
use quick_xml::de::from_str;
use serde::Deserialize;
use std::cmp::Reverse;
use time::{format_description::well_known::Rfc2822, OffsetDateTime};

use crate::errors::SourceUnavailable;
use crate::ingest::{html_to_text, normalize_text};
use crate::ingest::types::{Article, ArticleSource};

pub const DEFAULT_RSS_SOURCE_NAME: &str = "rss";

#[derive(Debug, Deserialize)]
struct Rss {
    channel: Channel,
}

#[derive(Debug, Deserialize)]
struct Channel {
    #[serde(rename = "item", default)]
    item: Vec<Item>,
}

#[derive(Debug, Deserialize)]
struct Item {
    title: Option<String>,
    link: Option<String>,
    #[serde(rename = "pubDate")]
    pub_date: Option<String>,
    description: Option<String>,
    guid: Option<Guid>,
}

#[derive(Debug, Deserialize)]
struct Guid {
    #[serde(rename = "$text", default)]
    value: String,
}

fn parse_rfc2822_to_unix(ts: &str) -> Option<i64> {
    OffsetDateTime::parse(ts.trim(), &Rfc2822)
        .ok()
        .map(|dt| dt.unix_timestamp())
}

/// PubMed search feeds use `pubmed:<pmid>` guids; those map onto the same
/// identity the E-utilities source produces. Other guids are not trusted.
fn pubmed_id_from_guid(guid: &str) -> Option<String> {
    let pmid = guid.trim().strip_prefix("pubmed:")?;
    (!pmid.is_empty() && pmid.bytes().all(|b| b.is_ascii_digit())).then(|| pmid.to_string())
}

/// Generic RSS 2.0 feed. Not query-scoped: the binding's query is the feed URL,
/// so results need the keyword relevance filter.
pub struct RssSource {
    name: String,
    mode: Mode,
}

enum Mode {
    // Ignores the query and always parses the stored document.
    Fixture(String),
    Http { client: reqwest::Client },
}

impl RssSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            name: DEFAULT_RSS_SOURCE_NAME.to_string(),
            mode: Mode::Http { client },
        }
    }

    pub fn from_fixture_str(s: &str) -> Self {
        Self {
            name: DEFAULT_RSS_SOURCE_NAME.to_string(),
            mode: Mode::Fixture(s.to_string()),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    async fn download(client: &reqwest::Client, url: &str) -> Result<String> {
        client
            .get(url)
            .send()
            .await
            .context("rss http get()")?
            .error_for_status()
            .context("rss non-2xx")?
            .text()
            .await
            .context("rss http .text()")
    }

    /// Parse a feed document into articles, newest first, capped at `limit`.
    pub fn parse_items_from_str(
        &self,
        s: &str,
        category: &str,
        limit: usize,
    ) -> Result<Vec<Article>> {
        let t0 = std::time::Instant::now();
        let xml_clean = scrub_html_entities_for_xml(s);
        let rss: Rss = from_str(&xml_clean).context("parsing rss xml")?;

        let mut out = Vec::with_capacity(rss.channel.item.len());
        for it in rss.channel.item {
            let link = it.link.as_deref().map(str::trim).unwrap_or_default();
            if link.is_empty() {
                tracing::debug!(source = %self.name, "rss item without link skipped");
                continue;
            }
            let title = normalize_text(it.title.as_deref().unwrap_or_default());
            out.push(Article {
                source: self.name.clone(),
                category: category.to_string(),
                title: if title.is_empty() {
                    "Untitled".to_string()
                } else {
                    title
                },
                body: html_to_text(it.description.as_deref().unwrap_or_default()),
                link: link.to_string(),
                external_id: it.guid.as_ref().and_then(|g| pubmed_id_from_guid(&g.value)),
                language: None,
                published_at: it.pub_date.as_deref().and_then(parse_rfc2822_to_unix),
            });
        }

        // Stable: undated items keep feed order, after dated ones.
        out.sort_by_key(|a| Reverse(a.published_at));
        out.truncate(limit);

        let ms = t0.elapsed().as_secs_f64() * 1_000.0;
        histogram!("digest_parse_ms").record(ms);
        Ok(out)
    }
}

#[async_trait]
impl ArticleSource for RssSource {
    async fn fetch(
        &self,
        category: &str,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Article>, SourceUnavailable> {
        let body = match &self.mode {
            Mode::Fixture(s) => s.clone(),
            Mode::Http { client } => Self::download(client, query)
                .await
                .map_err(|e| SourceUnavailable::new(&self.name, format!("{e:#}")))?,
        };
        self.parse_items_from_str(&body, category, limit)
            .map_err(|e| SourceUnavailable::new(&self.name, format!("{e:#}")))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn query_scoped(&self) -> bool {
        false
    }
}

/// Feeds often carry HTML named entities (`&hellip;`, `&eacute;`) that XML
/// does not define. Rewrite them as numeric references before parsing; the five
/// XML entities are left alone and unknown names are escaped as text.
fn scrub_html_entities_for_xml(s: &str) -> String {
    static RE_ENTITY: once_cell::sync::OnceCell<regex::Regex> = once_cell::sync::OnceCell::new();
    let re = RE_ENTITY.get_or_init(|| regex::Regex::new(r"&([A-Za-z][A-Za-z0-9]*);").unwrap());
    re.replace_all(s, |caps: &regex::Captures<'_>| {
        let name = &caps[1];
        match name {
            "amp" | "lt" | "gt" | "quot" | "apos" => caps[0].to_string(),
            "nbsp" => " ".to_string(),
            _ => {
                let decoded = html_escape::decode_html_entities(&caps[0]);
                if decoded == &caps[0] {
                    format!("&amp;{name};")
                } else {
                    decoded.chars().map(|c| format!("&#{};", u32::from(c))).collect()
                }
            }
        }
    })
    .into_owned()
}

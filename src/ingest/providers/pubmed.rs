//! PubMed E-utilities source: `esearch` for recent ids, one `efetch` for records.
//!
//! efetch XML carries inline markup inside titles and abstracts (`<i>`, `<sup>`),
//! so records are read with the streaming reader instead of serde.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use metrics::histogram;
use quick_xml::events::{BytesStart, Event};
use quick_xml::reader::Reader;
use serde::Deserialize;

use crate::errors::SourceUnavailable;
use crate::ingest::normalize_text;
use crate::ingest::types::{Article, ArticleSource};

pub const DEFAULT_PUBMED_SOURCE_NAME: &str = "pubmed";
pub const ESEARCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/esearch.fcgi";
pub const EFETCH_URL: &str = "https://eutils.ncbi.nlm.nih.gov/entrez/eutils/efetch.fcgi";

const UNTITLED: &str = "Untitled";
const NO_ABSTRACT: &str = "No abstract available.";

pub fn article_link(pmid: &str) -> String {
    format!("https://pubmed.ncbi.nlm.nih.gov/{pmid}/")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PubMedSettings {
    /// Only articles published within this many days.
    pub reldate_days: u32,
    pub api_key: Option<String>,
    pub tool: Option<String>,
    pub email: Option<String>,
}

impl Default for PubMedSettings {
    fn default() -> Self {
        Self {
            reldate_days: 7,
            api_key: None,
            tool: Some("med-digest".to_string()),
            email: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ESearchResponse {
    esearchresult: ESearchResult,
}

#[derive(Debug, Deserialize)]
struct ESearchResult {
    #[serde(default)]
    idlist: Vec<String>,
}

pub fn parse_esearch_ids(json: &str) -> Result<Vec<String>> {
    let resp: ESearchResponse = serde_json::from_str(json).context("parsing esearch json")?;
    Ok(resp
        .esearchresult
        .idlist
        .into_iter()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .collect())
}

/// Raw fields of one `PubmedArticle`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PubMedRecord {
    pub pmid: String,
    pub title: String,
    pub abstract_sections: Vec<(Option<String>, String)>,
    pub language: Option<String>,
}

impl PubMedRecord {
    fn body(&self) -> String {
        let parts: Vec<String> = self
            .abstract_sections
            .iter()
            .map(|(label, text)| (label, normalize_text(text)))
            .filter(|(_, text)| !text.is_empty())
            .map(|(label, text)| match label {
                Some(l) if !l.trim().is_empty() => format!("{}: {}", l.trim(), text),
                _ => text,
            })
            .collect();
        if parts.is_empty() {
            NO_ABSTRACT.to_string()
        } else {
            parts.join("\n")
        }
    }

    pub fn into_article(self, source: &str, category: &str) -> Article {
        let title = normalize_text(&self.title);
        let body = self.body();
        Article {
            source: source.to_string(),
            category: category.to_string(),
            title: if title.is_empty() {
                UNTITLED.to_string()
            } else {
                title
            },
            body,
            link: article_link(&self.pmid),
            external_id: Some(self.pmid),
            language: self.language,
            published_at: None,
        }
    }
}

enum Capture {
    Pmid,
    Title,
    Abstract(Option<String>),
    Language,
}

fn label_of(e: &BytesStart<'_>) -> Option<String> {
    e.try_get_attribute("Label")
        .ok()
        .flatten()
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Parse an efetch `PubmedArticleSet` document.
pub fn parse_efetch_records(xml: &str) -> Result<Vec<PubMedRecord>> {
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut out = Vec::new();
    let mut current: Option<PubMedRecord> = None;
    // (what, depth at which the captured element was opened, buffer)
    let mut capture: Option<(Capture, usize, String)> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                let parent = stack.last().map(Vec::as_slice);
                if name.as_slice() == b"PubmedArticle" {
                    current = Some(PubMedRecord::default());
                } else if current.is_some() && capture.is_none() {
                    let what = match (name.as_slice(), parent) {
                        (b"PMID", Some(b"MedlineCitation")) => Some(Capture::Pmid),
                        (b"ArticleTitle", Some(b"Article")) => Some(Capture::Title),
                        (b"AbstractText", Some(b"Abstract")) => {
                            Some(Capture::Abstract(label_of(&e)))
                        }
                        (b"Language", Some(b"Article")) => Some(Capture::Language),
                        _ => None,
                    };
                    if let Some(w) = what {
                        capture = Some((w, stack.len(), String::new()));
                    }
                }
                stack.push(name);
            }
            Ok(Event::End(e)) => {
                stack.pop();
                if matches!(&capture, Some((_, depth, _)) if *depth == stack.len()) {
                    if let (Some((what, _, buf)), Some(rec)) = (capture.take(), current.as_mut()) {
                        match what {
                            Capture::Pmid => rec.pmid = buf.trim().to_string(),
                            Capture::Title => rec.title = buf,
                            Capture::Abstract(label) => rec.abstract_sections.push((label, buf)),
                            Capture::Language => {
                                let l = buf.trim().to_ascii_lowercase();
                                if !l.is_empty() && rec.language.is_none() {
                                    rec.language = Some(l);
                                }
                            }
                        }
                    }
                }
                if e.name().as_ref() == b"PubmedArticle" {
                    if let Some(rec) = current.take() {
                        if rec.pmid.is_empty() {
                            tracing::debug!("efetch record without PMID skipped");
                        } else {
                            out.push(rec);
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                if let Some((_, _, buf)) = capture.as_mut() {
                    let txt = t.unescape().context("unescaping efetch text")?;
                    buf.push_str(&txt);
                }
            }
            Ok(Event::CData(c)) => {
                if let Some((_, _, buf)) = capture.as_mut() {
                    buf.push_str(&String::from_utf8_lossy(&c.into_inner()));
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(anyhow!(
                    "efetch xml error at {}: {e}",
                    reader.buffer_position()
                ))
            }
            _ => {}
        }
    }
    Ok(out)
}

/// Keep esearch order (recency); drop records that were not asked for.
fn order_by_ids(records: Vec<PubMedRecord>, ids: &[String]) -> Vec<PubMedRecord> {
    let mut slots: Vec<Option<PubMedRecord>> = vec![None; ids.len()];
    for rec in records {
        if let Some(pos) = ids.iter().position(|id| *id == rec.pmid) {
            if slots[pos].is_none() {
                slots[pos] = Some(rec);
            }
        }
    }
    slots.into_iter().flatten().collect()
}

pub struct PubMedSource {
    name: String,
    mode: Mode,
}

enum Mode {
    Fixture { esearch: String, efetch: String },
    Http {
        client: reqwest::Client,
        settings: PubMedSettings,
    },
}

impl PubMedSource {
    pub fn new(client: reqwest::Client, settings: PubMedSettings) -> Self {
        Self {
            name: DEFAULT_PUBMED_SOURCE_NAME.to_string(),
            mode: Mode::Http { client, settings },
        }
    }

    /// Canned esearch JSON + efetch XML; the query is ignored.
    pub fn from_fixtures(esearch_json: &str, efetch_xml: &str) -> Self {
        Self {
            name: DEFAULT_PUBMED_SOURCE_NAME.to_string(),
            mode: Mode::Fixture {
                esearch: esearch_json.to_string(),
                efetch: efetch_xml.to_string(),
            },
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn common_params(settings: &PubMedSettings) -> Vec<(&'static str, String)> {
        let mut p = vec![("db", "pubmed".to_string())];
        if let Some(k) = settings.api_key.as_ref().filter(|k| !k.is_empty()) {
            p.push(("api_key", k.clone()));
        }
        if let Some(t) = settings.tool.as_ref().filter(|t| !t.is_empty()) {
            p.push(("tool", t.clone()));
        }
        if let Some(m) = settings.email.as_ref().filter(|m| !m.is_empty()) {
            p.push(("email", m.clone()));
        }
        p
    }

    async fn search(
        client: &reqwest::Client,
        settings: &PubMedSettings,
        query: &str,
        limit: usize,
    ) -> Result<Vec<String>> {
        let mut params = Self::common_params(settings);
        params.extend([
            ("term", query.to_string()),
            ("retmax", limit.to_string()),
            ("retmode", "json".to_string()),
            ("reldate", settings.reldate_days.to_string()),
            ("datetype", "pdat".to_string()),
        ]);
        let body = client
            .get(ESEARCH_URL)
            .query(&params)
            .send()
            .await
            .context("esearch get()")?
            .error_for_status()
            .context("esearch non-2xx")?
            .text()
            .await
            .context("esearch .text()")?;
        parse_esearch_ids(&body)
    }

    async fn fetch_records(
        client: &reqwest::Client,
        settings: &PubMedSettings,
        ids: &[String],
    ) -> Result<String> {
        let mut params = Self::common_params(settings);
        params.extend([("id", ids.join(",")), ("retmode", "xml".to_string())]);
        client
            .get(EFETCH_URL)
            .query(&params)
            .send()
            .await
            .context("efetch get()")?
            .error_for_status()
            .context("efetch non-2xx")?
            .text()
            .await
            .context("efetch .text()")
    }

    async fn fetch_inner(&self, category: &str, query: &str, limit: usize) -> Result<Vec<Article>> {
        let (mut ids, xml) = match &self.mode {
            Mode::Fixture { esearch, efetch } => (parse_esearch_ids(esearch)?, efetch.clone()),
            Mode::Http { client, settings } => {
                let ids = Self::search(client, settings, query, limit).await?;
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
                let ids: Vec<String> = ids.into_iter().take(limit).collect();
                let xml = Self::fetch_records(client, settings, &ids).await?;
                (ids, xml)
            }
        };
        ids.truncate(limit);

        let t0 = std::time::Instant::now();
        let records = order_by_ids(parse_efetch_records(&xml)?, &ids);
        histogram!("digest_parse_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        if records.len() < ids.len() {
            tracing::debug!(
                source = %self.name,
                asked = ids.len(),
                got = records.len(),
                "efetch returned fewer records than requested"
            );
        }
        Ok(records
            .into_iter()
            .map(|r| r.into_article(&self.name, category))
            .collect())
    }
}

#[async_trait]
impl ArticleSource for PubMedSource {
    async fn fetch(
        &self,
        category: &str,
        query: &str,
        limit: usize,
    ) -> std::result::Result<Vec<Article>, SourceUnavailable> {
        self.fetch_inner(category, query, limit)
            .await
            .map_err(|e| SourceUnavailable::new(&self.name, format!("{e:#}")))
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn query_scoped(&self) -> bool {
        true
    }
}

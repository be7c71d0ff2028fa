use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use super::Translator;
use crate::errors::TranslationUnavailable;

pub const GTX_URL: &str = "https://translate.googleapis.com/translate_a/single";
pub const DEFAULT_MAX_INPUT_CHARS: usize = 4000;

/// Google's public `gtx` endpoint (no key). Source language is auto-detected.
#[derive(Clone)]
pub struct GoogleTranslator {
    client: Client,
    endpoint: String,
    timeout: Duration,
    max_input_chars: usize,
}

impl GoogleTranslator {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoint: GTX_URL.to_string(),
            timeout: Duration::from_secs(20),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Duration::from_secs(secs);
        self
    }

    pub fn with_max_input_chars(mut self, n: usize) -> Self {
        self.max_input_chars = n.max(1);
        self
    }

    pub fn with_endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = url.into();
        self
    }
}

/// The response is a nested array; segment `i` of the translation is at `[0][i][0]`.
pub fn parse_gtx_response(body: &str) -> Result<String, TranslationUnavailable> {
    let v: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| TranslationUnavailable(format!("bad json: {e}")))?;
    let segments = v
        .get(0)
        .and_then(|s| s.as_array())
        .ok_or_else(|| TranslationUnavailable("no segments in response".to_string()))?;
    let out: String = segments
        .iter()
        .filter_map(|seg| seg.get(0).and_then(|t| t.as_str()))
        .collect();
    if out.trim().is_empty() {
        return Err(TranslationUnavailable("empty translation".to_string()));
    }
    Ok(out)
}

#[async_trait]
impl Translator for GoogleTranslator {
    async fn translate(
        &self,
        text: &str,
        target_lang: &str,
    ) -> Result<String, TranslationUnavailable> {
        if text.trim().is_empty() {
            return Ok(text.to_string());
        }
        let input: String = text.chars().take(self.max_input_chars).collect();
        let params = [
            ("client", "gtx"),
            ("sl", "auto"),
            ("tl", target_lang),
            ("dt", "t"),
            ("q", input.as_str()),
        ];

        let resp = self
            .client
            .get(&self.endpoint)
            .query(&params)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| TranslationUnavailable(format!("request failed: {e}")))?;
        let resp = resp
            .error_for_status()
            .map_err(|e| TranslationUnavailable(format!("http error: {e}")))?;
        let body = resp
            .text()
            .await
            .map_err(|e| TranslationUnavailable(format!("read body: {e}")))?;
        parse_gtx_response(&body)
    }

    fn name(&self) -> &'static str {
        "google-gtx"
    }
}

// src/translate/mod.rs
//! Best-effort translation. Failures never stop an article; callers fall back
//! to the source text.

pub mod google;

use async_trait::async_trait;

use crate::errors::TranslationUnavailable;

pub use google::GoogleTranslator;

/// Target value that turns translation off.
pub const TRANSLATION_DISABLED: &str = "none";

#[async_trait]
pub trait Translator: Send + Sync {
    async fn translate(&self, text: &str, target_lang: &str)
        -> Result<String, TranslationUnavailable>;

    fn name(&self) -> &'static str;
}

/// Returns the input unchanged.
pub struct DisabledTranslator;

#[async_trait]
impl Translator for DisabledTranslator {
    async fn translate(
        &self,
        text: &str,
        _target_lang: &str,
    ) -> Result<String, TranslationUnavailable> {
        Ok(text.to_string())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

pub fn is_disabled(target: Option<&str>) -> bool {
    match target.map(str::trim) {
        None | Some("") => true,
        Some(t) => t.eq_ignore_ascii_case(TRANSLATION_DISABLED),
    }
}

/// Reduce ISO 639-1/-2 codes to the two-letter form where known.
fn lang_base(code: &str) -> String {
    let c = code.trim().to_ascii_lowercase();
    let c = c.split(['-', '_']).next().unwrap_or_default().to_string();
    let mapped = match c.as_str() {
        "eng" => "en",
        "rus" => "ru",
        "ger" | "deu" => "de",
        "fre" | "fra" => "fr",
        "spa" => "es",
        "ita" => "it",
        "por" => "pt",
        "chi" | "zho" => "zh",
        "jpn" => "ja",
        "ukr" => "uk",
        "pol" => "pl",
        _ => return c,
    };
    mapped.to_string()
}

/// True when text in `source_lang` needs no translation into `target`.
pub fn language_matches(source_lang: Option<&str>, target: &str) -> bool {
    match source_lang {
        Some(src) if !src.trim().is_empty() => lang_base(src) == lang_base(target),
        _ => false,
    }
}

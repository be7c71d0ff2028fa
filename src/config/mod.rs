// src/config/mod.rs
//! Run configuration: TOML file → env overrides → validation.

pub mod channel;

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::ConfigError;
use crate::format::{DEFAULT_BUTTON_LABEL, DEFAULT_EXCERPT_CHARS};
use crate::ingest::providers::pubmed::PubMedSettings;
use crate::ledger::DEFAULT_LEDGER_PATH;
use crate::pipeline::{CategoryPlan, PersistMode, PipelineSettings, SourceBinding};
use crate::quota::QuotaPolicy;
use crate::relevance::KeywordFilter;
use crate::translate::{google::DEFAULT_MAX_INPUT_CHARS, is_disabled};

pub use channel::{TelegramConfig, TelegramCredentials};

pub const ENV_CONFIG_PATH: &str = "DIGEST_CONFIG_PATH";
pub const DEFAULT_CONFIG_PATH: &str = "config/digest.toml";

const ENV_DAILY_CAP: &str = "DIGEST_DAILY_CAP";
const ENV_TARGET_LANG: &str = "DIGEST_TARGET_LANG";
const ENV_DRY_RUN: &str = "DIGEST_DRY_RUN";
const ENV_LEDGER_PATH: &str = "DIGEST_LEDGER_PATH";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QuotaConfig {
    pub daily_cap: usize,
    pub per_category_cap: Option<usize>,
    pub class_caps: BTreeMap<String, usize>,
    pub usage_path: Option<PathBuf>,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        let p = QuotaPolicy::default();
        Self {
            daily_cap: p.daily_cap,
            per_category_cap: p.per_category_cap,
            class_caps: p.class_caps,
            usage_path: None,
        }
    }
}

impl QuotaConfig {
    pub fn policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            daily_cap: self.daily_cap,
            per_category_cap: self.per_category_cap,
            class_caps: self.class_caps.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryConfig {
    pub excerpt_chars: usize,
    pub button_label: String,
    pub send_interval_ms: u64,
    pub dry_run: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
            button_label: DEFAULT_BUTTON_LABEL.to_string(),
            send_interval_ms: 2_000,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranslationConfig {
    /// Two-letter code, or "none".
    pub target_language: String,
    pub max_input_chars: usize,
    pub timeout_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            target_language: "none".to_string(),
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
            timeout_secs: 20,
        }
    }
}

impl TranslationConfig {
    pub fn target(&self) -> Option<&str> {
        (!is_disabled(Some(self.target_language.as_str()))).then(|| self.target_language.trim())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LedgerConfig {
    pub path: PathBuf,
    pub persist: PersistMode,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(DEFAULT_LEDGER_PATH),
            persist: PersistMode::Each,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    pub deadline_secs: Option<u64>,
    pub fetch_timeout_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            deadline_secs: None,
            fetch_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            user_agent: concat!("med-digest/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout_secs: 30,
        }
    }
}

impl HttpConfig {
    pub fn client(&self) -> Result<reqwest::Client, ConfigError> {
        reqwest::Client::builder()
            .user_agent(&self.user_agent)
            .timeout(Duration::from_secs(self.timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("http client: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CategoryConfig {
    pub name: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub sources: Vec<SourceBinding>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AppConfig {
    pub telegram: TelegramConfig,
    pub quota: QuotaConfig,
    pub delivery: DeliveryConfig,
    pub translation: TranslationConfig,
    pub ledger: LedgerConfig,
    pub run: RunConfig,
    pub pubmed: PubMedSettings,
    pub http: HttpConfig,
    /// Merged into every category's keywords.
    pub keywords: Vec<String>,
    pub categories: Vec<CategoryConfig>,
}

fn pubmed_category(name: &str, label: &str, query: &str, keywords: &[&str]) -> CategoryConfig {
    CategoryConfig {
        name: name.to_string(),
        label: Some(label.to_string()),
        keywords: keywords.iter().map(|k| k.to_string()).collect(),
        sources: vec![SourceBinding::new("pubmed", query)],
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            telegram: TelegramConfig::default(),
            quota: QuotaConfig::default(),
            delivery: DeliveryConfig::default(),
            translation: TranslationConfig::default(),
            ledger: LedgerConfig::default(),
            run: RunConfig::default(),
            pubmed: PubMedSettings::default(),
            http: HttpConfig::default(),
            keywords: Vec::new(),
            categories: vec![
                pubmed_category(
                    "pulmonology",
                    "🫁 Pulmonology",
                    "pulmonary OR lung OR COPD OR asthma",
                    &["lung", "pulmonary", "asthma", "copd"],
                ),
                pubmed_category(
                    "allergology",
                    "🌿 Allergology",
                    "allergy OR allergic OR rhinitis",
                    &["allergy", "allergic", "rhinitis"],
                ),
                pubmed_category(
                    "therapy",
                    "🩺 Therapy",
                    "clinical treatment OR internal medicine",
                    &["therapy", "treatment", "clinical"],
                ),
            ],
        }
    }
}

fn truthy(v: &str) -> bool {
    matches!(
        v.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl AppConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let s = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&s)
    }

    /// Resolve the file like this:
    /// 1) $DIGEST_CONFIG_PATH (must exist)
    /// 2) config/digest.toml
    /// 3) built-in defaults
    ///
    /// Environment overrides are applied on top; the result is validated.
    pub fn load_default() -> Result<Self, ConfigError> {
        let mut cfg = match std::env::var(ENV_CONFIG_PATH) {
            Ok(p) => {
                let pb = PathBuf::from(p);
                if !pb.exists() {
                    return Err(ConfigError::Invalid(format!(
                        "{ENV_CONFIG_PATH} points to non-existent path {}",
                        pb.display()
                    )));
                }
                Self::load_from(&pb)?
            }
            Err(_) => {
                let p = PathBuf::from(DEFAULT_CONFIG_PATH);
                if p.exists() {
                    Self::load_from(&p)?
                } else {
                    Self::default()
                }
            }
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup(ENV_DAILY_CAP) {
            self.quota.daily_cap = v.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("{ENV_DAILY_CAP} must be a non-negative integer, got `{v}`"))
            })?;
        }
        if let Some(v) = lookup(ENV_TARGET_LANG) {
            self.translation.target_language = v.trim().to_string();
        }
        if let Some(v) = lookup(ENV_DRY_RUN) {
            self.delivery.dry_run = truthy(&v);
        }
        if let Some(v) = lookup(ENV_LEDGER_PATH) {
            if !v.trim().is_empty() {
                self.ledger.path = PathBuf::from(v.trim());
            }
        }
        Ok(())
    }

    /// Checks that need no network and no registered sources. Binding checks
    /// against the source registry happen in `Pipeline::new`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.categories.is_empty() {
            return Err(ConfigError::Invalid("no categories configured".into()));
        }
        if self.delivery.excerpt_chars == 0 {
            return Err(ConfigError::Invalid("delivery.excerpt_chars must be > 0".into()));
        }
        if self.translation.max_input_chars == 0 {
            return Err(ConfigError::Invalid(
                "translation.max_input_chars must be > 0".into(),
            ));
        }
        if !self.delivery.dry_run {
            self.telegram.credentials()?;
        }
        Ok(())
    }

    /// `None` in dry-run mode.
    pub fn telegram_credentials(&self) -> Result<Option<TelegramCredentials>, ConfigError> {
        if self.delivery.dry_run {
            return Ok(None);
        }
        self.telegram.credentials().map(Some)
    }

    pub fn persist_mode(&self) -> PersistMode {
        if self.delivery.dry_run {
            PersistMode::Never
        } else {
            self.ledger.persist
        }
    }

    pub fn plan(&self) -> Vec<CategoryPlan> {
        let global = KeywordFilter::new(&self.keywords);
        self.categories
            .iter()
            .map(|c| {
                let mut plan = CategoryPlan::new(c.name.trim())
                    .keywords(global.merged(&KeywordFilter::new(&c.keywords)));
                if let Some(l) = c.label.as_deref().filter(|l| !l.trim().is_empty()) {
                    plan = plan.label(l);
                }
                plan.bindings = c.sources.clone();
                plan
            })
            .collect()
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            quota: self.quota.policy(),
            usage_path: self.quota.usage_path.clone(),
            target_language: self.translation.target().map(str::to_string),
            excerpt_chars: self.delivery.excerpt_chars,
            button_label: self.delivery.button_label.clone(),
            send_interval: Duration::from_millis(self.delivery.send_interval_ms),
            persist: self.persist_mode(),
            fetch_timeout: Duration::from_secs(self.run.fetch_timeout_secs),
            translate_timeout: Duration::from_secs(self.translation.timeout_secs + 5),
            deliver_timeout: Duration::from_secs(
                self.telegram.timeout_secs * u64::from(self.telegram.retries.max(1)) + 10,
            ),
            deadline: self.run.deadline_secs.map(Duration::from_secs),
        }
    }
}

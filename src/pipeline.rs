//! pipeline.rs: one digest run.
//!
//! categories → bindings → candidates, strictly in declaration order. For each
//! candidate: identity key → ledger → attempted-this-run → relevance → quota →
//! translate → format → deliver → record. Only a successful delivery touches the
//! ledger and the quota, so a failed item stays eligible for the next run.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::{ConfigError, PipelineError, SourceUnavailable};
use crate::format::{format_message, DEFAULT_BUTTON_LABEL, DEFAULT_EXCERPT_CHARS};
use crate::ingest::types::Article;
use crate::ingest::SourceRegistry;
use crate::ledger::{DeliveryLedger, LedgerStore};
use crate::notify::Notifier;
use crate::quota::{self, Admission, DailyUsage, QuotaAllocator, QuotaPolicy};
use crate::relevance::KeywordFilter;
use crate::translate::{language_matches, Translator};

fn default_class() -> String {
    "primary".to_string()
}

fn default_limit() -> usize {
    10
}

/// One source queried for one category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceBinding {
    /// Registered source name, e.g. "pubmed" or "rss".
    pub source: String,
    /// Search term (PubMed) or feed URL (RSS).
    pub query: String,
    /// Source class for sub-quotas.
    #[serde(default = "default_class")]
    pub class: String,
    #[serde(default = "default_limit")]
    pub limit: usize,
    /// Overrides the source's default (on for broad feeds, off for searches).
    #[serde(default)]
    pub relevance_filter: Option<bool>,
}

impl SourceBinding {
    pub fn new(source: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            query: query.into(),
            class: default_class(),
            limit: default_limit(),
            relevance_filter: None,
        }
    }

    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn relevance_filter(mut self, on: bool) -> Self {
        self.relevance_filter = Some(on);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryPlan {
    pub name: String,
    pub label: String,
    pub keywords: KeywordFilter,
    pub bindings: Vec<SourceBinding>,
}

impl CategoryPlan {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            label: name.clone(),
            name,
            keywords: KeywordFilter::default(),
            bindings: Vec::new(),
        }
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn keywords(mut self, keywords: KeywordFilter) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn source(mut self, binding: SourceBinding) -> Self {
        self.bindings.push(binding);
        self
    }
}

/// When the ledger is written back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PersistMode {
    /// After every successful delivery and at run end.
    #[default]
    Each,
    /// Once, at run end.
    End,
    /// Never (dry runs).
    Never,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub quota: QuotaPolicy,
    /// Shares the cap across runs on the same UTC day when set.
    pub usage_path: Option<PathBuf>,
    /// `None` disables translation.
    pub target_language: Option<String>,
    pub excerpt_chars: usize,
    pub button_label: String,
    /// Pause between two delivery attempts.
    pub send_interval: Duration,
    pub persist: PersistMode,
    pub fetch_timeout: Duration,
    pub translate_timeout: Duration,
    pub deliver_timeout: Duration,
    /// Whole-run budget, checked between candidates.
    pub deadline: Option<Duration>,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            quota: QuotaPolicy::default(),
            usage_path: None,
            target_language: None,
            excerpt_chars: DEFAULT_EXCERPT_CHARS,
            button_label: DEFAULT_BUTTON_LABEL.to_string(),
            send_interval: Duration::ZERO,
            persist: PersistMode::Each,
            fetch_timeout: Duration::from_secs(30),
            translate_timeout: Duration::from_secs(25),
            deliver_timeout: Duration::from_secs(30),
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    Completed,
    GlobalCapReached,
    DeadlineExceeded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CategoryTally {
    pub name: String,
    pub delivered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveredItem {
    pub category: String,
    pub source: String,
    pub class: String,
    pub key: String,
    pub link: String,
}

/// Observable outcome of a run. Zero deliveries is a valid result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub delivered: Vec<DeliveredItem>,
    /// Declaration order, every category listed.
    pub by_category: Vec<CategoryTally>,
    pub by_class: BTreeMap<String, usize>,
    pub candidates: usize,
    pub skipped_duplicate: usize,
    pub skipped_attempted: usize,
    pub skipped_irrelevant: usize,
    pub skipped_malformed: usize,
    pub skipped_quota: usize,
    pub delivery_failures: usize,
    pub translation_fallbacks: usize,
    pub source_errors: Vec<String>,
    pub stop_reason: StopReason,
    pub ledger_size: usize,
    pub persist_error: Option<String>,
}

impl RunReport {
    pub fn total_delivered(&self) -> usize {
        self.delivered.len()
    }

    pub fn delivered_in(&self, category: &str) -> usize {
        self.by_category
            .iter()
            .find(|t| t.name == category)
            .map_or(0, |t| t.delivered)
    }

    pub fn summary(&self) -> String {
        let mut out = if self.total_delivered() == 0 {
            "no new articles delivered".to_string()
        } else {
            let per_cat: Vec<String> = self
                .by_category
                .iter()
                .filter(|t| t.delivered > 0)
                .map(|t| format!("{} {}", t.name, t.delivered))
                .collect();
            format!(
                "delivered {} article(s): {}",
                self.total_delivered(),
                per_cat.join(", ")
            )
        };
        if self.delivery_failures > 0 {
            out.push_str(&format!("; {} delivery failure(s)", self.delivery_failures));
        }
        if !self.source_errors.is_empty() {
            out.push_str(&format!("; {} source error(s)", self.source_errors.len()));
        }
        match self.stop_reason {
            StopReason::Completed => {}
            StopReason::GlobalCapReached => out.push_str("; daily cap reached"),
            StopReason::DeadlineExceeded => out.push_str("; run deadline exceeded"),
        }
        if self.persist_error.is_some() {
            out.push_str("; LEDGER NOT SAVED");
        }
        out
    }
}

/// Mutable state of a single run. Nothing outlives it except what is persisted.
pub struct RunContext {
    pub ledger: DeliveryLedger,
    pub quota: QuotaAllocator,
    pub report: RunReport,
    attempted: HashSet<String>,
    dirty: bool,
    last_attempt: Option<Instant>,
    deadline: Option<Instant>,
    today: NaiveDate,
}

impl RunContext {
    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}

enum Flow {
    Continue,
    NextCategory,
    Stop(StopReason),
}

pub struct Pipeline {
    categories: Vec<CategoryPlan>,
    sources: SourceRegistry,
    translator: Arc<dyn Translator>,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn LedgerStore>,
    settings: PipelineSettings,
}

impl Pipeline {
    /// Rejects plans that would misbehave at run time (unknown sources, empty
    /// queries, filtered bindings without keywords).
    pub fn new(
        categories: Vec<CategoryPlan>,
        sources: SourceRegistry,
        translator: Arc<dyn Translator>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn LedgerStore>,
        settings: PipelineSettings,
    ) -> Result<Self, ConfigError> {
        validate_plan(&categories, &sources)?;
        if settings.excerpt_chars == 0 {
            return Err(ConfigError::Invalid("excerpt_chars must be > 0".into()));
        }
        Ok(Self {
            categories,
            sources,
            translator,
            notifier,
            store,
            settings,
        })
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn categories(&self) -> &[CategoryPlan] {
        &self.categories
    }

    /// Load → process → persist → report. Errors only if the ledger cannot be loaded.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        crate::metrics::ensure_described();
        let ledger = self.store.load()?;
        info!(
            ledger = ledger.len(),
            categories = self.categories.len(),
            cap = self.settings.quota.daily_cap,
            notifier = self.notifier.name(),
            "digest run started"
        );
        let mut ctx = self.start(ledger);
        self.process(&mut ctx).await;
        Ok(self.finish(ctx))
    }

    fn start(&self, ledger: DeliveryLedger) -> RunContext {
        let today = quota::today();
        let quota = match &self.settings.usage_path {
            Some(p) => {
                let usage = DailyUsage::load_for(p, today);
                if usage.total > 0 {
                    info!(used = usage.total, "resuming today's usage");
                }
                QuotaAllocator::resume(self.settings.quota.clone(), &usage)
            }
            None => QuotaAllocator::new(self.settings.quota.clone()),
        };
        let report = RunReport {
            by_category: self
                .categories
                .iter()
                .map(|c| CategoryTally {
                    name: c.name.clone(),
                    delivered: 0,
                })
                .collect(),
            ..RunReport::default()
        };
        RunContext {
            ledger,
            quota,
            report,
            attempted: HashSet::new(),
            dirty: false,
            last_attempt: None,
            deadline: self.settings.deadline.map(|d| Instant::now() + d),
            today,
        }
    }

    async fn process(&self, ctx: &mut RunContext) {
        'categories: for cat in &self.categories {
            for binding in &cat.bindings {
                let flow = self.process_binding(ctx, cat, binding).await;
                match flow {
                    Flow::Continue => {}
                    Flow::NextCategory => continue 'categories,
                    Flow::Stop(reason) => {
                        ctx.report.stop_reason = reason;
                        break 'categories;
                    }
                }
            }
        }
    }

    async fn process_binding(
        &self,
        ctx: &mut RunContext,
        cat: &CategoryPlan,
        binding: &SourceBinding,
    ) -> Flow {
        if ctx.deadline_passed() {
            return Flow::Stop(StopReason::DeadlineExceeded);
        }
        // Skip the fetch entirely when nothing from it could be delivered.
        match ctx.quota.admit(&cat.name, &binding.class) {
            Admission::Granted => {}
            Admission::GlobalExhausted => return Flow::Stop(StopReason::GlobalCapReached),
            Admission::ClassExhausted => {
                debug!(category = %cat.name, class = %binding.class, "class budget spent, source skipped");
                return Flow::Continue;
            }
            Admission::CategoryExhausted => return Flow::NextCategory,
        }

        let Some(source) = self.sources.get(&binding.source) else {
            // validated in `new`; only reachable if the registry was altered
            warn!(source = %binding.source, "unknown source");
            return Flow::Continue;
        };
        let filter = binding.relevance_filter.unwrap_or(!source.query_scoped());

        let t0 = Instant::now();
        let fetched = tokio::time::timeout(
            self.settings.fetch_timeout,
            source.fetch(&cat.name, &binding.query, binding.limit),
        )
        .await
        .unwrap_or_else(|_| {
            Err(SourceUnavailable::new(
                source.name(),
                format!("timed out after {:?}", self.settings.fetch_timeout),
            ))
        });
        histogram!("digest_fetch_ms").record(t0.elapsed().as_secs_f64() * 1_000.0);

        let candidates = match fetched {
            Ok(v) => v,
            Err(e) => {
                warn!(category = %cat.name, error = %e, "source error");
                counter!("digest_source_errors_total", "source" => binding.source.clone())
                    .increment(1);
                ctx.report.source_errors.push(e.to_string());
                return Flow::Continue;
            }
        };
        debug!(category = %cat.name, source = %binding.source, n = candidates.len(), "candidates fetched");

        for art in candidates.into_iter().take(binding.limit) {
            if ctx.deadline_passed() {
                return Flow::Stop(StopReason::DeadlineExceeded);
            }
            if let Some(flow) = self.process_candidate(ctx, cat, binding, filter, art).await {
                return flow;
            }
        }
        Flow::Continue
    }

    /// `Some(flow)` ends the current binding.
    async fn process_candidate(
        &self,
        ctx: &mut RunContext,
        cat: &CategoryPlan,
        binding: &SourceBinding,
        filter: bool,
        art: Article,
    ) -> Option<Flow> {
        ctx.report.candidates += 1;
        counter!("digest_candidates_total").increment(1);

        let Some(key) = art.identity_key().map(str::to_string) else {
            debug!(source = %binding.source, title = %art.title, "candidate without identity skipped");
            ctx.report.skipped_malformed += 1;
            skipped("malformed");
            return None;
        };
        if ctx.ledger.contains(&key) {
            debug!(%key, "already delivered");
            ctx.report.skipped_duplicate += 1;
            skipped("duplicate");
            return None;
        }
        if ctx.attempted.contains(&key) {
            debug!(%key, "already attempted this run");
            ctx.report.skipped_attempted += 1;
            skipped("attempted");
            return None;
        }
        if filter {
            let rel = cat.keywords.evaluate(&art.title, &art.body);
            if !rel.passed() {
                debug!(%key, "not relevant");
                ctx.report.skipped_irrelevant += 1;
                skipped("irrelevant");
                return None;
            }
            debug!(%key, matched = ?rel.matched, "relevant");
        }
        match ctx.quota.admit(&cat.name, &binding.class) {
            Admission::Granted => {}
            other => {
                ctx.report.skipped_quota += 1;
                skipped("quota");
                return Some(match other {
                    Admission::GlobalExhausted => Flow::Stop(StopReason::GlobalCapReached),
                    Admission::CategoryExhausted => Flow::NextCategory,
                    _ => Flow::Continue,
                });
            }
        }

        ctx.attempted.insert(key.clone());
        let (title, body) = self.translated(&mut ctx.report, &art).await;
        let msg = format_message(&cat.label, &title, &body, &art.link, self.settings.excerpt_chars);
        let button = msg.button(&self.settings.button_label);

        if let Some(last) = ctx.last_attempt {
            let since = last.elapsed();
            if since < self.settings.send_interval {
                tokio::time::sleep(self.settings.send_interval - since).await;
            }
        }
        ctx.last_attempt = Some(Instant::now());

        let outcome = tokio::time::timeout(
            self.settings.deliver_timeout,
            self.notifier.deliver(&msg, button.as_ref()),
        )
        .await;
        match outcome {
            Ok(Ok(())) => self.record_delivery(ctx, cat, binding, &art, key),
            Ok(Err(e)) => {
                warn!(%key, category = %cat.name, error = %e, "delivery failed");
                ctx.report.delivery_failures += 1;
                counter!("digest_delivery_failures_total").increment(1);
            }
            Err(_) => {
                warn!(%key, category = %cat.name, "delivery timed out");
                ctx.report.delivery_failures += 1;
                counter!("digest_delivery_failures_total").increment(1);
            }
        }

        ctx.quota
            .is_exhausted()
            .then_some(Flow::Stop(StopReason::GlobalCapReached))
    }

    async fn translated(&self, report: &mut RunReport, art: &Article) -> (String, String) {
        let Some(target) = self.settings.target_language.as_deref() else {
            return (art.title.clone(), art.body.clone());
        };
        if language_matches(art.language.as_deref(), target) {
            return (art.title.clone(), art.body.clone());
        }
        let title = self.translate_or_original(report, &art.title, target).await;
        let body = self.translate_or_original(report, &art.body, target).await;
        (title, body)
    }

    async fn translate_or_original(&self, report: &mut RunReport, text: &str, target: &str) -> String {
        let res = tokio::time::timeout(
            self.settings.translate_timeout,
            self.translator.translate(text, target),
        )
        .await;
        match res {
            Ok(Ok(t)) => t,
            Ok(Err(e)) => {
                warn!(translator = self.translator.name(), error = %e, "translation fell back to source text");
                report.translation_fallbacks += 1;
                counter!("digest_translation_fallbacks_total").increment(1);
                text.to_string()
            }
            Err(_) => {
                warn!(translator = self.translator.name(), "translation timed out, using source text");
                report.translation_fallbacks += 1;
                counter!("digest_translation_fallbacks_total").increment(1);
                text.to_string()
            }
        }
    }

    fn record_delivery(
        &self,
        ctx: &mut RunContext,
        cat: &CategoryPlan,
        binding: &SourceBinding,
        art: &Article,
        key: String,
    ) {
        ctx.ledger.add(key.clone());
        ctx.quota.record(&cat.name, &binding.class);
        ctx.dirty = true;

        if let Some(t) = ctx.report.by_category.iter_mut().find(|t| t.name == cat.name) {
            t.delivered += 1;
        }
        *ctx.report.by_class.entry(binding.class.clone()).or_insert(0) += 1;
        ctx.report.delivered.push(DeliveredItem {
            category: cat.name.clone(),
            source: binding.source.clone(),
            class: binding.class.clone(),
            key: key.clone(),
            link: art.link.clone(),
        });
        counter!(
            "digest_delivered_total",
            "category" => cat.name.clone(),
            "class" => binding.class.clone()
        )
        .increment(1);
        info!(%key, category = %cat.name, source = %binding.source, used = ctx.quota.consumed(), "delivered");

        if self.settings.persist == PersistMode::Each {
            match self.store.persist(&ctx.ledger) {
                Ok(()) => {
                    ctx.dirty = false;
                    self.save_usage(ctx);
                }
                Err(e) => warn!(error = %e, "incremental ledger persist failed; retrying at run end"),
            }
        }
    }

    /// Only called right after the ledger was saved, so the stored usage never
    /// counts deliveries the stored ledger does not know about.
    fn save_usage(&self, ctx: &RunContext) {
        if let Some(p) = &self.settings.usage_path {
            if let Err(e) = ctx.quota.usage_for(ctx.today).save(p) {
                warn!(path = %p.display(), error = %e, "daily usage not saved");
            }
        }
    }

    fn finish(&self, mut ctx: RunContext) -> RunReport {
        if ctx.dirty && self.settings.persist != PersistMode::Never {
            match self.store.persist(&ctx.ledger) {
                Ok(()) => {
                    ctx.dirty = false;
                    self.save_usage(&ctx);
                }
                Err(e) => {
                    tracing::error!(error = %e, "ledger persist failed");
                    ctx.report.persist_error = Some(e.to_string());
                }
            }
        }
        ctx.report.ledger_size = ctx.ledger.len();
        info!(
            delivered = ctx.report.total_delivered(),
            candidates = ctx.report.candidates,
            duplicates = ctx.report.skipped_duplicate,
            irrelevant = ctx.report.skipped_irrelevant,
            failures = ctx.report.delivery_failures,
            source_errors = ctx.report.source_errors.len(),
            stop = ?ctx.report.stop_reason,
            "{}",
            ctx.report.summary()
        );
        ctx.report
    }
}

fn skipped(reason: &'static str) {
    counter!("digest_skipped_total", "reason" => reason).increment(1);
}

fn validate_plan(categories: &[CategoryPlan], sources: &SourceRegistry) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for cat in categories {
        if cat.name.trim().is_empty() {
            return Err(ConfigError::Invalid("category with empty name".into()));
        }
        if !seen.insert(cat.name.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate category `{}`",
                cat.name
            )));
        }
        for b in &cat.bindings {
            let Some(src) = sources.get(&b.source) else {
                let known: Vec<&str> = sources.names().collect();
                return Err(ConfigError::Invalid(format!(
                    "category `{}` uses unknown source `{}` (known: {})",
                    cat.name,
                    b.source,
                    known.join(", ")
                )));
            };
            if b.query.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "category `{}` source `{}` has an empty query",
                    cat.name, b.source
                )));
            }
            if b.limit == 0 {
                return Err(ConfigError::Invalid(format!(
                    "category `{}` source `{}` has limit 0",
                    cat.name, b.source
                )));
            }
            let filtered = b.relevance_filter.unwrap_or(!src.query_scoped());
            if filtered && cat.keywords.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "category `{}` filters `{}` by keywords but has none",
                    cat.name, b.source
                )));
            }
        }
    }
    Ok(())
}

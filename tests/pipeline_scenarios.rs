// tests/pipeline_scenarios.rs
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use med_digest::errors::{
    ConfigError, DeliveryFailed, PipelineError, SourceUnavailable, TranslationUnavailable,
};
use med_digest::format::{FormattedMessage, ReadMoreButton};
use med_digest::ingest::types::{Article, ArticleSource};
use med_digest::ingest::SourceRegistry;
use med_digest::ledger::{JsonFileStore, LedgerStore, MemoryStore};
use med_digest::notify::Notifier;
use med_digest::pipeline::{
    CategoryPlan, PersistMode, Pipeline, PipelineSettings, SourceBinding, StopReason,
};
use med_digest::quota::QuotaPolicy;
use med_digest::relevance::KeywordFilter;
use med_digest::translate::{DisabledTranslator, Translator};

// ---------- mocks ----------

fn art(id: &str, title: &str, body: &str) -> Article {
    Article {
        source: "mock".into(),
        category: String::new(),
        title: title.into(),
        body: body.into(),
        link: format!("https://pubmed.ncbi.nlm.nih.gov/{id}/"),
        external_id: Some(id.into()),
        language: Some("eng".into()),
        published_at: None,
    }
}

fn arts(ids: &[&str]) -> Vec<Article> {
    ids.iter()
        .map(|id| art(id, &format!("Title {id}"), "COPD body"))
        .collect()
}

/// Returns a fixed list; can be swapped between runs.
struct ListSource {
    name: &'static str,
    scoped: bool,
    items: Mutex<Vec<Article>>,
    calls: AtomicUsize,
}

impl ListSource {
    fn new(name: &'static str, items: Vec<Article>) -> Arc<Self> {
        Arc::new(Self {
            name,
            scoped: true,
            items: Mutex::new(items),
            calls: AtomicUsize::new(0),
        })
    }

    fn unscoped(name: &'static str, items: Vec<Article>) -> Arc<Self> {
        Arc::new(Self {
            name,
            scoped: false,
            items: Mutex::new(items),
            calls: AtomicUsize::new(0),
        })
    }

    fn set(&self, items: Vec<Article>) {
        *self.items.lock().unwrap() = items;
    }
}

#[async_trait]
impl ArticleSource for ListSource {
    async fn fetch(
        &self,
        category: &str,
        _query: &str,
        limit: usize,
    ) -> Result<Vec<Article>, SourceUnavailable> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .items
            .lock()
            .unwrap()
            .iter()
            .take(limit)
            .cloned()
            .map(|mut a| {
                a.category = category.to_string();
                a.source = self.name.to_string();
                a
            })
            .collect())
    }
    fn name(&self) -> &str {
        self.name
    }
    fn query_scoped(&self) -> bool {
        self.scoped
    }
}

struct DownSource;

#[async_trait]
impl ArticleSource for DownSource {
    async fn fetch(&self, _: &str, _: &str, _: usize) -> Result<Vec<Article>, SourceUnavailable> {
        Err(SourceUnavailable::new("down", "connection refused"))
    }
    fn name(&self) -> &str {
        "down"
    }
    fn query_scoped(&self) -> bool {
        true
    }
}

/// Records every attempt; fails for links in `fail`.
#[derive(Default)]
struct RecordingNotifier {
    attempts: Mutex<Vec<FormattedMessage>>,
    buttons: Mutex<Vec<Option<ReadMoreButton>>>,
    fail: Mutex<HashSet<String>>,
}

impl RecordingNotifier {
    fn failing(links: &[&str]) -> Arc<Self> {
        let n = Self::default();
        *n.fail.lock().unwrap() = links.iter().map(|s| s.to_string()).collect();
        Arc::new(n)
    }
    fn clear_failures(&self) {
        self.fail.lock().unwrap().clear();
    }
    fn texts(&self) -> Vec<String> {
        self.attempts
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.text.clone())
            .collect()
    }
    fn attempt_count(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn deliver(
        &self,
        message: &FormattedMessage,
        button: Option<&ReadMoreButton>,
    ) -> Result<(), DeliveryFailed> {
        self.attempts.lock().unwrap().push(message.clone());
        self.buttons.lock().unwrap().push(button.cloned());
        if self.fail.lock().unwrap().contains(&message.link) {
            return Err(DeliveryFailed::new("telegram 400: chat not found"));
        }
        Ok(())
    }
    fn name(&self) -> &'static str {
        "recording"
    }
}

/// Never answers within any sane timeout.
struct HangingSource;

#[async_trait]
impl ArticleSource for HangingSource {
    async fn fetch(&self, _: &str, _: &str, _: usize) -> Result<Vec<Article>, SourceUnavailable> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(Vec::new())
    }
    fn name(&self) -> &str {
        "hanging"
    }
    fn query_scoped(&self) -> bool {
        true
    }
}

/// Succeeds after `delay`.
struct SlowNotifier {
    delay: Duration,
    sent: AtomicUsize,
}

impl SlowNotifier {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            sent: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Notifier for SlowNotifier {
    async fn deliver(&self, _: &FormattedMessage, _: Option<&ReadMoreButton>) -> Result<(), DeliveryFailed> {
        tokio::time::sleep(self.delay).await;
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
    fn name(&self) -> &'static str {
        "slow"
    }
}

/// Notes whether the usage file already existed at each send.
struct UsageWatcher {
    path: std::path::PathBuf,
    seen: Mutex<Vec<bool>>,
}

#[async_trait]
impl Notifier for UsageWatcher {
    async fn deliver(&self, _: &FormattedMessage, _: Option<&ReadMoreButton>) -> Result<(), DeliveryFailed> {
        self.seen.lock().unwrap().push(self.path.exists());
        Ok(())
    }
    fn name(&self) -> &'static str {
        "usage-watcher"
    }
}

struct PrefixTranslator;

#[async_trait]
impl Translator for PrefixTranslator {
    async fn translate(&self, text: &str, lang: &str) -> Result<String, TranslationUnavailable> {
        Ok(format!("[{lang}] {text}"))
    }
    fn name(&self) -> &'static str {
        "prefix"
    }
}

struct BrokenTranslator;

#[async_trait]
impl Translator for BrokenTranslator {
    async fn translate(&self, _: &str, _: &str) -> Result<String, TranslationUnavailable> {
        Err(TranslationUnavailable("503 from upstream".into()))
    }
    fn name(&self) -> &'static str {
        "broken"
    }
}

fn link(id: &str) -> String {
    format!("https://pubmed.ncbi.nlm.nih.gov/{id}/")
}

fn settings(cap: usize) -> PipelineSettings {
    PipelineSettings {
        quota: QuotaPolicy::with_cap(cap),
        ..PipelineSettings::default()
    }
}

fn one_category(source: &str) -> Vec<CategoryPlan> {
    vec![CategoryPlan::new("pulmonology")
        .label("Pulmonology")
        .keywords(KeywordFilter::new(["copd", "lung"]))
        .source(SourceBinding::new(source, "copd"))]
}

fn pipeline(
    plan: Vec<CategoryPlan>,
    sources: SourceRegistry,
    notifier: Arc<dyn Notifier>,
    store: Arc<dyn LedgerStore>,
    settings: PipelineSettings,
) -> Pipeline {
    Pipeline::new(
        plan,
        sources,
        Arc::new(DisabledTranslator),
        notifier,
        store,
        settings,
    )
    .expect("valid plan")
}

// ---------- scenarios ----------

#[tokio::test]
async fn cap_two_then_next_day_batch() {
    let src = ListSource::new("pubmed", arts(&["L1", "L2", "L3"]));
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(src.clone()),
        notifier.clone(),
        store.clone(),
        settings(2),
    );

    let r1 = p.run().await.unwrap();
    assert_eq!(r1.total_delivered(), 2);
    assert_eq!(r1.stop_reason, StopReason::GlobalCapReached);
    let keys: Vec<_> = r1.delivered.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, ["L1", "L2"]);
    assert!(store.snapshot().contains("L1") && store.snapshot().contains("L2"));
    assert!(!store.snapshot().contains("L3"));

    src.set(arts(&["L2", "L3", "L4"]));
    let r2 = p.run().await.unwrap();
    let keys: Vec<_> = r2.delivered.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, ["L3", "L4"]);
    assert_eq!(r2.skipped_duplicate, 1);
    let ledger = store.snapshot();
    assert_eq!(ledger.len(), 4);
    assert_eq!(r2.ledger_size, 4);
}

#[tokio::test]
async fn second_run_over_same_data_delivers_nothing() {
    let src = ListSource::new("pubmed", arts(&["A", "B", "C"]));
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(src),
        notifier.clone(),
        store.clone(),
        settings(10),
    );

    let first = p.run().await.unwrap();
    assert_eq!(first.total_delivered(), 3);
    assert_eq!(first.stop_reason, StopReason::Completed);

    let second = p.run().await.unwrap();
    assert_eq!(second.total_delivered(), 0);
    assert_eq!(second.skipped_duplicate, 3);
    assert_eq!(notifier.attempt_count(), 3);
    assert_eq!(second.summary(), "no new articles delivered");
}

#[tokio::test]
async fn failed_delivery_is_not_recorded_and_does_not_use_quota() {
    let src = ListSource::new("pubmed", arts(&["L1", "L2", "L3"]));
    let store = Arc::new(MemoryStore::new());
    let notifier = RecordingNotifier::failing(&[&link("L2")]);
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(src),
        notifier.clone(),
        store.clone(),
        settings(2),
    );

    let r = p.run().await.unwrap();
    assert_eq!(r.delivery_failures, 1);
    let keys: Vec<_> = r.delivered.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, ["L1", "L3"]);
    assert!(!store.snapshot().contains("L2"));

    // eligible again next run
    notifier.clear_failures();
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["L2"]))),
        notifier.clone(),
        store.clone(),
        settings(2),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 1);
    assert!(store.snapshot().contains("L2"));
}

#[tokio::test]
async fn translation_failure_falls_back_to_source_text() {
    let src = ListSource::new("pubmed", arts(&["T1"]));
    let notifier = Arc::new(RecordingNotifier::default());
    let store = Arc::new(MemoryStore::new());
    let p = Pipeline::new(
        one_category("pubmed"),
        SourceRegistry::new().with(src),
        Arc::new(BrokenTranslator),
        notifier.clone(),
        store.clone(),
        PipelineSettings {
            target_language: Some("ru".into()),
            ..settings(5)
        },
    )
    .unwrap();

    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 1);
    assert_eq!(r.translation_fallbacks, 2);
    assert!(notifier.texts()[0].contains("<b>Title T1</b>"));
    assert!(store.snapshot().contains("T1"));
}

#[tokio::test]
async fn translation_applies_unless_language_already_matches() {
    let mut russian = art("R1", "Астма", "Текст");
    russian.language = Some("rus".into());
    let src = ListSource::new("pubmed", vec![art("E1", "Asthma", "COPD text"), russian]);
    let notifier = Arc::new(RecordingNotifier::default());
    let p = Pipeline::new(
        one_category("pubmed"),
        SourceRegistry::new().with(src),
        Arc::new(PrefixTranslator),
        notifier.clone(),
        Arc::new(MemoryStore::new()),
        PipelineSettings {
            target_language: Some("ru".into()),
            ..settings(5)
        },
    )
    .unwrap();

    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 2);
    let texts = notifier.texts();
    assert!(texts[0].contains("<b>[ru] Asthma</b>"));
    assert!(texts[0].contains("[ru] COPD text"));
    assert!(texts[1].contains("<b>Астма</b>"));
    assert_eq!(r.translation_fallbacks, 0);
}

#[tokio::test]
async fn message_carries_label_and_read_more_button() {
    let src = ListSource::new("pubmed", arts(&["M1"]));
    let notifier = Arc::new(RecordingNotifier::default());
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(src),
        notifier.clone(),
        Arc::new(MemoryStore::new()),
        PipelineSettings {
            button_label: "Open".into(),
            ..settings(5)
        },
    );
    p.run().await.unwrap();

    assert!(notifier.texts()[0].starts_with("Pulmonology\n\n<b>Title M1</b>"));
    let buttons = notifier.buttons.lock().unwrap();
    let b = buttons[0].as_ref().unwrap();
    assert_eq!(b.label, "Open");
    assert_eq!(b.url, link("M1"));
}

#[tokio::test]
async fn source_error_does_not_stop_other_bindings() {
    let plan = vec![CategoryPlan::new("pulmonology")
        .source(SourceBinding::new("down", "copd"))
        .source(SourceBinding::new("pubmed", "copd"))];
    let sources = SourceRegistry::new()
        .with(Arc::new(DownSource))
        .with(ListSource::new("pubmed", arts(&["S1"])));
    let p = pipeline(
        plan,
        sources,
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        settings(5),
    );

    let r = p.run().await.unwrap();
    assert_eq!(r.source_errors.len(), 1);
    assert!(r.source_errors[0].contains("down"));
    assert_eq!(r.total_delivered(), 1);
    assert!(r.summary().contains("1 source error(s)"));
}

#[tokio::test]
async fn broad_feed_is_filtered_by_keywords() {
    let feed = ListSource::unscoped(
        "rss",
        vec![
            art("U1", "Unrelated", "Hospital parking"),
            art("C1", "COPD update", "Inhaled therapy"),
        ],
    );
    let p = pipeline(
        one_category("rss"),
        SourceRegistry::new().with(feed),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        settings(5),
    );

    let r = p.run().await.unwrap();
    assert_eq!(r.skipped_irrelevant, 1);
    let keys: Vec<_> = r.delivered.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, ["C1"]);
}

#[tokio::test]
async fn explicit_filter_override_applies_to_search_source() {
    let plan = vec![CategoryPlan::new("pulmonology")
        .keywords(KeywordFilter::new(["lung"]))
        .source(SourceBinding::new("pubmed", "copd").relevance_filter(true))];
    let p = pipeline(
        plan,
        SourceRegistry::new().with(ListSource::new(
            "pubmed",
            vec![art("X1", "Kidney", "Renal"), art("X2", "Lung", "")],
        )),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        settings(5),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.skipped_irrelevant, 1);
    assert_eq!(r.total_delivered(), 1);
}

#[tokio::test]
async fn class_cap_stops_only_its_binding() {
    let plan = vec![CategoryPlan::new("pulmonology")
        .keywords(KeywordFilter::new(["copd"]))
        .source(SourceBinding::new("feed", "https://feed").class("secondary"))
        .source(SourceBinding::new("pubmed", "copd"))];
    let sources = SourceRegistry::new()
        .with(ListSource::new("feed", arts(&["F1", "F2", "F3"])))
        .with(ListSource::new("pubmed", arts(&["P1", "P2"])));
    let mut s = settings(5);
    s.quota.class_caps.insert("secondary".into(), 1);
    let p = pipeline(
        plan,
        sources,
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        s,
    );

    let r = p.run().await.unwrap();
    let keys: Vec<_> = r.delivered.iter().map(|d| d.key.as_str()).collect();
    assert_eq!(keys, ["F1", "P1", "P2"]);
    assert_eq!(r.by_class.get("secondary"), Some(&1));
    assert_eq!(r.by_class.get("primary"), Some(&2));
    assert_eq!(r.skipped_quota, 1);
    assert_eq!(r.stop_reason, StopReason::Completed);
}

#[tokio::test]
async fn global_cap_wins_over_larger_class_caps() {
    let mut s = settings(2);
    s.quota.class_caps.insert("primary".into(), 10);
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A", "B", "C", "D"]))),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        s,
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 2);
}

#[tokio::test]
async fn per_category_share_leaves_budget_for_later_categories() {
    let plan = vec![
        CategoryPlan::new("pulmonology").source(SourceBinding::new("pubmed", "copd")),
        CategoryPlan::new("allergology").source(SourceBinding::new("allergy", "rhinitis")),
    ];
    let sources = SourceRegistry::new()
        .with(ListSource::new("pubmed", arts(&["P1", "P2", "P3"])))
        .with(ListSource::new("allergy", arts(&["A1", "A2"])));
    let s = PipelineSettings {
        quota: QuotaPolicy {
            daily_cap: 3,
            per_category_cap: Some(2),
            ..QuotaPolicy::default()
        },
        ..PipelineSettings::default()
    };
    let p = pipeline(
        plan,
        sources,
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        s,
    );

    let r = p.run().await.unwrap();
    assert_eq!(r.delivered_in("pulmonology"), 2);
    assert_eq!(r.delivered_in("allergology"), 1);
    assert_eq!(r.stop_reason, StopReason::GlobalCapReached);
    // declaration order is kept in the report
    let names: Vec<_> = r.by_category.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["pulmonology", "allergology"]);
}

#[tokio::test]
async fn exhausted_cap_skips_remaining_fetches() {
    let first = ListSource::new("pubmed", arts(&["A"]));
    let second = ListSource::new("other", arts(&["B"]));
    let plan = vec![
        CategoryPlan::new("one").source(SourceBinding::new("pubmed", "q")),
        CategoryPlan::new("two").source(SourceBinding::new("other", "q")),
    ];
    let p = pipeline(
        plan,
        SourceRegistry::new().with(first.clone()).with(second.clone()),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        settings(1),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 1);
    assert_eq!(second.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn zero_cap_delivers_nothing() {
    let notifier = Arc::new(RecordingNotifier::default());
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A"]))),
        notifier.clone(),
        Arc::new(MemoryStore::new()),
        settings(0),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 0);
    assert_eq!(notifier.attempt_count(), 0);
    assert_eq!(r.stop_reason, StopReason::GlobalCapReached);
}

#[tokio::test]
async fn key_attempted_once_per_run_across_categories() {
    let plan = vec![
        CategoryPlan::new("one").source(SourceBinding::new("pubmed", "a")),
        CategoryPlan::new("two").source(SourceBinding::new("pubmed", "b")),
    ];
    let notifier = RecordingNotifier::failing(&[&link("DUP")]);
    let p = pipeline(
        plan,
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["DUP"]))),
        notifier.clone(),
        Arc::new(MemoryStore::new()),
        settings(5),
    );
    let r = p.run().await.unwrap();
    assert_eq!(notifier.attempt_count(), 1);
    assert_eq!(r.skipped_attempted, 1);
    assert_eq!(r.delivery_failures, 1);
}

#[tokio::test]
async fn delivered_key_is_not_resent_by_a_later_category() {
    let plan = vec![
        CategoryPlan::new("one").source(SourceBinding::new("pubmed", "a")),
        CategoryPlan::new("two").source(SourceBinding::new("pubmed", "b")),
    ];
    let p = pipeline(
        plan,
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["X"]))),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        settings(5),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 1);
    assert_eq!(r.skipped_duplicate, 1);
}

#[tokio::test]
async fn candidate_without_identity_is_skipped() {
    let mut broken = art("", "No id", "COPD");
    broken.external_id = None;
    broken.link = "  ".into();
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", vec![broken, art("OK", "t", "b")])),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        settings(5),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.skipped_malformed, 1);
    assert_eq!(r.total_delivered(), 1);
    assert_eq!(r.candidates, 2);
}

#[tokio::test]
async fn elapsed_deadline_stops_before_delivering() {
    let notifier = Arc::new(RecordingNotifier::default());
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A"]))),
        notifier.clone(),
        Arc::new(MemoryStore::new()),
        PipelineSettings {
            deadline: Some(Duration::ZERO),
            ..settings(5)
        },
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.stop_reason, StopReason::DeadlineExceeded);
    assert_eq!(notifier.attempt_count(), 0);
    assert!(r.summary().contains("deadline"));
}

#[tokio::test]
async fn deadline_mid_run_keeps_what_was_delivered() {
    let store = Arc::new(MemoryStore::new());
    let notifier = SlowNotifier::new(Duration::from_millis(40));
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new(
            "pubmed",
            arts(&["A", "B", "C", "D", "E", "F"]),
        )),
        notifier.clone(),
        store.clone(),
        PipelineSettings {
            deadline: Some(Duration::from_millis(100)),
            persist: PersistMode::End,
            ..settings(10)
        },
    );

    let r = p.run().await.unwrap();
    assert_eq!(r.stop_reason, StopReason::DeadlineExceeded);
    let n = r.total_delivered();
    assert!((1..6).contains(&n), "delivered {n}");
    assert_eq!(notifier.sent.load(Ordering::SeqCst), n);

    let saved = store.snapshot();
    assert_eq!(saved.len(), n);
    assert!(r.delivered.iter().all(|d| saved.contains(&d.key)));
    assert_eq!(store.persist_count(), 1);
}

#[tokio::test]
async fn hanging_source_times_out_and_next_binding_runs() {
    let plan = vec![CategoryPlan::new("pulmonology")
        .keywords(KeywordFilter::new(["copd"]))
        .source(SourceBinding::new("hanging", "copd"))
        .source(SourceBinding::new("pubmed", "copd"))];
    let p = pipeline(
        plan,
        SourceRegistry::new()
            .with(Arc::new(HangingSource))
            .with(ListSource::new("pubmed", arts(&["A"]))),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        PipelineSettings {
            fetch_timeout: Duration::from_millis(50),
            ..settings(5)
        },
    );

    let r = p.run().await.unwrap();
    assert_eq!(r.source_errors.len(), 1);
    assert!(r.source_errors[0].contains("timed out"), "{:?}", r.source_errors);
    assert_eq!(r.total_delivered(), 1);
    assert_eq!(r.stop_reason, StopReason::Completed);
}

#[tokio::test]
async fn timed_out_delivery_is_not_recorded() {
    let store = Arc::new(MemoryStore::new());
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A", "B"]))),
        SlowNotifier::new(Duration::from_secs(30)),
        store.clone(),
        PipelineSettings {
            deliver_timeout: Duration::from_millis(50),
            ..settings(5)
        },
    );

    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 0);
    assert_eq!(r.delivery_failures, 2);
    assert!(store.snapshot().is_empty());
    assert_eq!(store.persist_count(), 0);
}

#[tokio::test]
async fn persist_modes() {
    for (mode, expected) in [
        (PersistMode::Each, 3),
        (PersistMode::End, 1),
        (PersistMode::Never, 0),
    ] {
        let store = Arc::new(MemoryStore::new());
        let p = pipeline(
            one_category("pubmed"),
            SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A", "B", "C"]))),
            Arc::new(RecordingNotifier::default()),
            store.clone(),
            PipelineSettings {
                persist: mode,
                ..settings(5)
            },
        );
        let r = p.run().await.unwrap();
        assert_eq!(r.total_delivered(), 3, "{mode:?}");
        assert_eq!(store.persist_count(), expected, "{mode:?}");
    }
}

#[tokio::test]
async fn nothing_new_means_no_persist() {
    let store = Arc::new(MemoryStore::with_keys(["A"]));
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A"]))),
        Arc::new(RecordingNotifier::default()),
        store.clone(),
        settings(5),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 0);
    assert_eq!(store.persist_count(), 0);
}

#[tokio::test]
async fn failed_final_persist_is_reported() {
    let store = Arc::new(MemoryStore::new());
    store.set_fail_persist(true);
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A"]))),
        Arc::new(RecordingNotifier::default()),
        store.clone(),
        settings(5),
    );
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 1);
    assert!(r.persist_error.is_some());
    assert!(r.summary().contains("LEDGER NOT SAVED"));
}

#[tokio::test]
async fn corrupt_ledger_aborts_before_any_delivery() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sent_articles.json");
    std::fs::write(&path, "{not json").unwrap();
    let notifier = Arc::new(RecordingNotifier::default());
    let src = ListSource::new("pubmed", arts(&["A"]));
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(src.clone()),
        notifier.clone(),
        Arc::new(JsonFileStore::new(&path)),
        settings(5),
    );

    let err = p.run().await.unwrap_err();
    assert!(matches!(err, PipelineError::Ledger(_)));
    assert_eq!(src.calls.load(Ordering::SeqCst), 0);
    assert_eq!(notifier.attempt_count(), 0);
}

#[tokio::test]
async fn ledger_file_round_trip_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state/sent_articles.json");
    let make = || {
        pipeline(
            one_category("pubmed"),
            SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A", "B"]))),
            Arc::new(RecordingNotifier::default()),
            Arc::new(JsonFileStore::new(&path)),
            settings(5),
        )
    };
    assert_eq!(make().run().await.unwrap().total_delivered(), 2);
    assert_eq!(make().run().await.unwrap().total_delivered(), 0);
    let saved: Vec<String> = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved, ["A", "B"]);
}

#[tokio::test]
async fn daily_usage_is_shared_between_runs() {
    let dir = tempfile::tempdir().unwrap();
    let usage = dir.path().join("usage.json");
    let src = ListSource::new("pubmed", arts(&["A", "B"]));
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(src.clone()),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        PipelineSettings {
            usage_path: Some(usage.clone()),
            ..settings(2)
        },
    );
    assert_eq!(p.run().await.unwrap().total_delivered(), 2);
    assert!(usage.exists());

    src.set(arts(&["C", "D"]));
    let r = p.run().await.unwrap();
    assert_eq!(r.total_delivered(), 0);
    assert_eq!(r.stop_reason, StopReason::GlobalCapReached);
}

#[tokio::test]
async fn usage_waits_for_the_ledger_in_end_mode() {
    let dir = tempfile::tempdir().unwrap();
    let usage = dir.path().join("usage.json");
    let watcher = Arc::new(UsageWatcher {
        path: usage.clone(),
        seen: Mutex::new(Vec::new()),
    });
    let p = pipeline(
        one_category("pubmed"),
        SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A", "B", "C"]))),
        watcher.clone(),
        Arc::new(MemoryStore::new()),
        PipelineSettings {
            usage_path: Some(usage.clone()),
            persist: PersistMode::End,
            ..settings(5)
        },
    );

    assert_eq!(p.run().await.unwrap().total_delivered(), 3);
    assert_eq!(*watcher.seen.lock().unwrap(), [false, false, false]);
    assert!(usage.exists());
}

#[tokio::test]
async fn usage_is_not_saved_when_the_ledger_is_not() {
    for mode in [PersistMode::Each, PersistMode::End] {
        let dir = tempfile::tempdir().unwrap();
        let usage = dir.path().join("usage.json");
        let store = Arc::new(MemoryStore::new());
        store.set_fail_persist(true);
        let p = pipeline(
            one_category("pubmed"),
            SourceRegistry::new().with(ListSource::new("pubmed", arts(&["A", "B"]))),
            Arc::new(RecordingNotifier::default()),
            store,
            PipelineSettings {
                usage_path: Some(usage.clone()),
                persist: mode,
                ..settings(5)
            },
        );
        let r = p.run().await.unwrap();
        assert_eq!(r.total_delivered(), 2, "{mode:?}");
        assert!(r.persist_error.is_some(), "{mode:?}");
        assert!(!usage.exists(), "{mode:?}");
    }
}

// ---------- validation ----------

fn build_err(plan: Vec<CategoryPlan>, sources: SourceRegistry) -> ConfigError {
    match Pipeline::new(
        plan,
        sources,
        Arc::new(DisabledTranslator),
        Arc::new(RecordingNotifier::default()),
        Arc::new(MemoryStore::new()),
        PipelineSettings::default(),
    ) {
        Ok(_) => panic!("plan should be rejected"),
        Err(e) => e,
    }
}

#[test]
fn unknown_source_is_rejected() {
    let err = build_err(one_category("nope"), SourceRegistry::new());
    assert!(err.to_string().contains("unknown source `nope`"));
}

#[test]
fn filtered_binding_without_keywords_is_rejected() {
    let plan = vec![CategoryPlan::new("x").source(SourceBinding::new("rss", "https://f"))];
    let err = build_err(
        plan,
        SourceRegistry::new().with(ListSource::unscoped("rss", vec![])),
    );
    assert!(matches!(err, ConfigError::Invalid(m) if m.contains("has none")));
}

#[test]
fn duplicate_category_and_zero_limit_are_rejected() {
    let reg = || SourceRegistry::new().with(ListSource::new("pubmed", vec![]));
    let dup = vec![
        CategoryPlan::new("x").source(SourceBinding::new("pubmed", "a")),
        CategoryPlan::new("x").source(SourceBinding::new("pubmed", "b")),
    ];
    assert!(build_err(dup, reg()).to_string().contains("duplicate category"));

    let zero = vec![CategoryPlan::new("x").source(SourceBinding::new("pubmed", "a").limit(0))];
    assert!(build_err(zero, reg()).to_string().contains("limit 0"));

    let empty = vec![CategoryPlan::new("x").source(SourceBinding::new("pubmed", " "))];
    assert!(build_err(empty, reg()).to_string().contains("empty query"));
}

//! med-digest: one-shot run.
//! Loads config, wires sources/translator/notifier, runs the pipeline once and
//! prints the summary. Exit code is non-zero only for fatal errors.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use med_digest::config::AppConfig;
use med_digest::ingest::providers::{pubmed::PubMedSource, rss::RssSource};
use med_digest::ingest::SourceRegistry;
use med_digest::ledger::JsonFileStore;
use med_digest::metrics::{Metrics, ENV_METRICS_TEXTFILE};
use med_digest::notify::{LogNotifier, Notifier, TelegramNotifier};
use med_digest::pipeline::{Pipeline, RunReport};
use med_digest::translate::{DisabledTranslator, GoogleTranslator, Translator};

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("med_digest=info,warn"));
    let json = std::env::var("DIGEST_LOG_JSON")
        .ok()
        .is_some_and(|v| v == "1");

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn run() -> Result<RunReport> {
    let cfg = AppConfig::load_default().context("loading configuration")?;

    // Metrics are best effort; a second recorder (tests, embedding) is not fatal.
    let metrics = match Metrics::init() {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(error = ?e, "metrics disabled");
            None
        }
    };

    let client = cfg.http.client()?;
    let sources = SourceRegistry::new()
        .with(Arc::new(PubMedSource::new(client.clone(), cfg.pubmed.clone())))
        .with(Arc::new(RssSource::new(client.clone())));

    let translator: Arc<dyn Translator> = match cfg.translation.target() {
        Some(lang) => {
            info!(target_language = lang, "translation enabled");
            Arc::new(
                GoogleTranslator::new(client.clone())
                    .with_timeout(cfg.translation.timeout_secs)
                    .with_max_input_chars(cfg.translation.max_input_chars),
            )
        }
        None => Arc::new(DisabledTranslator),
    };

    let notifier: Arc<dyn Notifier> = match cfg.telegram_credentials()? {
        Some(creds) => Arc::new(
            TelegramNotifier::new(client.clone(), creds.token, creds.chat_id)
                .with_timeout(cfg.telegram.timeout_secs)
                .with_retries(cfg.telegram.retries),
        ),
        None => {
            info!("dry run: messages are logged, ledger is not written");
            Arc::new(LogNotifier)
        }
    };

    let store = Arc::new(JsonFileStore::new(&cfg.ledger.path));
    let pipeline = Pipeline::new(
        cfg.plan(),
        sources,
        translator,
        notifier,
        store,
        cfg.pipeline_settings(),
    )?;
    let report = pipeline.run().await?;

    if let (Some(m), Ok(path)) = (&metrics, std::env::var(ENV_METRICS_TEXTFILE)) {
        if let Err(e) = m.write_textfile(Path::new(&path)) {
            warn!(error = ?e, path = %path, "metrics textfile not written");
        }
    }
    Ok(report)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    match run().await {
        Ok(report) => {
            println!("{}", report.summary());
            if report.persist_error.is_some() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        }
        Err(e) => {
            error!(error = ?e, "digest run aborted");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

// src/metrics.rs
use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;

pub const ENV_METRICS_TEXTFILE: &str = "DIGEST_METRICS_TEXTFILE";

/// One-time metrics registration (so series carry help text).
pub fn ensure_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("digest_candidates_total", "Candidates seen by the pipeline.");
        describe_counter!(
            "digest_delivered_total",
            "Articles delivered, by category and source class."
        );
        describe_counter!("digest_skipped_total", "Candidates skipped, by reason.");
        describe_counter!(
            "digest_source_errors_total",
            "Source fetch failures, by source."
        );
        describe_counter!(
            "digest_delivery_failures_total",
            "Delivery attempts that failed or timed out."
        );
        describe_counter!(
            "digest_translation_fallbacks_total",
            "Texts sent untranslated because translation failed."
        );
        describe_histogram!("digest_fetch_ms", "Source fetch time in milliseconds.");
        describe_histogram!("digest_parse_ms", "Source parse time in milliseconds.");
    });
}

pub struct Metrics {
    pub handle: PrometheusHandle,
}

impl Metrics {
    /// Install the Prometheus recorder. Call once per process, before the run.
    pub fn init() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .context("installing prometheus recorder")?;
        ensure_described();
        Ok(Self { handle })
    }

    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Write the exposition for a node-exporter textfile collector. The file is
    /// replaced atomically so the collector never reads a partial scrape.
    pub fn write_textfile(&self, path: &Path) -> Result<()> {
        write_atomically(path, &self.render())
    }
}

fn write_atomically(path: &Path, body: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }
    let tmp = path.with_extension("prom.tmp");
    {
        let mut f =
            fs::File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
        f.write_all(body.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("renaming into {}", path.display()))?;
    Ok(())
}

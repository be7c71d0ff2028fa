// src/lib.rs
// Public library surface for the binary and integration tests.

pub mod config;
pub mod errors;
pub mod format;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod notify;
pub mod pipeline;
pub mod quota;
pub mod relevance;
pub mod translate;

// ---- Re-exports for stable public API ----
pub use crate::config::AppConfig;
pub use crate::ingest::types::{Article, ArticleSource};
pub use crate::pipeline::{Pipeline, PipelineSettings, RunReport, StopReason};

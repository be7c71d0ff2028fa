// src/errors.rs
//! Error taxonomy for the digest run.
//!
//! Per-item and per-source errors (`SourceUnavailable`, `TranslationUnavailable`,
//! `DeliveryFailed`) are caught inside the pipeline loop and only logged/counted.
//! `ConfigError` and `LedgerError` are the only ones allowed to abort a run, and
//! they surface before anything is fetched or delivered.

use std::path::PathBuf;

/// A source could not produce candidates (network, HTTP status, parse, timeout).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("source `{source_name}` unavailable: {reason}")]
pub struct SourceUnavailable {
    pub source_name: String,
    pub reason: String,
}

impl SourceUnavailable {
    pub fn new(source_name: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Translation is best-effort; callers fall back to the original text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("translation unavailable: {0}")]
pub struct TranslationUnavailable(pub String);

/// A single delivery attempt failed. The item stays eligible for a later run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("delivery failed: {reason}")]
pub struct DeliveryFailed {
    pub reason: String,
}

impl DeliveryFailed {
    pub fn new(reason: impl std::fmt::Display) -> Self {
        Self {
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("reading config from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger io at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("ledger at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Fatal errors that stop a run before it starts.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

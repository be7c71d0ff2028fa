// src/ingest/providers/mod.rs
pub mod pubmed;
pub mod rss;

// ==============================================================================
// lib.rs - Lab Ingestion Library
// ==============================================================================
// Description: Library interface for the lab document ingestion pipeline
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

pub mod audit;
pub mod config;
pub mod extraction;
pub mod ingestion;
pub mod logging;
pub mod models;
pub mod parsers;
pub mod repository;
pub mod schema;
pub mod secure_delete;
pub mod storage;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use ingestion::{IngestionError, IngestionJob, IngestionPipeline, JobOutcome, INGEST_QUEUE_KEY};
pub use parsers::BiomarkerParser;

/// Parse lab report text into biomarker candidates, in line order
pub fn parse_biomarkers(text: &str) -> Vec<models::BiomarkerCandidate> {
    BiomarkerParser::new().parse(text)
}

// ==============================================================================
// extraction.rs - Document Text Extraction
// ==============================================================================
// Description: TextExtractor trait plus OCR-over-HTTP and plain-text backends
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// ==============================================================================

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::ExtractionConfig;
use crate::validator::DocumentKind;

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Cannot connect to OCR service at {0}")]
    Connection(String),

    #[error("OCR request failed: {0}")]
    Http(String),

    #[error("OCR service error (HTTP {status}): {body}")]
    Service { status: u16, body: String },

    #[error("Failed to parse OCR response: {0}")]
    ResponseParsing(String),

    #[error("Unsupported document: {0}")]
    UnsupportedDocument(String),

    #[error("Document is not valid UTF-8 text")]
    InvalidText,
}

/// One recognised line, with the engine's confidence when it reports one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedLine {
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub text: String,
    #[serde(default)]
    pub lines: Vec<ExtractedLine>,
}

impl ExtractedText {
    /// Wrap text that carries no per-line confidence
    pub fn from_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let lines = text
            .lines()
            .map(|line| ExtractedLine {
                text: line.to_string(),
                confidence: None,
            })
            .collect();
        Self { text, lines }
    }

    pub fn mean_confidence(&self) -> Option<f32> {
        let scores: Vec<f32> = self.lines.iter().filter_map(|l| l.confidence).collect();
        if scores.is_empty() {
            None
        } else {
            Some(scores.iter().sum::<f32>() / scores.len() as f32)
        }
    }
}

/// Turns document bytes into text
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, ExtractionError>;

    fn name(&self) -> &'static str;
}

/// Client for an external OCR service
///
/// `POST {base_url}/extract` with the raw document as the body; the service
/// answers with an [`ExtractedText`] JSON body.
pub struct HttpOcrExtractor {
    base_url: String,
    client: reqwest::Client,
    timeout_secs: u64,
}

impl HttpOcrExtractor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExtractionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ExtractionError::Http(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

#[async_trait]
impl TextExtractor for HttpOcrExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        let url = format!("{}/extract", self.base_url);
        let content_type = DocumentKind::sniff(bytes)
            .map(|kind| kind.content_type())
            .unwrap_or("application/octet-stream");

        let response = self
            .client
            .post(&url)
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    ExtractionError::Connection(self.base_url.clone())
                } else if e.is_timeout() {
                    ExtractionError::Http(format!("Request timed out after {}s", self.timeout_secs))
                } else {
                    ExtractionError::Http(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionError::Service {
                status: status.as_u16(),
                body,
            });
        }

        let mut extracted: ExtractedText = response
            .json()
            .await
            .map_err(|e| ExtractionError::ResponseParsing(e.to_string()))?;

        if extracted.lines.is_empty() && !extracted.text.is_empty() {
            extracted = ExtractedText::from_text(extracted.text);
        }

        debug!(
            lines = extracted.lines.len(),
            mean_confidence = ?extracted.mean_confidence(),
            "OCR extraction finished"
        );
        Ok(extracted)
    }

    fn name(&self) -> &'static str {
        "http-ocr"
    }
}

/// Extractor for documents that are already UTF-8 text
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ExtractionError::InvalidText)?;
        Ok(ExtractedText::from_text(text.trim_start_matches('\u{feff}')))
    }

    fn name(&self) -> &'static str {
        "plain-text"
    }
}

/// Routes binary documents (PDF, images) to OCR and everything else to the
/// plain-text extractor
pub struct SniffingExtractor {
    ocr: Option<Arc<dyn TextExtractor>>,
    text: PlainTextExtractor,
}

impl SniffingExtractor {
    pub fn new(ocr: Option<Arc<dyn TextExtractor>>) -> Self {
        Self {
            ocr,
            text: PlainTextExtractor,
        }
    }

    pub fn from_config(config: &ExtractionConfig) -> Result<Self, ExtractionError> {
        let ocr = match &config.ocr_service_url {
            Some(url) => {
                Some(Arc::new(HttpOcrExtractor::new(url, config.timeout)?) as Arc<dyn TextExtractor>)
            }
            None => None,
        };
        Ok(Self::new(ocr))
    }
}

#[async_trait]
impl TextExtractor for SniffingExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedText, ExtractionError> {
        match (DocumentKind::sniff(bytes), &self.ocr) {
            (Some(kind), Some(ocr)) => {
                debug!(?kind, extractor = ocr.name(), "Routing document to OCR");
                ocr.extract(bytes).await
            }
            (Some(kind), None) => Err(ExtractionError::UnsupportedDocument(format!(
                "{:?} document requires OCR_SERVICE_URL",
                kind
            ))),
            (None, _) => self.text.extract(bytes).await,
        }
    }

    fn name(&self) -> &'static str {
        "sniffing"
    }
}

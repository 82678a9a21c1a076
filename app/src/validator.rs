// ==============================================================================
// validator.rs - Lab Document Upload Validation
// ==============================================================================
// Description: Validates uploaded lab documents (size, name, type, magic bytes)
// Created: 2026-10-18
// Modified: 2026-10-18
// Version: 1.0.0
// Security: Allowlist-only file types, magic number verification
// ==============================================================================

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info};

pub const MAX_DOCUMENT_SIZE: usize = 20 * 1024 * 1024; // 20 MB
const MAX_FILENAME_CHARS: usize = 255;

const PDF_MAGIC: &[u8] = b"%PDF-";
const PNG_MAGIC: &[u8] = &[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];
const JPEG_MAGIC: &[u8] = &[0xFF, 0xD8, 0xFF];
const TIFF_LE_MAGIC: &[u8] = b"II*\0";
const TIFF_BE_MAGIC: &[u8] = b"MM\0*";

/// Document formats accepted for ingestion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Png,
    Jpeg,
    Tiff,
    Text,
}

impl DocumentKind {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "pdf" => Some(DocumentKind::Pdf),
            "png" => Some(DocumentKind::Png),
            "jpg" | "jpeg" => Some(DocumentKind::Jpeg),
            "tif" | "tiff" => Some(DocumentKind::Tiff),
            "txt" => Some(DocumentKind::Text),
            _ => None,
        }
    }

    /// Identify a binary document format from its leading bytes
    ///
    /// Plain text has no signature, so it is never returned here.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        [
            DocumentKind::Pdf,
            DocumentKind::Png,
            DocumentKind::Jpeg,
            DocumentKind::Tiff,
        ]
        .into_iter()
        .find(|kind| kind.matches_magic(data))
    }

    /// Known signatures; an empty list means "no signature to check"
    fn magic_numbers(&self) -> &'static [&'static [u8]] {
        match self {
            DocumentKind::Pdf => &[PDF_MAGIC],
            DocumentKind::Png => &[PNG_MAGIC],
            DocumentKind::Jpeg => &[JPEG_MAGIC],
            DocumentKind::Tiff => &[TIFF_LE_MAGIC, TIFF_BE_MAGIC],
            DocumentKind::Text => &[],
        }
    }

    fn matches_magic(&self, data: &[u8]) -> bool {
        self.magic_numbers().iter().any(|magic| data.starts_with(magic))
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => "application/pdf",
            DocumentKind::Png => "image/png",
            DocumentKind::Jpeg => "image/jpeg",
            DocumentKind::Tiff => "image/tiff",
            DocumentKind::Text => "text/plain",
        }
    }
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("File is empty")]
    Empty,

    #[error("File too large: {size} bytes (max: {max} bytes)")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid filename: {0}")]
    InvalidFilename(&'static str),

    #[error("Invalid file type: .{0}")]
    UnsupportedType(String),

    #[error("Magic number mismatch for .{0} file")]
    MagicMismatch(String),

    #[error("Text document is not valid UTF-8")]
    InvalidText,
}

#[derive(Debug, Clone)]
pub struct ValidatedDocument {
    pub original_name: String,
    pub safe_name: String,
    pub extension: String,
    pub kind: DocumentKind,
    pub size: usize,
    pub hash_sha256: String,
    pub validated_at: chrono::DateTime<chrono::Utc>,
}

pub struct DocumentValidator {
    max_size: usize,
}

impl DocumentValidator {
    pub fn new() -> Self {
        Self {
            max_size: MAX_DOCUMENT_SIZE,
        }
    }

    pub fn with_max_size(max_size: usize) -> Self {
        Self { max_size }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Validate an uploaded document held in memory
    pub fn validate_upload(
        &self,
        filename: &str,
        data: &[u8],
    ) -> Result<ValidatedDocument, ValidationError> {
        info!("Validating lab document: {}", filename);

        // 1. Size check (before any processing)
        let size = data.len();
        if size == 0 {
            return Err(ValidationError::Empty);
        }
        if size > self.max_size {
            return Err(ValidationError::TooLarge {
                size,
                max: self.max_size,
            });
        }
        debug!("Size check passed: {} bytes", size);

        // 2. Filename sanitization
        let safe_name = sanitize_filename(filename)?;
        debug!("Sanitized filename: {}", safe_name);

        // 3. Extension check (allowlist)
        let ext = get_extension(&safe_name)?;
        let kind = DocumentKind::from_extension(&ext)
            .ok_or_else(|| ValidationError::UnsupportedType(ext.clone()))?;
        debug!("Extension check passed: .{}", ext);

        // 4. Magic number verification
        match kind {
            DocumentKind::Text => {
                if std::str::from_utf8(data).is_err() {
                    return Err(ValidationError::InvalidText);
                }
            }
            _ => {
                if !kind.matches_magic(data) {
                    return Err(ValidationError::MagicMismatch(ext));
                }
            }
        }
        debug!("Content signature check passed");

        let hash = compute_sha256(data);
        debug!("SHA-256: {}", hash);

        Ok(ValidatedDocument {
            original_name: filename.to_string(),
            safe_name,
            extension: ext,
            kind,
            size,
            hash_sha256: hash,
            validated_at: chrono::Utc::now(),
        })
    }
}

impl Default for DocumentValidator {
    fn default() -> Self {
        Self::new()
    }
}

/// Reduce a client-supplied filename to `[A-Za-z0-9_.-]`
pub fn sanitize_filename(name: &str) -> Result<String, ValidationError> {
    // Path separators become underscores, everything else outside the set is dropped
    let safe: String = name
        .replace(['/', '\\', '\0'], "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '.' || *c == '-')
        .take(MAX_FILENAME_CHARS)
        .collect();

    if safe.is_empty() {
        return Err(ValidationError::InvalidFilename("empty after sanitization"));
    }

    if safe.starts_with('.') {
        return Err(ValidationError::InvalidFilename("cannot start with '.'"));
    }

    Ok(safe)
}

fn get_extension(filename: &str) -> Result<String, ValidationError> {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => Ok(ext.to_lowercase()),
        _ => Err(ValidationError::InvalidFilename("no file extension")),
    }
}

fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PDF: &[u8] = b"%PDF-1.7\n%\xE2\xE3\xCF\xD3\n1 0 obj";

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("cbc_panel.pdf").unwrap(), "cbc_panel.pdf");
        assert_eq!(
            sanitize_filename("reports/../../etc/passwd").unwrap(),
            "reports_.._.._etc_passwd"
        );
        assert!(sanitize_filename("../../etc/passwd").is_err());
        assert_eq!(sanitize_filename("lab results (1).pdf").unwrap(), "labresults1.pdf");
        assert!(sanitize_filename(".hidden").is_err());
        assert!(sanitize_filename("  ").is_err());
    }

    #[test]
    fn test_get_extension() {
        assert_eq!(get_extension("scan.TIFF").unwrap(), "tiff");
        assert_eq!(get_extension("a.b.jpeg").unwrap(), "jpeg");
        assert!(get_extension("noextension").is_err());
    }

    #[test]
    fn test_valid_pdf() {
        let validated = DocumentValidator::new()
            .validate_upload("Quest Labs 2026.pdf", PDF)
            .unwrap();

        assert_eq!(validated.kind, DocumentKind::Pdf);
        assert_eq!(validated.safe_name, "QuestLabs2026.pdf");
        assert_eq!(validated.size, PDF.len());
        assert_eq!(validated.hash_sha256.len(), 64);
    }

    #[test]
    fn test_magic_mismatch_rejected() {
        let result = DocumentValidator::new().validate_upload("fake.png", PDF);
        assert!(matches!(result, Err(ValidationError::MagicMismatch(ext)) if ext == "png"));
    }

    #[test]
    fn test_unsupported_extension_rejected() {
        let result = DocumentValidator::new().validate_upload("results.docx", b"PK\x03\x04");
        assert!(matches!(result, Err(ValidationError::UnsupportedType(_))));
    }

    #[test]
    fn test_text_must_be_utf8() {
        let validator = DocumentValidator::new();
        assert!(validator
            .validate_upload("labs.txt", "Glucose: 95 mg/dL".as_bytes())
            .is_ok());
        assert!(matches!(
            validator.validate_upload("labs.txt", &[0xC3, 0x28]),
            Err(ValidationError::InvalidText)
        ));
    }

    #[test]
    fn test_size_limits() {
        let validator = DocumentValidator::with_max_size(16);
        let result = validator.validate_upload("big.pdf", b"%PDF-0123456789abcdef");
        assert!(result.unwrap_err().to_string().contains("too large"));

        assert!(matches!(
            DocumentValidator::new().validate_upload("empty.pdf", b""),
            Err(ValidationError::Empty)
        ));
    }

    #[test]
    fn test_sniff() {
        assert_eq!(DocumentKind::sniff(PDF), Some(DocumentKind::Pdf));
        assert_eq!(DocumentKind::sniff(b"II*\0rest"), Some(DocumentKind::Tiff));
        assert_eq!(DocumentKind::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(DocumentKind::Jpeg));
        assert_eq!(DocumentKind::sniff(b"Glucose 95"), None);
    }
}

//! Component B: text extraction from raw document bytes.
//!
//! PDF extraction shells out to `pdftotext` (poppler-utils), the same tool
//! the codebase this grew out of used. There is no placeholder path: a
//! format with no real handler is a terminal [`ExtractionError::UnsupportedFormat`],
//! never a fabricated success.

use std::io::Write as _;
use std::process::{Command, Stdio};

use once_cell_fallback::OnceCell;
use regex::Regex;
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::job::{ExtractedMetadata, MetadataValue};
use crate::queue::Retryable;

/// Caller-supplied hints about the object being extracted.
#[derive(Debug, Clone)]
pub struct FileHint {
    pub filename: String,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentFormat {
    Pdf,
    WordProcessor,
    Rtf,
    PlainText,
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),
    #[error("corrupt document: {0}")]
    Corrupt(String),
    #[error("transient extraction IO error: {0}")]
    TransientIO(String),
}

impl Retryable for ExtractionError {
    fn is_retryable(&self) -> bool {
        matches!(self, Self::TransientIO(_))
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::Corrupt(_) => "corrupt",
            Self::TransientIO(_) => "transient_io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractionResult {
    pub text: String,
    pub metadata: ExtractedMetadata,
}

pub struct TextExtractor {
    pdftotext_path: String,
}

impl Default for TextExtractor {
    fn default() -> Self {
        Self {
            pdftotext_path: "pdftotext".to_string(),
        }
    }
}

impl TextExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pdftotext_path(mut self, path: impl Into<String>) -> Self {
        self.pdftotext_path = path.into();
        self
    }

    /// Extract plain text plus metadata from `bytes`, dispatching on the
    /// detected format. Never panics on malformed input.
    pub async fn extract(
        &self,
        bytes: &[u8],
        hint: &FileHint,
    ) -> Result<ExtractionResult, ExtractionError> {
        let format = detect_format(hint).map_err(ExtractionError::UnsupportedFormat)?;

        let (raw_text, page_count) = match format {
            DocumentFormat::Pdf => self.extract_pdf(bytes).await?,
            DocumentFormat::WordProcessor => (extract_docx(bytes)?, None),
            DocumentFormat::Rtf => (extract_rtf(bytes)?, None),
            DocumentFormat::PlainText => (decode_plain_text(bytes)?, None),
        };

        let text = normalize_newlines(&raw_text);

        let mut metadata = ExtractedMetadata::new();
        metadata.insert("filename".to_string(), MetadataValue::from(hint.filename.clone()));
        if let Some(ct) = &hint.content_type {
            metadata.insert("content_type".to_string(), MetadataValue::from(ct.clone()));
        }
        metadata.insert(
            "word_count".to_string(),
            MetadataValue::from(text.split_whitespace().count()),
        );
        if let Some(pages) = page_count {
            metadata.insert("page_count".to_string(), MetadataValue::from(pages));
        }

        Ok(ExtractionResult { text, metadata })
    }

    async fn extract_pdf(&self, bytes: &[u8]) -> Result<(String, Option<usize>), ExtractionError> {
        let pdftotext_path = self.pdftotext_path.clone();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || run_pdftotext(&pdftotext_path, &bytes))
            .await
            .map_err(|e| ExtractionError::TransientIO(e.to_string()))?
    }
}

fn run_pdftotext(pdftotext_path: &str, bytes: &[u8]) -> Result<(String, Option<usize>), ExtractionError> {
    let mut input_file = NamedTempFile::new()
        .map_err(|e| ExtractionError::TransientIO(format!("tempfile: {e}")))?;
    input_file
        .write_all(bytes)
        .map_err(|e| ExtractionError::TransientIO(format!("write: {e}")))?;

    let output = Command::new(pdftotext_path)
        .arg(input_file.path())
        .arg("-")
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output();

    match output {
        Ok(output) if output.status.success() => {
            let text = String::from_utf8_lossy(&output.stdout).to_string();
            let page_count = count_pdf_pages(bytes);
            Ok((text, page_count))
        }
        Ok(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ExtractionError::Corrupt(format!("pdftotext: {stderr}")))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ExtractionError::TransientIO("pdftotext not installed".to_string()))
        }
        Err(e) => Err(ExtractionError::TransientIO(e.to_string())),
    }
}

/// Count `/Type /Page` occurrences as a cheap page-count estimate; PDF
/// internals are not otherwise parsed.
fn count_pdf_pages(bytes: &[u8]) -> Option<usize> {
    let haystack = String::from_utf8_lossy(bytes);
    let count = haystack.matches("/Type /Page").count() + haystack.matches("/Type/Page").count();
    if count > 0 {
        Some(count)
    } else {
        None
    }
}

fn decode_plain_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| ExtractionError::Corrupt(format!("invalid UTF-8: {e}")))
}

/// Extract `word/document.xml` from a `.docx` zip container and strip XML
/// tags. This is not a full OOXML reader — just enough to get plain text
/// back out, matching what this extractor promises (real text, no
/// placeholders) without pulling in a full document-model crate.
fn extract_docx(bytes: &[u8]) -> Result<String, ExtractionError> {
    let cursor = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(cursor)
        .map_err(|e| ExtractionError::Corrupt(format!("not a valid zip container: {e}")))?;

    let mut xml = String::new();
    {
        let mut doc = archive
            .by_name("word/document.xml")
            .map_err(|_| ExtractionError::Corrupt("missing word/document.xml".to_string()))?;
        std::io::Read::read_to_string(&mut doc, &mut xml)
            .map_err(|e| ExtractionError::Corrupt(format!("reading document.xml: {e}")))?;
    }

    Ok(strip_xml_tags(&xml))
}

fn strip_xml_tags(xml: &str) -> String {
    let tag_re = xml_tag_regex();
    let stripped = tag_re.replace_all(xml, " ");
    stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn xml_tag_regex() -> &'static Regex {
    static CELL: OnceCell<Regex> = OnceCell::new();
    CELL.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex is valid"))
}

/// Strip RTF control words (`\control`, groups, hex escapes) down to the
/// visible text, same spirit as the docx handler: real conversion, no
/// placeholder output.
fn extract_rtf(bytes: &[u8]) -> Result<String, ExtractionError> {
    let raw = String::from_utf8_lossy(bytes);
    if !raw.trim_start().starts_with("{\\rtf") {
        return Err(ExtractionError::Corrupt("missing RTF header".to_string()));
    }

    let control_word_re = rtf_control_word_regex();
    let without_controls = control_word_re.replace_all(&raw, "");
    let without_braces: String = without_controls
        .chars()
        .filter(|c| *c != '{' && *c != '}')
        .collect();
    Ok(without_braces.split_whitespace().collect::<Vec<_>>().join(" "))
}

fn rtf_control_word_regex() -> &'static Regex {
    static CELL: OnceCell<Regex> = OnceCell::new();
    CELL.get_or_init(|| Regex::new(r"\\[a-zA-Z]+-?\d*[ ]?|\\'[0-9a-fA-F]{2}").expect("static regex is valid"))
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n").replace('\r', "\n")
}

/// Resolve a format from content-type then filename extension. Neither hint
/// recognized is a hard `Err`, not a silent plain-text fallback — callers
/// turn that into a terminal [`ExtractionError::UnsupportedFormat`].
fn detect_format(hint: &FileHint) -> Result<DocumentFormat, String> {
    if let Some(ct) = &hint.content_type {
        match ct.as_str() {
            "application/pdf" => return Ok(DocumentFormat::Pdf),
            "application/rtf" | "text/rtf" => return Ok(DocumentFormat::Rtf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document"
            | "application/msword" => return Ok(DocumentFormat::WordProcessor),
            "text/plain" | "text/html" => return Ok(DocumentFormat::PlainText),
            _ => {}
        }
    }

    let lower = hint.filename.to_lowercase();
    if lower.ends_with(".pdf") {
        Ok(DocumentFormat::Pdf)
    } else if lower.ends_with(".rtf") {
        Ok(DocumentFormat::Rtf)
    } else if lower.ends_with(".docx") || lower.ends_with(".doc") {
        Ok(DocumentFormat::WordProcessor)
    } else if lower.ends_with(".txt") || lower.ends_with(".html") || lower.ends_with(".htm") {
        Ok(DocumentFormat::PlainText)
    } else {
        Err(format!(
            "no handler for '{}' (content_type={:?})",
            hint.filename, hint.content_type
        ))
    }
}

/// Minimal lazily-initialized cell so the module doesn't need a direct
/// `once_cell` dependency when `std::sync::OnceLock` already covers it.
mod once_cell_fallback {
    use std::sync::OnceLock;

    pub struct OnceCell<T>(OnceLock<T>);

    impl<T> OnceCell<T> {
        pub const fn new() -> Self {
            Self(OnceLock::new())
        }

        pub fn get_or_init(&self, f: impl FnOnce() -> T) -> &T {
            self.0.get_or_init(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(filename: &str, content_type: Option<&str>) -> FileHint {
        FileHint {
            filename: filename.to_string(),
            content_type: content_type.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn plain_text_roundtrips_and_normalizes_newlines() {
        let extractor = TextExtractor::new();
        let bytes = b"line one\r\nline two\rline three".to_vec();
        let result = extractor
            .extract(&bytes, &hint("a.txt", Some("text/plain")))
            .await
            .unwrap();
        assert_eq!(result.text, "line one\nline two\nline three");
        assert_eq!(
            result.metadata.get("word_count").and_then(|v| v.as_int()),
            Some(6)
        );
    }

    #[tokio::test]
    async fn invalid_utf8_plain_text_is_corrupt() {
        let extractor = TextExtractor::new();
        let bytes = vec![0xff, 0xfe, 0x00];
        let err = extractor
            .extract(&bytes, &hint("a.txt", Some("text/plain")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Corrupt(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn unrecognized_format_is_a_terminal_unsupported_format_error() {
        let extractor = TextExtractor::new();
        let bytes = b"just some bytes".to_vec();
        let err = extractor
            .extract(&bytes, &hint("mystery", None))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::UnsupportedFormat(_)));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn extensionless_name_with_recognized_content_type_still_decodes() {
        let extractor = TextExtractor::new();
        let bytes = b"just some bytes".to_vec();
        let result = extractor
            .extract(&bytes, &hint("mystery", Some("text/plain")))
            .await
            .unwrap();
        assert_eq!(result.text, "just some bytes");
    }

    #[test]
    fn rtf_without_header_is_corrupt() {
        let err = extract_rtf(b"not rtf at all").unwrap_err();
        assert!(matches!(err, ExtractionError::Corrupt(_)));
    }

    #[test]
    fn rtf_strips_control_words() {
        let text = extract_rtf(br"{\rtf1\ansi Hello \b world\b0 !}").unwrap();
        assert_eq!(text, "Hello world !");
    }

    #[test]
    fn docx_requires_valid_zip_container() {
        let err = extract_docx(b"not a zip").unwrap_err();
        assert!(matches!(err, ExtractionError::Corrupt(_)));
    }
}

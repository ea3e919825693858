//! MIME-dispatched text extraction.
//!
//! All format knowledge lives behind the [`TextExtractor`] trait and the
//! [`ExtractorRegistry`] that maps normalized MIME types to extractors;
//! nothing else in the pipeline branches on file format. Extractors are
//! synchronous and CPU-bound; the worker runs them under `spawn_blocking`
//! with a timeout, and a panicking extractor surfaces at the join as a
//! transient failure.
//!
//! Error semantics matter here: [`ExtractError::CorruptFile`] is reserved
//! for input the extractor *positively identifies* as unreadable (bad zip
//! container, PDF parse failure) and is never retried, while
//! [`ExtractError::ExtractionFailed`] covers everything indeterminate and
//! is retried up to the attempt limit.

use std::collections::HashMap;
use std::io::{Cursor, ErrorKind, Read};
use std::sync::Arc;

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;
use zip::result::ZipError;
use zip::ZipArchive;

use crate::error::PipelineError;
use crate::sanitize::{normalize_mime, strip_tags};

/// Cap on a single decompressed archive part, to keep hostile zips from
/// ballooning in memory.
const MAX_PART_BYTES: u64 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// No extractor is registered for this MIME type.
    #[error("unsupported MIME type '{0}'")]
    UnsupportedMimeType(String),

    /// The input is positively unreadable for its claimed format.
    #[error("file is corrupt or unreadable: {0}")]
    CorruptFile(String),

    /// Extraction failed without a definitive corrupt-file signal.
    #[error("text extraction failed: {0}")]
    ExtractionFailed(String),
}

impl From<ExtractError> for PipelineError {
    fn from(e: ExtractError) -> Self {
        match e {
            ExtractError::UnsupportedMimeType(mime) => PipelineError::UnsupportedMimeType(mime),
            ExtractError::CorruptFile(detail) => PipelineError::CorruptFile(detail),
            ExtractError::ExtractionFailed(detail) => PipelineError::ExtractionFailed(detail),
        }
    }
}

/// Turns raw bytes of one format into plain text.
pub trait TextExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError>;
}

/// Lossy UTF-8 decoding for the plain-text family.
pub struct PlainTextExtractor;

impl TextExtractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}

/// HTML reduced to its text content with tags dropped.
pub struct HtmlTextExtractor;

impl TextExtractor for HtmlTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        Ok(strip_tags(&String::from_utf8_lossy(bytes)))
    }
}

/// Generic XML: every text node, one per line.
pub struct XmlTextExtractor;

impl TextExtractor for XmlTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let xml = String::from_utf8_lossy(bytes);
        let mut reader = Reader::from_str(&xml);
        let mut out = String::new();
        loop {
            match reader.read_event() {
                Ok(Event::Text(t)) => {
                    let text = t
                        .unescape()
                        .map_err(|e| ExtractError::CorruptFile(format!("malformed XML: {e}")))?;
                    let text = text.trim();
                    if !text.is_empty() {
                        out.push_str(text);
                        out.push('\n');
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(ExtractError::CorruptFile(format!("malformed XML: {e}"))),
            }
        }
        Ok(out)
    }
}

/// PDF text layer via `pdf-extract`. Parse failures are definitive.
pub struct PdfExtractor;

impl TextExtractor for PdfExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| ExtractError::CorruptFile(format!("PDF parse error: {e}")))
    }
}

/// Word `.docx`: text runs from `word/document.xml`, one paragraph per line.
pub struct DocxExtractor;

impl TextExtractor for DocxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_archive(bytes)?;
        let xml = try_read_part(&mut archive, "word/document.xml")?.ok_or_else(|| {
            ExtractError::CorruptFile("not a Word document (missing word/document.xml)".into())
        })?;
        collect_office_text(&xml, b"p")
    }
}

/// Excel `.xlsx`: the shared-string table, one entry per line. A workbook
/// with no string cells extracts to empty text.
pub struct XlsxExtractor;

impl TextExtractor for XlsxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_archive(bytes)?;
        match try_read_part(&mut archive, "xl/sharedStrings.xml")? {
            Some(xml) => collect_office_text(&xml, b"si"),
            None => Ok(String::new()),
        }
    }
}

/// PowerPoint `.pptx`: text runs from each slide, slides in deck order.
pub struct PptxExtractor;

impl TextExtractor for PptxExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<String, ExtractError> {
        let mut archive = open_archive(bytes)?;
        let mut slides: Vec<(u32, String)> = archive
            .file_names()
            .filter_map(slide_number)
            .collect();
        // Numeric sort; lexicographic would put slide10 before slide2.
        slides.sort_by_key(|(number, _)| *number);

        let mut out = String::new();
        for (_, name) in &slides {
            if let Some(xml) = try_read_part(&mut archive, name)? {
                out.push_str(&collect_office_text(&xml, b"p")?);
            }
        }
        Ok(out)
    }
}

fn slide_number(name: &str) -> Option<(u32, String)> {
    let digits = name
        .strip_prefix("ppt/slides/slide")?
        .strip_suffix(".xml")?;
    let number: u32 = digits.parse().ok()?;
    Some((number, name.to_string()))
}

fn open_archive(bytes: &[u8]) -> Result<ZipArchive<Cursor<&[u8]>>, ExtractError> {
    ZipArchive::new(Cursor::new(bytes)).map_err(zip_error)
}

fn zip_error(e: ZipError) -> ExtractError {
    match e {
        ZipError::Io(io) => ExtractError::ExtractionFailed(format!("reading archive: {io}")),
        other => ExtractError::CorruptFile(format!("invalid archive: {other}")),
    }
}

/// Read one archive part as UTF-8, or `None` when the part is absent.
fn try_read_part(
    archive: &mut ZipArchive<Cursor<&[u8]>>,
    name: &str,
) -> Result<Option<String>, ExtractError> {
    let mut file = match archive.by_name(name) {
        Ok(file) => file,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(zip_error(e)),
    };
    if file.size() > MAX_PART_BYTES {
        return Err(ExtractError::CorruptFile(format!(
            "{name} is larger than the {} MiB extraction limit",
            MAX_PART_BYTES / (1024 * 1024)
        )));
    }
    let mut xml = String::new();
    match file.read_to_string(&mut xml) {
        Ok(_) => Ok(Some(xml)),
        Err(e) if e.kind() == ErrorKind::InvalidData => Err(ExtractError::CorruptFile(format!(
            "{name} is not valid UTF-8"
        ))),
        Err(e) => Err(ExtractError::ExtractionFailed(format!("reading {name}: {e}"))),
    }
}

/// Collect the text of every `<*:t>` element, inserting a line break at the
/// close of each `break_after` element (`p` for paragraphs, `si` for
/// shared-string items). Office namespaces vary by producer, so elements
/// are matched on local name.
fn collect_office_text(xml: &str, break_after: &[u8]) -> Result<String, ExtractError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == b"t" => in_text = true,
            Ok(Event::End(e)) => {
                let name = e.local_name();
                if name.as_ref() == b"t" {
                    in_text = false;
                } else if name.as_ref() == break_after
                    && !out.is_empty()
                    && !out.ends_with('\n')
                {
                    out.push('\n');
                }
            }
            Ok(Event::Text(t)) if in_text => {
                let text = t
                    .unescape()
                    .map_err(|e| ExtractError::CorruptFile(format!("malformed XML: {e}")))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(ExtractError::CorruptFile(format!("malformed XML: {e}"))),
        }
    }
    Ok(out)
}

/// MIME type → extractor table. Lookup tries the exact normalized type,
/// then the `family/*` wildcard, and fails with `UnsupportedMimeType` when
/// neither is registered.
pub struct ExtractorRegistry {
    extractors: HashMap<String, Arc<dyn TextExtractor>>,
}

impl ExtractorRegistry {
    /// A registry with nothing registered. Everything is unsupported until
    /// `register` is called.
    pub fn empty() -> Self {
        Self {
            extractors: HashMap::new(),
        }
    }

    /// The built-in extractor set: the plain-text family, HTML, XML, JSON,
    /// PDF, and the Office Open XML formats.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let plain = Arc::new(PlainTextExtractor);
        let xml = Arc::new(XmlTextExtractor);
        registry.register("text/*", plain.clone());
        registry.register("application/json", plain);
        registry.register("text/html", Arc::new(HtmlTextExtractor));
        registry.register("application/xml", xml.clone());
        registry.register("text/xml", xml);
        registry.register("application/pdf", Arc::new(PdfExtractor));
        registry.register(
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            Arc::new(DocxExtractor),
        );
        registry.register(
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
            Arc::new(XlsxExtractor),
        );
        registry.register(
            "application/vnd.openxmlformats-officedocument.presentationml.presentation",
            Arc::new(PptxExtractor),
        );
        registry
    }

    /// Register (or replace) the extractor for a MIME type. A `family/*`
    /// key acts as the fallback for the whole family.
    pub fn register(&mut self, mime_type: &str, extractor: Arc<dyn TextExtractor>) {
        self.extractors.insert(normalize_mime(mime_type), extractor);
    }

    pub fn supports(&self, mime_type: &str) -> bool {
        self.lookup(&normalize_mime(mime_type)).is_some()
    }

    fn lookup(&self, normalized: &str) -> Option<Arc<dyn TextExtractor>> {
        if let Some(extractor) = self.extractors.get(normalized) {
            return Some(extractor.clone());
        }
        let family = normalized.split('/').next()?;
        self.extractors.get(&format!("{family}/*")).cloned()
    }

    /// Extract plain text from `bytes` using the extractor registered for
    /// `mime_type`.
    pub fn extract(&self, mime_type: &str, bytes: &[u8]) -> Result<String, ExtractError> {
        let normalized = normalize_mime(mime_type);
        let extractor = self
            .lookup(&normalized)
            .ok_or(ExtractError::UnsupportedMimeType(normalized))?;
        extractor.extract(bytes)
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

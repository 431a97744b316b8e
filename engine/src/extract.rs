//! Per-format content extraction.
//!
//! Dispatch is a sum type keyed by extension; every variant is a function
//! from path to plain text, and every result passes the shared cleanup
//! before it reaches the caches. Extraction failures log and yield empty
//! text — a single bad file never aborts an indexing run.

use crate::ocr::{OcrBackend, OcrExtractor, TesseractCli};
use crate::types::{file_name_of, MAX_FILE_SIZE, NAME_ONLY_THRESHOLD};
use calamine::{open_workbook_auto, DataType, Reader as CalamineReader};
use chardetng::EncodingDetector;
use docfind_core::{clean_extracted, truncate_chars};
use encoding_rs::{Encoding, SHIFT_JIS, UTF_8};
use lru::LruCache;
use memmap2::Mmap;
use quick_xml::events::Event;
use quick_xml::Reader as XmlReader;
use std::collections::HashSet;
use std::io::Read;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, warn};

/// PDF extraction stops after this many pages.
const PDF_MAX_PAGES: usize = 200;
/// PDF text cap.
const PDF_MAX_CHARS: usize = 500_000;
/// Pages are extracted in parallel past this count.
const PDF_PARALLEL_THRESHOLD: usize = 10;
const PDF_PARALLEL_WORKERS: usize = 4;

/// ZIP archive member limits.
const ZIP_MAX_ENTRIES: usize = 50;
const ZIP_MAX_ENTRY_BYTES: u64 = 1024 * 1024;

/// Encoding detection looks at this much of the head of a text file.
const ENCODING_PROBE_BYTES: usize = 4096;

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// Extraction strategy for a file, decided by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractorKind {
    Text,
    WordXml,
    WordLegacy,
    ExcelXml,
    ExcelBinary,
    Pdf,
    ZipArchive,
    OcrImage,
    NameOnly,
    Unsupported,
}

impl ExtractorKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext {
            "txt" => Self::Text,
            "docx" | "dotx" | "dotm" | "docm" => Self::WordXml,
            "doc" | "dot" => Self::WordLegacy,
            "xlsx" | "xltx" | "xltm" | "xlsm" => Self::ExcelXml,
            "xls" | "xlt" | "xlsb" => Self::ExcelBinary,
            "pdf" => Self::Pdf,
            "zip" => Self::ZipArchive,
            "tif" | "tiff" => Self::OcrImage,
            "jwc" | "jww" | "dxf" | "sfc" | "dwg" | "dwt" | "mpp" | "mpz" => Self::NameOnly,
            _ => Self::Unsupported,
        }
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct ContentExtractor {
    /// Detected encoding per extension; text trees are usually uniform.
    encoding_cache: Mutex<LruCache<String, &'static Encoding>>,
    ocr: OcrExtractor,
}

impl ContentExtractor {
    pub fn new() -> Self {
        Self::with_ocr_backend(Box::new(TesseractCli::new()))
    }

    pub fn with_ocr_backend(backend: Box<dyn OcrBackend>) -> Self {
        let cap = NonZeroUsize::new(64).expect("cache capacity is non-zero");
        Self {
            encoding_cache: Mutex::new(LruCache::new(cap)),
            ocr: OcrExtractor::new(backend),
        }
    }

    /// Extract content for indexing, applying the shared size gates:
    /// oversized files are skipped outright, large files index by name only,
    /// and everything else goes through its format extractor plus cleanup.
    /// `None` means the file should not be indexed at all.
    pub fn extract_for_index(&self, path: &Path, size: u64) -> Option<String> {
        if size >= MAX_FILE_SIZE {
            debug!(path = %path.display(), size, "Oversized file skipped");
            return None;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        let kind = ExtractorKind::from_extension(&ext);

        if kind == ExtractorKind::Unsupported {
            return None;
        }
        // Large-file fast path: the base name is the content
        if size >= NAME_ONLY_THRESHOLD || kind == ExtractorKind::NameOnly {
            return Some(file_name_of(path));
        }

        let raw = self.extract_content(path, size, kind, &ext);
        let cleaned = clean_extracted(&raw);
        if cleaned.is_empty() {
            // Legacy Office files whose every strategy came up empty still
            // index under their own name
            if matches!(kind, ExtractorKind::WordLegacy | ExtractorKind::ExcelBinary) {
                return Some(file_name_of(path));
            }
            None
        } else {
            Some(cleaned)
        }
    }

    fn extract_content(&self, path: &Path, size: u64, kind: ExtractorKind, ext: &str) -> String {
        let result = match kind {
            ExtractorKind::Text => self.extract_text(path, size, ext),
            ExtractorKind::WordXml => extract_docx(path, size),
            ExtractorKind::WordLegacy => extract_doc_legacy(path),
            ExtractorKind::ExcelXml => extract_xlsx(path, size),
            ExtractorKind::ExcelBinary => extract_excel_binary(path),
            ExtractorKind::Pdf => extract_pdf(path),
            ExtractorKind::ZipArchive => extract_zip(path),
            ExtractorKind::OcrImage => Ok(self.ocr.extract(path)),
            ExtractorKind::NameOnly => Ok(file_name_of(path)),
            ExtractorKind::Unsupported => Ok(String::new()),
        };
        match result {
            Ok(text) => text,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Extraction failed");
                String::new()
            }
        }
    }

    // -----------------------------------------------------------------------
    // Plain text
    // -----------------------------------------------------------------------

    /// Read caps shrink as files grow; very large files are memory-mapped
    /// instead of read into a buffer.
    fn extract_text(&self, path: &Path, size: u64, ext: &str) -> ExtractResult {
        let cap = if size >= 100 * 1024 * 1024 {
            5 * 1024 * 1024
        } else if size >= 50 * 1024 * 1024 {
            10 * 1024 * 1024
        } else {
            20 * 1024 * 1024
        };

        if size >= 50 * 1024 * 1024 {
            let file = std::fs::File::open(path)?;
            // Large read-only file: map it and decode a prefix
            let map = unsafe { Mmap::map(&file)? };
            let slice = &map[..map.len().min(cap)];
            Ok(self.decode_text(slice, ext))
        } else {
            let file = std::fs::File::open(path)?;
            let mut buf = Vec::with_capacity(size.min(cap as u64) as usize);
            file.take(cap as u64).read_to_end(&mut buf)?;
            Ok(self.decode_text(&buf, ext))
        }
    }

    fn decode_text(&self, bytes: &[u8], ext: &str) -> String {
        let encoding = self.detect_encoding(bytes, ext);
        let (text, _, _) = encoding.decode(bytes);
        text.into_owned()
    }

    /// UTF-8 wins when the probe window decodes cleanly; otherwise the
    /// detector picks, with Shift-JIS as the final fallback for the legacy
    /// trees this engine is pointed at. The verdict is cached per extension.
    fn detect_encoding(&self, bytes: &[u8], ext: &str) -> &'static Encoding {
        let probe = &bytes[..bytes.len().min(ENCODING_PROBE_BYTES)];

        if utf8_probe_ok(probe) {
            return UTF_8;
        }
        let cached =
            self.encoding_cache.lock().expect("encoding cache poisoned").get(ext).copied();
        if let Some(encoding) = cached {
            return encoding;
        }

        let mut detector = EncodingDetector::new();
        detector.feed(probe, probe.len() == bytes.len());
        let detected = detector.guess(None, true);
        let encoding = if detected == UTF_8 { SHIFT_JIS } else { detected };

        self.encoding_cache
            .lock()
            .expect("encoding cache poisoned")
            .put(ext.to_string(), encoding);
        encoding
    }
}

impl Default for ContentExtractor {
    fn default() -> Self {
        Self::new()
    }
}

/// Valid UTF-8, or valid up to a trailing incomplete sequence cut by the
/// probe window.
fn utf8_probe_ok(probe: &[u8]) -> bool {
    match std::str::from_utf8(probe) {
        Ok(_) => true,
        Err(e) => e.error_len().is_none(),
    }
}

// ---------------------------------------------------------------------------
// Word (docx family)
// ---------------------------------------------------------------------------

type ExtractResult = Result<String, Box<dyn std::error::Error + Send + Sync>>;

fn extract_docx(path: &Path, size: u64) -> ExtractResult {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    if archive.by_name("word/document.xml").is_err() {
        debug!(path = %path.display(), "Not a Word package (no word/document.xml)");
        return Ok(String::new());
    }

    let paragraph_cap =
        if size > 50 * 1024 * 1024 { 1000 } else { usize::MAX };

    // Body first, then the auxiliary story parts in archive order
    let mut parts = vec!["word/document.xml".to_string()];
    for i in 0..archive.len() {
        let name = archive.by_index(i)?.name().to_string();
        let auxiliary = (name.starts_with("word/header") || name.starts_with("word/footer"))
            && name.ends_with(".xml")
            || name == "word/footnotes.xml"
            || name == "word/comments.xml";
        if auxiliary {
            parts.push(name);
        }
    }

    let mut out = String::new();
    let mut paragraphs = 0usize;
    for part in parts {
        if paragraphs >= paragraph_cap {
            break;
        }
        let mut xml = String::new();
        archive.by_name(&part)?.read_to_string(&mut xml)?;
        collect_word_text(&xml, &mut out, &mut paragraphs, paragraph_cap);
    }
    Ok(out)
}

/// Stream a WordprocessingML part, emitting run text in document order with
/// paragraph boundaries as newlines.
fn collect_word_text(xml: &str, out: &mut String, paragraphs: &mut usize, cap: usize) {
    let mut reader = XmlReader::from_reader(xml.as_bytes());
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"w:t" => in_text = true,
                b"w:tab" => out.push('\t'),
                b"w:br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => out.push('\t'),
                b"w:br" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_text {
                    if let Ok(text) = t.unescape() {
                        out.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => {
                    out.push('\n');
                    *paragraphs += 1;
                    if *paragraphs >= cap {
                        return;
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => return,
            Err(_) => return,
            _ => {}
        }
        buf.clear();
    }
}

// ---------------------------------------------------------------------------
// Word (legacy .doc)
// ---------------------------------------------------------------------------

const OLE_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Legacy Word: some `.doc` files are mislabeled packages and open as docx;
/// real OLE2 documents get a printable-ASCII salvage scan over the first
/// mebibyte. Everything failing that indexes by name alone upstream.
fn extract_doc_legacy(path: &Path) -> ExtractResult {
    if let Ok(file) = std::fs::File::open(path) {
        if let Ok(mut archive) = zip::ZipArchive::new(file) {
            if archive.by_name("word/document.xml").is_ok() {
                drop(archive);
                return extract_docx(path, std::fs::metadata(path).map(|m| m.len()).unwrap_or(0));
            }
        }
    }

    let mut head = Vec::new();
    std::fs::File::open(path)?.take(1024 * 1024).read_to_end(&mut head)?;

    if head.len() >= 8 && head[..8] == OLE_MAGIC {
        debug!(path = %path.display(), "OLE2 container, salvaging printable text");
    }
    let salvaged = ascii_salvage(&head);
    if salvaged.is_empty() {
        Ok(String::new())
    } else {
        Ok(format!("{} - {}", salvaged, file_name_of(path)))
    }
}

/// Printable-ASCII word scan: words of three or more characters, first 50.
fn ascii_salvage(data: &[u8]) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    for &b in data {
        let c = b as char;
        let printable = b.is_ascii_graphic() || b == b' ';
        if printable && (c.is_ascii_alphanumeric() || " .,!?-_()[]{}\":;".contains(c)) {
            if c == ' ' {
                if current.len() >= 3 {
                    words.push(std::mem::take(&mut current));
                    if words.len() >= 50 {
                        break;
                    }
                } else {
                    current.clear();
                }
            } else {
                current.push(c);
            }
        } else {
            if current.len() >= 3 {
                words.push(std::mem::take(&mut current));
                if words.len() >= 50 {
                    break;
                }
            } else {
                current.clear();
            }
        }
    }
    if current.len() >= 3 && words.len() < 50 {
        words.push(current);
    }
    words.join(" ")
}

// ---------------------------------------------------------------------------
// Excel (xlsx family)
// ---------------------------------------------------------------------------

fn extract_xlsx(path: &Path, size: u64) -> ExtractResult {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    if archive.by_name("xl/workbook.xml").is_err() {
        debug!(path = %path.display(), "Not a workbook package (no xl/workbook.xml)");
        return Ok(String::new());
    }

    let shared = match archive.by_name("xl/sharedStrings.xml") {
        Ok(mut part) => {
            let mut xml = String::new();
            part.read_to_string(&mut xml)?;
            parse_shared_strings(&xml)
        }
        Err(_) => Vec::new(),
    };

    // Worksheets in workbook order (numeric sheet file order)
    let mut sheet_names: Vec<(usize, String)> = Vec::new();
    for i in 0..archive.len() {
        let name = archive.by_index(i)?.name().to_string();
        if let Some(rest) = name.strip_prefix("xl/worksheets/sheet") {
            if let Some(num) = rest.strip_suffix(".xml").and_then(|s| s.parse::<usize>().ok()) {
                sheet_names.push((num, name));
            }
        }
    }
    sheet_names.sort_by_key(|(num, _)| *num);

    let (sheet_cap, row_cap) =
        if size > 50 * 1024 * 1024 { (3, 5000) } else { (usize::MAX, usize::MAX) };

    let mut out = String::new();
    for (_, sheet) in sheet_names.into_iter().take(sheet_cap) {
        let mut xml = String::new();
        archive.by_name(&sheet)?.read_to_string(&mut xml)?;
        collect_sheet_text(&xml, &shared, row_cap, &mut out);
    }
    Ok(out)
}

/// Shared strings: one concatenated string per `<si>` item.
fn parse_shared_strings(xml: &str) -> Vec<String> {
    let mut reader = XmlReader::from_reader(xml.as_bytes());
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_text = true,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                if in_text {
                    if let Ok(text) = t.unescape() {
                        current.push_str(&text);
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"t" => in_text = false,
                b"si" => strings.push(current.clone()),
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }
    strings
}

/// Walk one worksheet, resolving shared-string cells and emitting values in
/// row order: cells joined by spaces, rows by newlines.
fn collect_sheet_text(xml: &str, shared: &[String], row_cap: usize, out: &mut String) {
    let mut reader = XmlReader::from_reader(xml.as_bytes());
    let mut buf = Vec::new();
    let mut rows = 0usize;
    let mut cell_type: Option<String> = None;
    let mut in_value = false;
    let mut in_inline_text = false;
    let mut row_values: Vec<String> = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => match e.name().as_ref() {
                b"row" => row_values.clear(),
                b"c" => {
                    cell_type = e
                        .try_get_attribute("t")
                        .ok()
                        .flatten()
                        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()));
                }
                b"v" => in_value = true,
                b"t" => in_inline_text = true,
                _ => {}
            },
            Ok(Event::Text(t)) => {
                let Ok(text) = t.unescape() else {
                    buf.clear();
                    continue;
                };
                if in_value {
                    let resolved = match cell_type.as_deref() {
                        Some("s") => text
                            .trim()
                            .parse::<usize>()
                            .ok()
                            .and_then(|i| shared.get(i).cloned())
                            .unwrap_or_default(),
                        Some("b") => {
                            if text.trim() == "1" { "true".to_string() } else { "false".to_string() }
                        }
                        _ => text.into_owned(),
                    };
                    let trimmed = resolved.trim();
                    if !trimmed.is_empty() {
                        row_values.push(trimmed.to_string());
                    }
                } else if in_inline_text {
                    let trimmed = text.trim();
                    if !trimmed.is_empty() {
                        row_values.push(trimmed.to_string());
                    }
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"v" => in_value = false,
                b"t" => in_inline_text = false,
                b"row" => {
                    if !row_values.is_empty() {
                        out.push_str(&row_values.join(" "));
                        out.push('\n');
                    }
                    rows += 1;
                    if rows >= row_cap {
                        return;
                    }
                }
                _ => {}
            },
            Ok(Event::Eof) => return,
            Err(_) => return,
            _ => {}
        }
        buf.clear();
    }
}

// ---------------------------------------------------------------------------
// Excel (legacy .xls / binary .xlsb)
// ---------------------------------------------------------------------------

fn extract_excel_binary(path: &Path) -> ExtractResult {
    let mut workbook = open_workbook_auto(path)?;
    let names: Vec<String> = workbook.sheet_names().to_vec();
    let mut out = String::new();

    for name in names {
        let Some(Ok(range)) = workbook.worksheet_range(&name) else { continue };
        out.push_str(&format!("[{name}]\n"));
        for row in range.rows() {
            let mut values: Vec<String> = Vec::new();
            for cell in row {
                let value = match cell {
                    DataType::String(s) => s.trim().to_string(),
                    DataType::Float(f) => {
                        if f.fract() == 0.0 {
                            format!("{}", *f as i64)
                        } else {
                            f.to_string()
                        }
                    }
                    DataType::Int(i) => i.to_string(),
                    DataType::Bool(b) => b.to_string(),
                    DataType::DateTime(d) => d.to_string(),
                    _ => String::new(),
                };
                if !value.is_empty() {
                    values.push(value);
                }
            }
            if !values.is_empty() {
                out.push_str(&values.join(" "));
                out.push('\n');
            }
        }
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// PDF
// ---------------------------------------------------------------------------

fn extract_pdf(path: &Path) -> ExtractResult {
    match lopdf::Document::load(path) {
        Ok(doc) => {
            let mut pages: Vec<u32> = doc.get_pages().keys().copied().collect();
            pages.sort_unstable();
            pages.truncate(PDF_MAX_PAGES);

            let texts: Vec<String> = if pages.len() >= PDF_PARALLEL_THRESHOLD {
                let pool = rayon::ThreadPoolBuilder::new()
                    .num_threads(PDF_PARALLEL_WORKERS)
                    .build()?;
                pool.install(|| {
                    use rayon::prelude::*;
                    pages
                        .par_iter()
                        .map(|n| doc.extract_text(&[*n]).unwrap_or_default())
                        .collect()
                })
            } else {
                pages.iter().map(|n| doc.extract_text(&[*n]).unwrap_or_default()).collect()
            };

            let joined = texts.join(" ");
            Ok(truncate_chars(&joined, PDF_MAX_CHARS).to_string())
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "PDF parser failed, scanning literals");
            pdf_literal_fallback(path)
        }
    }
}

/// Last-resort PDF path: pull parenthesized string literals out of the raw
/// bytes of the first mebibyte.
fn pdf_literal_fallback(path: &Path) -> ExtractResult {
    static LITERAL: OnceLock<regex::bytes::Regex> = OnceLock::new();
    let re = LITERAL.get_or_init(|| {
        regex::bytes::Regex::new(r"\(([^()]{3,})\)").expect("literal pattern compiles")
    });

    let mut head = Vec::new();
    std::fs::File::open(path)?.take(1024 * 1024).read_to_end(&mut head)?;

    let mut parts: Vec<String> = Vec::new();
    for cap in re.captures_iter(&head) {
        if let Some(m) = cap.get(1) {
            let text = String::from_utf8_lossy(m.as_bytes());
            let trimmed = text.trim();
            if trimmed.chars().count() > 2 && trimmed.chars().any(|c| c.is_alphanumeric()) {
                parts.push(trimmed.to_string());
            }
        }
    }
    Ok(parts.join(" "))
}

// ---------------------------------------------------------------------------
// ZIP archives
// ---------------------------------------------------------------------------

fn text_like_extensions() -> &'static HashSet<&'static str> {
    static EXTS: OnceLock<HashSet<&'static str>> = OnceLock::new();
    EXTS.get_or_init(|| {
        ["txt", "md", "log", "csv", "json", "xml", "html", "htm", "py", "js", "css"]
            .into_iter()
            .collect()
    })
}

/// Concatenate the text-like members of an archive with `[name]` markers.
fn extract_zip(path: &Path) -> ExtractResult {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut sections: Vec<String> = Vec::new();

    for i in 0..archive.len() {
        if sections.len() >= ZIP_MAX_ENTRIES {
            debug!(path = %path.display(), "Archive member limit reached");
            break;
        }
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();
        let ext = name.rsplit_once('.').map(|(_, e)| e.to_lowercase()).unwrap_or_default();
        if !text_like_extensions().contains(ext.as_str()) {
            continue;
        }
        if entry.size() > ZIP_MAX_ENTRY_BYTES {
            debug!(member = name.as_str(), size = entry.size(), "Large archive member skipped");
            continue;
        }

        let mut raw = Vec::with_capacity(entry.size() as usize);
        if entry.read_to_end(&mut raw).is_err() {
            continue;
        }
        let text = decode_member(&raw);
        if !text.trim().is_empty() {
            sections.push(format!("[{}]\n{}", name, text.trim()));
        }
    }

    Ok(sections.join("\n\n"))
}

fn decode_member(raw: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(raw) {
        return text.to_string();
    }
    let (text, _, had_errors) = SHIFT_JIS.decode(raw);
    if !had_errors {
        return text.into_owned();
    }
    let mut detector = EncodingDetector::new();
    detector.feed(raw, true);
    let (text, _, _) = detector.guess(None, true).decode(raw);
    text.into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn extractor() -> ContentExtractor {
        ContentExtractor::new()
    }

    #[test]
    fn dispatch_covers_accepted_formats() {
        assert_eq!(ExtractorKind::from_extension("txt"), ExtractorKind::Text);
        assert_eq!(ExtractorKind::from_extension("docx"), ExtractorKind::WordXml);
        assert_eq!(ExtractorKind::from_extension("doc"), ExtractorKind::WordLegacy);
        assert_eq!(ExtractorKind::from_extension("xlsb"), ExtractorKind::ExcelBinary);
        assert_eq!(ExtractorKind::from_extension("jww"), ExtractorKind::NameOnly);
        assert_eq!(ExtractorKind::from_extension("exe"), ExtractorKind::Unsupported);
    }

    #[test]
    fn utf8_text_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "検索テスト ABC").unwrap();

        let content = extractor().extract_for_index(&path, 20).expect("indexed");
        assert_eq!(content, "検索テスト ABC");
    }

    #[test]
    fn shift_jis_text_is_decoded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sjis.txt");
        let (encoded, _, _) = SHIFT_JIS.encode("日本語のテキストです。検索対象。");
        std::fs::write(&path, &encoded).unwrap();

        let size = encoded.len() as u64;
        let content = extractor().extract_for_index(&path, size).expect("indexed");
        assert!(content.contains("検索対象"), "got: {content}");
    }

    #[test]
    fn large_file_indexes_name_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        std::fs::write(&path, b"%PDF-1.4 stub").unwrap();

        let content = extractor()
            .extract_for_index(&path, NAME_ONLY_THRESHOLD + 1)
            .expect("name-only indexed");
        assert_eq!(content, "report.pdf");
    }

    #[test]
    fn oversized_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.txt");
        std::fs::write(&path, b"x").unwrap();
        assert!(extractor().extract_for_index(&path, MAX_FILE_SIZE).is_none());
    }

    #[test]
    fn cad_format_is_name_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("floorplan.jww");
        std::fs::write(&path, b"binary drawing data").unwrap();

        let content = extractor().extract_for_index(&path, 19).expect("indexed");
        assert_eq!(content, "floorplan.jww");
    }

    fn write_zip(path: &Path, members: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in members {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    #[test]
    fn zip_members_concatenate_with_markers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        write_zip(
            &path,
            &[
                ("notes.txt", b"meeting notes".as_slice()),
                ("data.bin", b"\x00\x01\x02".as_slice()),
                ("readme.md", b"project readme".as_slice()),
            ],
        );

        let size = std::fs::metadata(&path).unwrap().len();
        let content = extractor().extract_for_index(&path, size).expect("indexed");
        assert!(content.contains("[notes.txt]"));
        assert!(content.contains("meeting notes"));
        assert!(content.contains("[readme.md]"));
        assert!(!content.contains("data.bin"), "binary member must be skipped");
    }

    #[test]
    fn docx_paragraphs_extract_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memo.docx");
        let document_xml = r#"<?xml version="1.0"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>First paragraph</w:t></w:r></w:p>
    <w:p><w:r><w:t>Second</w:t></w:r><w:r><w:t xml:space="preserve"> half</w:t></w:r></w:p>
  </w:body>
</w:document>"#;
        write_zip(&path, &[("word/document.xml", document_xml.as_bytes())]);

        let size = std::fs::metadata(&path).unwrap().len();
        let content = extractor().extract_for_index(&path, size).expect("indexed");
        assert!(content.contains("First paragraph"));
        assert!(content.contains("Second half"));
        let first = content.find("First").unwrap();
        let second = content.find("Second").unwrap();
        assert!(first < second, "paragraph order preserved");
    }

    #[test]
    fn docx_without_document_part_yields_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.docx");
        write_zip(&path, &[("word/other.xml", b"<x/>".as_slice())]);

        let size = std::fs::metadata(&path).unwrap().len();
        assert!(extractor().extract_for_index(&path, size).is_none());
    }

    #[test]
    fn xlsx_shared_strings_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table.xlsx");
        let workbook = r#"<?xml version="1.0"?><workbook/>"#;
        let shared = r#"<?xml version="1.0"?>
<sst><si><t>budget</t></si><si><t>total</t></si></sst>"#;
        let sheet = r#"<?xml version="1.0"?>
<worksheet>
  <sheetData>
    <row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><v>1500</v></c></row>
    <row r="2"><c r="A2" t="s"><v>1</v></c><c r="B2" t="b"><v>1</v></c></row>
  </sheetData>
</worksheet>"#;
        write_zip(
            &path,
            &[
                ("xl/workbook.xml", workbook.as_bytes()),
                ("xl/sharedStrings.xml", shared.as_bytes()),
                ("xl/worksheets/sheet1.xml", sheet.as_bytes()),
            ],
        );

        let size = std::fs::metadata(&path).unwrap().len();
        let content = extractor().extract_for_index(&path, size).expect("indexed");
        assert!(content.contains("budget 1500"), "got: {content}");
        assert!(content.contains("total true"), "got: {content}");
    }

    #[test]
    fn legacy_doc_salvages_printable_words() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old.doc");
        let mut data = OLE_MAGIC.to_vec();
        data.extend_from_slice(b"\x00\x01garbage\x02contract renewal terms\x00\x03");
        std::fs::write(&path, &data).unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let content = extractor().extract_for_index(&path, size).expect("indexed");
        assert!(content.contains("contract"));
        assert!(content.contains("renewal"));
        assert!(content.contains("old.doc"));
    }

    #[test]
    fn legacy_doc_without_salvageable_text_indexes_name_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opaque.doc");
        // Genuine OLE2 magic followed by nothing printable
        let mut data = OLE_MAGIC.to_vec();
        data.extend(std::iter::repeat(0u8).take(512));
        std::fs::write(&path, &data).unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let content = extractor().extract_for_index(&path, size).expect("name still indexed");
        assert_eq!(content, "opaque.doc");
    }

    #[test]
    fn unreadable_xls_indexes_name_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.xls");
        std::fs::write(&path, b"\x00\x01\x02 not a workbook").unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let content = extractor().extract_for_index(&path, size).expect("name still indexed");
        assert_eq!(content, "broken.xls");
    }

    #[test]
    fn pdf_literal_fallback_finds_strings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("odd.pdf");
        std::fs::write(&path, b"not really a pdf BT (Hello searchable world) ET (xy)").unwrap();

        let size = std::fs::metadata(&path).unwrap().len();
        let content = extractor().extract_for_index(&path, size).expect("indexed");
        assert!(content.contains("Hello searchable world"));
        assert!(!content.contains("xy"), "short literals are noise");
    }

    #[test]
    fn ascii_salvage_keeps_words_only() {
        let out = ascii_salvage(b"\x00ab\x01hello world of text\x02x\x03");
        assert_eq!(out, "hello world text");
    }
}

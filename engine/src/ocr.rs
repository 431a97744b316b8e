//! OCR subpipeline for TIFF images.
//!
//! Results are cached by `(path, mtime)` — misses included, so a hopeless
//! image is never retried. The engine itself is a pluggable backend; the
//! default shells out to a `tesseract` binary discovered once per process,
//! and a missing engine simply yields empty text (the file name still gets
//! indexed).

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, GrayImage};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::Path;
use std::process::Command;
use std::sync::{Mutex, OnceLock};
use tracing::{debug, info, warn};

/// Result cache capacity.
const OCR_CACHE_CAP: usize = 1000;

/// Input size gates.
const MIN_IMAGE_BYTES: u64 = 1024;
const MAX_IMAGE_BYTES: u64 = 30 * 1024 * 1024;

/// Minimum pixels after resizing; smaller images carry no legible text.
const MIN_PIXELS: u32 = 10_000;

/// OCR text is capped at this many characters.
const MAX_OCR_CHARS: usize = 5000;

const ASCII_WHITELIST: &str =
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

// ---------------------------------------------------------------------------
// Backend seam
// ---------------------------------------------------------------------------

/// Recognition engine boundary. Tests inject a counting fake here.
pub trait OcrBackend: Send + Sync {
    fn available(&self) -> bool;
    /// Run recognition over a PNG on disk. `None` means the engine failed.
    fn recognize(&self, image: &Path, lang: Option<&str>, extra_args: &[&str]) -> Option<String>;
}

/// Default backend: the `tesseract` CLI.
pub struct TesseractCli {
    probed: OnceLock<bool>,
}

impl TesseractCli {
    pub fn new() -> Self {
        Self { probed: OnceLock::new() }
    }
}

impl Default for TesseractCli {
    fn default() -> Self {
        Self::new()
    }
}

impl OcrBackend for TesseractCli {
    fn available(&self) -> bool {
        *self.probed.get_or_init(|| {
            let found = Command::new("tesseract")
                .arg("--version")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false);
            if found {
                info!("Tesseract OCR engine found");
            } else {
                warn!("Tesseract OCR engine not found; TIFF files index by name only");
            }
            found
        })
    }

    fn recognize(&self, image: &Path, lang: Option<&str>, extra_args: &[&str]) -> Option<String> {
        let mut cmd = Command::new("tesseract");
        cmd.arg(image).arg("stdout");
        if let Some(lang) = lang {
            cmd.args(["-l", lang]);
        }
        cmd.args(extra_args);
        let output = cmd.output().ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Extractor
// ---------------------------------------------------------------------------

pub struct OcrExtractor {
    backend: Box<dyn OcrBackend>,
    cache: Mutex<LruCache<(String, u64), String>>,
}

impl OcrExtractor {
    pub fn new(backend: Box<dyn OcrBackend>) -> Self {
        let cap = NonZeroUsize::new(OCR_CACHE_CAP).expect("cache capacity is non-zero");
        Self { backend, cache: Mutex::new(LruCache::new(cap)) }
    }

    /// Extract text from an image file, consulting the result cache first.
    pub fn extract(&self, path: &Path) -> String {
        let Ok(meta) = std::fs::metadata(path) else { return String::new() };
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let key = (path.to_string_lossy().into_owned(), mtime);

        if let Some(hit) = self.cache.lock().expect("ocr cache poisoned").get(&key) {
            debug!(path = %path.display(), chars = hit.len(), "OCR cache hit");
            return hit.clone();
        }

        let result = self.run_pipeline(path, meta.len());
        self.cache.lock().expect("ocr cache poisoned").put(key, result.clone());
        result
    }

    fn run_pipeline(&self, path: &Path, file_size: u64) -> String {
        if !self.backend.available() {
            return String::new();
        }
        if !(MIN_IMAGE_BYTES..=MAX_IMAGE_BYTES).contains(&file_size) {
            debug!(path = %path.display(), size = file_size, "Image outside OCR size gates");
            return String::new();
        }

        let Some(prepared) = prepare_image(path, file_size) else { return String::new() };

        // Hand the preprocessed frame to the engine through a temp PNG
        let Ok(tmp) = tempfile::Builder::new().suffix(".png").tempfile() else {
            return String::new();
        };
        if DynamicImage::ImageLuma8(prepared).save(tmp.path()).is_err() {
            return String::new();
        }

        let text = self.run_phases(tmp.path(), path, file_size);
        let filtered = quality_filter(&text);
        if filtered.len() > 10 {
            info!(path = %path.display(), chars = filtered.len(), "OCR extracted text");
        }
        filtered
    }

    /// Phased execution, cheapest first, stopping at acceptable output.
    fn run_phases(&self, image: &Path, source: &Path, file_size: u64) -> String {
        let whitelist = format!("tessedit_char_whitelist={ASCII_WHITELIST}");

        // Phase 1: ASCII-only whitelist, fastest model path
        let mut text = self
            .backend
            .recognize(image, Some("eng"), &["--oem", "1", "--psm", "6", "-c", &whitelist])
            .map(|t| t.trim().to_string())
            .unwrap_or_default();

        // Phase 2: unrestricted English
        if text.chars().count() < 5 {
            if let Some(t) =
                self.backend.recognize(image, Some("eng"), &["--oem", "1", "--psm", "6"])
            {
                let t = t.trim().to_string();
                if t.chars().count() > text.chars().count() {
                    text = t;
                }
            }
        }

        // Phase 3: Japanese, only when cheap passes found nothing and the
        // source is small or the name itself suggests Japanese content
        let wants_japanese =
            file_size < 5 * 1024 * 1024 || filename_hints_japanese(source);
        if text.chars().count() < 3 && wants_japanese {
            if let Some(t) =
                self.backend.recognize(image, Some("jpn"), &["--oem", "1", "--psm", "6"])
            {
                let t = t.trim().to_string();
                if t.chars().count() > text.chars().count() {
                    text = t;
                }
            }
        }

        // Phase 4: minimal settings as the last resort
        if text.is_empty() {
            if let Some(t) = self.backend.recognize(image, None, &["--psm", "6"]) {
                text = t.trim().to_string();
            }
        }

        text
    }
}

// ---------------------------------------------------------------------------
// Preprocessing
// ---------------------------------------------------------------------------

/// Adaptive pixel budget: smaller sources may spend more pixels.
fn pixel_budget(file_size: u64) -> u32 {
    if file_size < 2 * 1024 * 1024 {
        1_500_000
    } else if file_size < 5 * 1024 * 1024 {
        1_000_000
    } else {
        600_000
    }
}

fn prepare_image(path: &Path, file_size: u64) -> Option<GrayImage> {
    let img = match image::open(path) {
        Ok(img) => img,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Image failed to load");
            return None;
        }
    };

    let (w, h) = (img.width(), img.height());
    let total = w.saturating_mul(h);
    let budget = pixel_budget(file_size);

    let img = if total > budget {
        let scale = (budget as f64 / total as f64).sqrt();
        let nw = ((w as f64 * scale) as u32).max(1);
        let nh = ((h as f64 * scale) as u32).max(1);
        debug!(path = %path.display(), from = format!("{w}x{h}"), to = format!("{nw}x{nh}"), "Resized for OCR");
        img.resize_exact(nw, nh, FilterType::Triangle)
    } else {
        img
    };

    if img.width().saturating_mul(img.height()) < MIN_PIXELS {
        return None;
    }

    let gray = img.to_luma8();
    if file_size < 2 * 1024 * 1024 {
        Some(adaptive_threshold(&gray))
    } else {
        Some(gray)
    }
}

/// Local-mean binarization over an integral image; window is an eighth of
/// the short edge.
fn adaptive_threshold(gray: &GrayImage) -> GrayImage {
    let (w, h) = gray.dimensions();
    if w < 16 || h < 16 {
        return gray.clone();
    }

    let wu = w as usize;
    let hu = h as usize;
    let mut integral = vec![0u64; (wu + 1) * (hu + 1)];
    for y in 0..hu {
        let mut row_sum = 0u64;
        for x in 0..wu {
            row_sum += u64::from(gray.get_pixel(x as u32, y as u32)[0]);
            integral[(y + 1) * (wu + 1) + (x + 1)] = integral[y * (wu + 1) + (x + 1)] + row_sum;
        }
    }

    let window = (w.min(h) / 8).max(8) as usize;
    let half = window / 2;
    let mut out = GrayImage::new(w, h);
    for y in 0..hu {
        let y0 = y.saturating_sub(half);
        let y1 = (y + half + 1).min(hu);
        for x in 0..wu {
            let x0 = x.saturating_sub(half);
            let x1 = (x + half + 1).min(wu);
            let area = ((y1 - y0) * (x1 - x0)) as u64;
            let sum = integral[y1 * (wu + 1) + x1] + integral[y0 * (wu + 1) + x0]
                - integral[y0 * (wu + 1) + x1]
                - integral[y1 * (wu + 1) + x0];
            let mean = sum / area.max(1);
            let pixel = u64::from(gray.get_pixel(x as u32, y as u32)[0]);
            // 10% below the local mean counts as ink
            let value = if pixel * 100 < mean * 90 { 0u8 } else { 255u8 };
            out.put_pixel(x as u32, y as u32, image::Luma([value]));
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Result filtering
// ---------------------------------------------------------------------------

/// Reject noise: too little text or too few distinct glyphs. Survivors are
/// whitespace-collapsed and capped.
fn quality_filter(text: &str) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() < 2 {
        return String::new();
    }
    let distinct: std::collections::HashSet<char> =
        trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if distinct.len() < 3 {
        return String::new();
    }
    let collapsed = trimmed.split_whitespace().collect::<Vec<_>>().join(" ");
    docfind_core::truncate_chars(&collapsed, MAX_OCR_CHARS).to_string()
}

fn filename_hints_japanese(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| {
            n.chars().any(|c| {
                ('\u{3040}'..='\u{30FF}').contains(&c) || ('\u{4E00}'..='\u{9FFF}').contains(&c)
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Backend fake that counts invocations and returns a fixed string.
    pub struct CountingBackend {
        pub calls: Arc<AtomicUsize>,
        pub reply: String,
    }

    impl OcrBackend for CountingBackend {
        fn available(&self) -> bool {
            true
        }
        fn recognize(&self, _: &Path, _: Option<&str>, _: &[&str]) -> Option<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(self.reply.clone())
        }
    }

    fn write_test_tiff(path: &Path) {
        // 200x200 white frame with a dark block, padded past the 1 KiB gate
        let mut img = GrayImage::from_pixel(200, 200, image::Luma([255]));
        for y in 50..150 {
            for x in 50..150 {
                img.put_pixel(x, y, image::Luma([20]));
            }
        }
        DynamicImage::ImageLuma8(img).save(path).expect("test tiff written");
        let len = std::fs::metadata(path).unwrap().len();
        if len < MIN_IMAGE_BYTES {
            // uncompressed grayscale easily exceeds 1 KiB, but stay safe
            let mut raw = std::fs::read(path).unwrap();
            raw.extend(std::iter::repeat(0u8).take((MIN_IMAGE_BYTES - len) as usize));
            std::fs::write(path, raw).unwrap();
        }
    }

    #[test]
    fn second_extraction_hits_cache() {
        let dir = tempfile::tempdir().unwrap();
        let tiff = dir.path().join("scan.tif");
        write_test_tiff(&tiff);

        let calls = Arc::new(AtomicUsize::new(0));
        let ocr = OcrExtractor::new(Box::new(CountingBackend {
            calls: Arc::clone(&calls),
            reply: "SCANNED DOCUMENT 42".to_string(),
        }));

        let first = ocr.extract(&tiff);
        let after_first = calls.load(Ordering::SeqCst);
        assert!(after_first >= 1, "backend invoked on miss");
        assert_eq!(first, "SCANNED DOCUMENT 42");

        let second = ocr.extract(&tiff);
        assert_eq!(calls.load(Ordering::SeqCst), after_first, "cache hit skipped the engine");
        assert_eq!(second, first);
    }

    #[test]
    fn misses_are_cached_too() {
        let dir = tempfile::tempdir().unwrap();
        let tiff = dir.path().join("noise.tif");
        write_test_tiff(&tiff);

        let calls = Arc::new(AtomicUsize::new(0));
        // One distinct glyph: fails the quality filter in every phase
        let ocr = OcrExtractor::new(Box::new(CountingBackend {
            calls: Arc::clone(&calls),
            reply: "aaaa".to_string(),
        }));

        assert_eq!(ocr.extract(&tiff), "");
        let after_first = calls.load(Ordering::SeqCst);
        assert_eq!(ocr.extract(&tiff), "");
        assert_eq!(calls.load(Ordering::SeqCst), after_first, "empty result cached");
    }

    #[test]
    fn quality_filter_rejects_short_and_uniform() {
        assert_eq!(quality_filter("a"), "");
        assert_eq!(quality_filter("ababab"), "");
        assert_eq!(quality_filter("  real   text\nhere  "), "real text here");
    }

    #[test]
    fn japanese_filename_hint() {
        assert!(filename_hints_japanese(Path::new("/x/請求書.tif")));
        assert!(!filename_hints_japanese(Path::new("/x/invoice.tif")));
    }
}

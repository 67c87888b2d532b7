//! Extension-keyed decoder registry.
//!
//! Each [`DecodeStrategy`] turns file bytes into ordered [`DecodedPage`]s.
//! Page-level failures are reported in [`DecodeOutput::page_failures`]
//! next to an empty text page, so one bad page never drops the file.

mod html;
mod image;
mod office;
mod pdf;
mod text;

pub use self::html::{CrawledPage, HtmlDecoder};
pub use self::image::ImageDecoder;
pub use self::office::OfficeDecoder;
pub use self::pdf::{LopdfExtractor, PdfDecoder, PdfExtractor, PdfPage};
pub use self::text::PlainTextDecoder;

use crate::error::IngestError;
use crate::models::DecodedPage;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const TEXT_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "rst", "csv", "tsv", "log", "json", "yaml", "yml", "toml", "ini",
    "cfg", "conf", "xml", "rs", "py", "js", "ts", "tsx", "jsx", "java", "kt", "go", "c", "h",
    "cc", "cpp", "hpp", "cs", "rb", "php", "sh", "bash", "sql", "swift", "scala", "lua", "r",
];
pub const OFFICE_EXTENSIONS: &[&str] = &["docx", "pptx", "xlsx"];
pub const HTML_EXTENSIONS: &[&str] = &["html", "htm", "crawl"];
pub const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp", "gif", "tif", "tiff", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeOptions {
    pub use_ocr: bool,
    pub generate_summary: bool,
    /// Pages with fewer non-whitespace chars become OCR candidates when `use_ocr` is set.
    pub min_text_chars: usize,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            use_ocr: false,
            generate_summary: false,
            min_text_chars: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFailure {
    pub page_index: u32,
    pub details: String,
}

#[derive(Debug, Clone, Default)]
pub struct DecodeOutput {
    pub pages: Vec<DecodedPage>,
    pub page_failures: Vec<PageFailure>,
}

impl DecodeOutput {
    pub fn from_pages(pages: Vec<DecodedPage>) -> Self {
        Self {
            pages,
            page_failures: Vec::new(),
        }
    }

    pub fn ocr_pages(&self) -> usize {
        self.pages.iter().filter(|page| page.needs_ocr()).count()
    }
}

pub trait DecodeStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn decode(
        &self,
        path: &Path,
        bytes: &[u8],
        options: &DecodeOptions,
    ) -> Result<DecodeOutput, IngestError>;
}

/// Fallback strategy that rejects the extension.
#[derive(Debug, Default)]
pub struct UnsupportedDecoder;

impl DecodeStrategy for UnsupportedDecoder {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn decode(
        &self,
        path: &Path,
        _bytes: &[u8],
        _options: &DecodeOptions,
    ) -> Result<DecodeOutput, IngestError> {
        Err(IngestError::UnsupportedType {
            path: path.display().to_string(),
            extension: normalized_extension(path),
        })
    }
}

pub struct DecoderRegistry {
    strategies: HashMap<String, Arc<dyn DecodeStrategy>>,
    default: Arc<dyn DecodeStrategy>,
}

impl DecoderRegistry {
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
            default: Arc::new(UnsupportedDecoder),
        }
    }

    /// Every built-in format; unknown extensions are rejected.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(TEXT_EXTENSIONS, Arc::new(PlainTextDecoder));
        registry.register(&["pdf"], Arc::new(PdfDecoder::default()));
        registry.register(OFFICE_EXTENSIONS, Arc::new(OfficeDecoder));
        registry.register(HTML_EXTENSIONS, Arc::new(HtmlDecoder));
        registry.register(IMAGE_EXTENSIONS, Arc::new(ImageDecoder));
        registry
    }

    pub fn register(&mut self, extensions: &[&str], strategy: Arc<dyn DecodeStrategy>) {
        for extension in extensions {
            self.strategies
                .insert(extension.to_ascii_lowercase(), Arc::clone(&strategy));
        }
    }

    pub fn with_default(mut self, strategy: Arc<dyn DecodeStrategy>) -> Self {
        self.default = strategy;
        self
    }

    pub fn strategy_for(&self, extension: &str) -> Arc<dyn DecodeStrategy> {
        self.strategies
            .get(&extension.to_ascii_lowercase())
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    pub fn supports(&self, path: &Path) -> bool {
        self.strategies.contains_key(&normalized_extension(path))
    }

    /// Reads the file and dispatches on its lowercased extension.
    ///
    /// Empty files decode to zero pages.
    pub fn decode(&self, path: &Path, options: &DecodeOptions) -> Result<DecodeOutput, IngestError> {
        if !path.is_file() {
            return Err(IngestError::SourceMissing(path.display().to_string()));
        }
        let strategy = self.strategy_for(&normalized_extension(path));
        let bytes = std::fs::read(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => IngestError::SourceMissing(path.display().to_string()),
            _ => IngestError::Io(error),
        })?;
        if bytes.is_empty() {
            return Ok(DecodeOutput::default());
        }
        strategy.decode(path, &bytes, options)
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

pub fn normalized_extension(path: &Path) -> String {
    path.extension()
        .and_then(|extension| extension.to_str())
        .map(|extension| extension.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

pub(crate) fn non_whitespace_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;

pub const MANIFEST_VERSION: &str = "1";

/// One decoded unit of a source file, in page order.
#[derive(Debug, Clone)]
pub struct DecodedPage {
    pub page_index: u32,
    pub content: PageContent,
}

#[derive(Debug, Clone)]
pub enum PageContent {
    Text(String),
    /// Raster page that still needs OCR.
    Image(DynamicImage),
}

impl DecodedPage {
    pub fn text(page_index: u32, text: impl Into<String>) -> Self {
        Self {
            page_index,
            content: PageContent::Text(text.into()),
        }
    }

    pub fn image(page_index: u32, image: DynamicImage) -> Self {
        Self {
            page_index,
            content: PageContent::Image(image),
        }
    }

    pub fn needs_ocr(&self) -> bool {
        matches!(self.content, PageContent::Image(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match &self.content {
            PageContent::Text(text) => Some(text),
            PageContent::Image(_) => None,
        }
    }
}

/// Pixel extent of the raster a chunk was recognized from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct BoundingHint {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub chunk_id: String,
    pub source_name: String,
    pub content_hash: String,
    pub chunk_index: u64,
    pub page_index: Option<u32>,
    /// Character offset of the chunk inside its page text.
    pub offset: usize,
    pub text: String,
    pub bounding_hint: Option<BoundingHint>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub name: String,
    pub size: u64,
    pub content_hash: String,
    #[serde(rename = "type")]
    pub file_type: String,
    pub language: String,
    pub category: String,
    pub keywords: Vec<String>,
    pub summary: String,
    pub chunk_ids: Vec<String>,
    /// Other names this exact content was submitted under.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(alias = "created_at")]
    pub added_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn manifest_entry(&self) -> ManifestFile {
        ManifestFile {
            path: self.path.clone(),
            name: self.name.clone(),
            content_hash: self.content_hash.clone(),
            size: self.size,
            file_type: self.file_type.clone(),
            added_at: self.added_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FileStats {
    pub hit_count: u64,
    pub total_score: f64,
    pub avg_score: f64,
    pub first_accessed: Option<DateTime<Utc>>,
    pub last_accessed: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestFile {
    pub path: String,
    pub name: String,
    pub content_hash: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub file_type: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub version: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub created_at: DateTime<Utc>,
    pub file_count: usize,
    pub total_size: u64,
    pub files: Vec<ManifestFile>,
    /// Names the docstore, vector and file-metadata files this manifest commits.
    #[serde(default)]
    pub generation: u64,
}

impl Manifest {
    pub fn new(embedding_model: impl Into<String>, embedding_dim: usize) -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            embedding_model: embedding_model.into(),
            embedding_dim,
            created_at: Utc::now(),
            file_count: 0,
            total_size: 0,
            files: Vec::new(),
            generation: 0,
        }
    }

    /// Rebuilds the inventory from the live file records, sorted by name.
    pub fn refresh_inventory<'a>(&mut self, records: impl IntoIterator<Item = &'a FileRecord>) {
        let mut files: Vec<ManifestFile> = records.into_iter().map(FileRecord::manifest_entry).collect();
        files.sort_by(|left, right| left.name.cmp(&right.name));
        self.file_count = files.len();
        self.total_size = files.iter().map(|file| file.size).sum();
        self.files = files;
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocstoreEntry {
    pub text: String,
    pub source_name: String,
    pub page_index: Option<u32>,
    pub offset: usize,
    pub bounding_hint: Option<BoundingHint>,
}

impl From<&Chunk> for DocstoreEntry {
    fn from(chunk: &Chunk) -> Self {
        Self {
            text: chunk.text.clone(),
            source_name: chunk.source_name.clone(),
            page_index: chunk.page_index,
            offset: chunk.offset,
            bounding_hint: chunk.bounding_hint,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub chunk_id: String,
    pub text: String,
    pub source_name: String,
    pub page_index: Option<u32>,
    /// Final score used for ordering.
    pub score: f64,
    pub dense_score: f64,
    pub lexical_score: Option<f64>,
    pub rerank_score: Option<f64>,
    pub file: Option<FileRecord>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct IngestOptions {
    pub use_ocr: bool,
    pub generate_summary: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrievalOptions {
    pub top_k: usize,
    pub candidate_k: usize,
    pub enable_bm25: bool,
    pub enable_rerank: bool,
    pub rerank_model: String,
    pub dense_weight: f64,
    pub lexical_weight: f64,
}

impl Default for RetrievalOptions {
    fn default() -> Self {
        Self {
            top_k: 3,
            candidate_k: 10,
            enable_bm25: false,
            enable_rerank: false,
            rerank_model: crate::rerank::OVERLAP_RERANKER.to_string(),
            dense_weight: 0.6,
            lexical_weight: 0.4,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FollowUpOptions {
    pub num_questions: usize,
    pub existing_questions: Vec<String>,
    pub timeout_s: u64,
    pub probe_retriever: bool,
}

impl Default for FollowUpOptions {
    fn default() -> Self {
        Self {
            num_questions: 3,
            existing_questions: Vec::new(),
            timeout_s: 15,
            probe_retriever: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KbSummary {
    pub slug: String,
    pub embedding_model: String,
    pub embedding_dim: usize,
    pub file_count: usize,
    pub chunk_count: usize,
    pub total_size: u64,
    pub created_at: DateTime<Utc>,
}

use crate::{IngestError, SearchError};
use async_trait::async_trait;
use std::path::Path;

/// Recognizes text in a preprocessed page image.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    /// `languages` uses the `chi_sim+eng` form; `psm` is the page-segmentation mode.
    async fn recognize(&self, png_path: &Path, languages: &str, psm: u8) -> Result<String, IngestError>;
}

/// Text completion backend used for follow-up questions and summaries.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, system: &str, prompt: &str) -> Result<String, SearchError>;
}

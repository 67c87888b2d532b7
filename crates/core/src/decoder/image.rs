use super::{DecodeOptions, DecodeOutput, DecodeStrategy};
use crate::error::IngestError;
use crate::models::DecodedPage;
use std::path::Path;

/// Standalone raster files become a single page for OCR.
#[derive(Debug, Default)]
pub struct ImageDecoder;

impl DecodeStrategy for ImageDecoder {
    fn name(&self) -> &'static str {
        "image"
    }

    fn decode(
        &self,
        _path: &Path,
        bytes: &[u8],
        _options: &DecodeOptions,
    ) -> Result<DecodeOutput, IngestError> {
        let image = image::load_from_memory(bytes)?;
        Ok(DecodeOutput::from_pages(vec![DecodedPage::image(0, image)]))
    }
}

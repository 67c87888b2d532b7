use super::{DecodeOptions, DecodeOutput, DecodeStrategy};
use crate::error::IngestError;
use crate::models::DecodedPage;
use std::path::Path;

/// Plain text, markdown, and source code: one page holding the whole file.
#[derive(Debug, Default)]
pub struct PlainTextDecoder;

impl DecodeStrategy for PlainTextDecoder {
    fn name(&self) -> &'static str {
        "text"
    }

    fn decode(
        &self,
        _path: &Path,
        bytes: &[u8],
        _options: &DecodeOptions,
    ) -> Result<DecodeOutput, IngestError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        let text = String::from_utf8_lossy(bytes).into_owned();
        Ok(DecodeOutput::from_pages(vec![DecodedPage::text(0, text)]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_byte_order_mark() -> Result<(), IngestError> {
        let output = PlainTextDecoder.decode(
            Path::new("a.md"),
            b"\xEF\xBB\xBF# Title",
            &DecodeOptions::default(),
        )?;
        assert_eq!(output.pages[0].as_text(), Some("# Title"));
        Ok(())
    }

    #[test]
    fn invalid_utf8_is_replaced_not_rejected() -> Result<(), IngestError> {
        let output = PlainTextDecoder.decode(
            Path::new("a.txt"),
            &[b'o', b'k', 0xFF],
            &DecodeOptions::default(),
        )?;
        let text = output.pages[0].as_text().unwrap_or_default();
        assert!(text.starts_with("ok"));
        Ok(())
    }
}

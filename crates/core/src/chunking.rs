use crate::analysis::is_sentence_end;
use crate::config::ChunkingConfig;
use crate::error::IngestError;
use crate::models::{BoundingHint, Chunk};
use sha2::{Digest, Sha256};
use tracing::warn;

/// Text of one page after decoding (and OCR, when the page was a raster).
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    pub page_index: Option<u32>,
    pub text: String,
    pub bounding_hint: Option<BoundingHint>,
    pub from_ocr: bool,
}

impl PageText {
    pub fn plain(page_index: u32, text: impl Into<String>) -> Self {
        Self {
            page_index: Some(page_index),
            text: text.into(),
            bounding_hint: None,
            from_ocr: false,
        }
    }
}

/// A slice of page text with its character offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub offset: usize,
    pub text: String,
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.chunk_size == 0 {
            return Err(IngestError::InvalidChunkConfig(
                "chunk_size must be > 0".to_string(),
            ));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(IngestError::InvalidChunkConfig(format!(
                "chunk_overlap {} must be smaller than chunk_size {}",
                self.chunk_overlap, self.chunk_size
            )));
        }
        Ok(())
    }
}

/// Collapses runs of spaces and tabs, trims line ends, and keeps at most one blank line.
pub fn normalize_page_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_newlines = 0usize;
    let mut pending_space = false;

    for c in text.chars() {
        match c {
            '\r' => {}
            '\n' => {
                pending_newlines += 1;
                pending_space = false;
            }
            c if c.is_whitespace() || c == '\u{a0}' || c == '\u{feff}' => {
                pending_space = true;
            }
            c => {
                if pending_newlines > 0 {
                    if !out.is_empty() {
                        out.push_str(if pending_newlines > 1 { "\n\n" } else { "\n" });
                    }
                    pending_newlines = 0;
                } else if pending_space && !out.is_empty() {
                    out.push(' ');
                }
                pending_space = false;
                out.push(c);
            }
        }
    }

    out
}

/// Splits text into overlapping windows of at most `chunk_size` characters.
///
/// A window ends at the last sentence terminator in its back half, then at
/// the last paragraph break, and only then at a hard character cut.
pub fn split_text(text: &str, config: ChunkingConfig) -> Vec<TextSpan> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut spans = Vec::new();
    let mut start = 0usize;

    while start < total {
        while start < total && chars[start].is_whitespace() {
            start += 1;
        }
        if start >= total {
            break;
        }

        let hard_end = (start + config.chunk_size).min(total);
        let end = if hard_end == total {
            total
        } else {
            find_boundary(&chars, start, hard_end, config.chunk_size)
        };

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim_end();
        if !trimmed.is_empty() {
            spans.push(TextSpan {
                offset: start,
                text: trimmed.to_string(),
            });
        }

        if end >= total {
            break;
        }

        let next = end.saturating_sub(config.chunk_overlap);
        start = if next > start { next } else { end };
    }

    spans
}

fn find_boundary(chars: &[char], start: usize, hard_end: usize, chunk_size: usize) -> usize {
    let min_cut = start + (chunk_size / 2).max(1);

    if let Some(position) = (min_cut..hard_end)
        .rev()
        .find(|&index| is_sentence_end(chars[index]))
    {
        return position + 1;
    }

    if let Some(position) = (min_cut.max(start + 1)..hard_end)
        .rev()
        .find(|&index| chars[index] == '\n' && chars[index - 1] == '\n')
    {
        return position + 1;
    }

    hard_end
}

/// Turns the pages of one file into chunks with stable IDs.
///
/// Chunk indices run across pages, so the same bytes always yield the
/// same `(content_hash, chunk_index)` pairs and therefore the same IDs.
pub fn build_chunks(
    source_name: &str,
    content_hash: &str,
    pages: &[PageText],
    config: ChunkingConfig,
) -> Result<Vec<Chunk>, IngestError> {
    config.validate()?;

    let mut chunks = Vec::new();
    let mut cursor = 0u64;

    for page in pages {
        let normalized = normalize_page_text(&page.text);
        if normalized.trim().is_empty() {
            if page.from_ocr {
                warn!(
                    file = source_name,
                    page_index = ?page.page_index,
                    "OCR produced no text; page skipped"
                );
            }
            continue;
        }

        for span in split_text(&normalized, config) {
            chunks.push(Chunk {
                chunk_id: make_chunk_id(content_hash, cursor),
                source_name: source_name.to_string(),
                content_hash: content_hash.to_string(),
                chunk_index: cursor,
                page_index: page.page_index,
                offset: span.offset,
                text: span.text,
                bounding_hint: page.bounding_hint,
            });
            cursor = cursor.saturating_add(1);
        }
    }

    Ok(chunks)
}

pub fn make_chunk_id(content_hash: &str, chunk_index: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content_hash.as_bytes());
    hasher.update(b":");
    hasher.update(chunk_index.to_string().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, chunk_overlap: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size,
            chunk_overlap,
        }
    }

    #[test]
    fn page_normalization_keeps_paragraph_breaks() {
        let normalized = normalize_page_text("  First   line \r\n\n\n\nSecond\tline\n");
        assert_eq!(normalized, "First line\n\nSecond line");
    }

    #[test]
    fn short_text_is_a_single_chunk() -> Result<(), IngestError> {
        let pages = [PageText::plain(0, "Hello, world.\n")];
        let chunks = build_chunks("greeting.txt", "abc", &pages, ChunkingConfig::default())?;

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].text, "Hello, world.");
        assert_eq!(chunks[0].offset, 0);
        assert_eq!(chunks[0].chunk_id, make_chunk_id("abc", 0));
        Ok(())
    }

    #[test]
    fn oversized_text_is_split_with_overlap_covering_the_source() {
        let text = "abcdefghij".repeat(10);
        let spans = split_text(&text, config(30, 5));

        assert!(spans.len() > 1);
        assert!(spans.iter().all(|span| span.text.chars().count() <= 30));
        for pair in spans.windows(2) {
            let previous_end = pair[0].offset + pair[0].text.chars().count();
            assert!(pair[1].offset < previous_end, "spans must overlap");
        }
        let last = spans.last().map(|span| span.offset + span.text.chars().count());
        assert_eq!(last, Some(text.chars().count()));
    }

    #[test]
    fn boundaries_prefer_sentence_ends() {
        let text = "第一句话在这里。Second sentence goes here. Third one keeps going on";
        let spans = split_text(text, config(40, 4));
        assert!(spans[0].text.ends_with('.') || spans[0].text.ends_with('。'));
    }

    #[test]
    fn boundaries_fall_back_to_paragraph_breaks() {
        let text = "alpha beta gamma delta\n\nepsilon zeta eta theta iota kappa";
        let spans = split_text(text, config(30, 0));
        assert_eq!(spans[0].text, "alpha beta gamma delta");
        assert!(spans[1].text.starts_with("epsilon"));
    }

    #[test]
    fn chunk_indices_continue_across_pages_and_skip_empty_pages() -> Result<(), IngestError> {
        let pages = [
            PageText::plain(0, "Page one text."),
            PageText {
                page_index: Some(1),
                text: "   ".to_string(),
                bounding_hint: None,
                from_ocr: true,
            },
            PageText::plain(2, "Page three text."),
        ];
        let chunks = build_chunks("doc.pdf", "hash", &pages, ChunkingConfig::default())?;

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].chunk_index, 1);
        assert_eq!(chunks[1].page_index, Some(2));
        assert!(chunks.iter().all(|chunk| !chunk.text.is_empty()));
        Ok(())
    }

    #[test]
    fn chunk_ids_are_stable_for_identical_bytes() {
        assert_eq!(make_chunk_id("h", 3), make_chunk_id("h", 3));
        assert_ne!(make_chunk_id("h", 3), make_chunk_id("h", 4));
    }

    #[test]
    fn invalid_overlap_is_rejected() {
        let pages = [PageText::plain(0, "text")];
        let result = build_chunks("a.txt", "h", &pages, config(10, 10));
        assert!(matches!(result, Err(IngestError::InvalidChunkConfig(_))));
    }
}

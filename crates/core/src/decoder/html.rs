use super::{normalized_extension, DecodeOptions, DecodeOutput, DecodeStrategy};
use crate::error::IngestError;
use crate::models::DecodedPage;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// A saved web-crawl record, stored with the `.crawl` extension.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrawledPage {
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
}

/// HTML pages and crawl records decode to `"<title>\n\n<body>"`.
#[derive(Debug, Default)]
pub struct HtmlDecoder;

impl DecodeStrategy for HtmlDecoder {
    fn name(&self) -> &'static str {
        "html"
    }

    fn decode(
        &self,
        path: &Path,
        bytes: &[u8],
        _options: &DecodeOptions,
    ) -> Result<DecodeOutput, IngestError> {
        let text = if normalized_extension(path) == "crawl" {
            let record: CrawledPage = serde_json::from_slice(bytes)?;
            let title = if record.title.trim().is_empty() {
                record.url.trim()
            } else {
                record.title.trim()
            };
            with_title(title, record.content.trim())
        } else {
            let (title, body) = html_to_text(&String::from_utf8_lossy(bytes))?;
            with_title(&title, &body)
        };
        Ok(DecodeOutput::from_pages(vec![DecodedPage::text(0, text)]))
    }
}

fn with_title(title: &str, body: &str) -> String {
    if title.is_empty() {
        body.to_string()
    } else {
        format!("{title}\n\n{body}")
    }
}

struct HtmlPatterns {
    title: Regex,
    invisible: Regex,
    block_break: Regex,
    tag: Regex,
    blank_lines: Regex,
}

impl HtmlPatterns {
    fn compile() -> Result<Self, regex::Error> {
        Ok(Self {
            title: Regex::new(r"(?is)<title[^>]*>(.*?)</title>")?,
            invisible: Regex::new(
                r"(?is)<(script|style|noscript|head)\b[^>]*>.*?</(script|style|noscript|head)>|<!--.*?-->",
            )?,
            block_break: Regex::new(
                r"(?i)<br\s*/?>|</(p|div|li|tr|h[1-6]|section|article|blockquote|pre|table)>",
            )?,
            tag: Regex::new(r"(?s)<[^>]*>")?,
            blank_lines: Regex::new(r"\n{3,}")?,
        })
    }
}

/// Returns the page title and its visible body text.
pub(crate) fn html_to_text(html: &str) -> Result<(String, String), IngestError> {
    let patterns = HtmlPatterns::compile()?;
    let title = patterns
        .title
        .captures(html)
        .and_then(|captures| captures.get(1))
        .map(|title| collapse_inline(&decode_entities(title.as_str())))
        .unwrap_or_default();

    let visible = patterns.invisible.replace_all(html, " ");
    let with_breaks = patterns.block_break.replace_all(&visible, "\n");
    let stripped = patterns.tag.replace_all(&with_breaks, " ");
    let decoded = decode_entities(&stripped);

    let lines: Vec<String> = decoded.lines().map(collapse_inline).collect();
    let body = patterns
        .blank_lines
        .replace_all(lines.join("\n").trim(), "\n\n")
        .into_owned();
    Ok((title, body))
}

fn collapse_inline(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_keeps_title_and_visible_text() -> Result<(), IngestError> {
        let html = r#"<html><head><title>Pump Manual</title><style>p{color:red}</style></head>
            <body><h1>Install</h1><p>Open the &amp; valve.</p><script>alert(1)</script><p>Close it.</p></body></html>"#;
        let output = HtmlDecoder.decode(Path::new("a.html"), html.as_bytes(), &DecodeOptions::default())?;
        let text = output.pages[0].as_text().unwrap_or_default();

        assert!(text.starts_with("Pump Manual\n\n"));
        assert!(text.contains("Open the & valve."));
        assert!(text.contains("Close it."));
        assert!(!text.contains("alert"));
        assert!(!text.contains("color"));
        Ok(())
    }

    #[test]
    fn crawl_record_uses_title_prefix() -> Result<(), IngestError> {
        let record = r#"{"url":"https://example.com/a","title":"Example","content":"Body text."}"#;
        let output = HtmlDecoder.decode(Path::new("page.crawl"), record.as_bytes(), &DecodeOptions::default())?;
        assert_eq!(output.pages[0].as_text(), Some("Example\n\nBody text."));
        Ok(())
    }

    #[test]
    fn crawl_record_without_title_falls_back_to_url() -> Result<(), IngestError> {
        let record = r#"{"url":"https://example.com/a","content":"Body."}"#;
        let output = HtmlDecoder.decode(Path::new("page.crawl"), record.as_bytes(), &DecodeOptions::default())?;
        assert_eq!(output.pages[0].as_text(), Some("https://example.com/a\n\nBody."));
        Ok(())
    }

    #[test]
    fn malformed_crawl_record_is_an_error() {
        let result = HtmlDecoder.decode(Path::new("page.crawl"), b"{not json", &DecodeOptions::default());
        assert!(matches!(result, Err(IngestError::Serialization(_))));
    }
}

//! OOXML text extraction: `docx` and `xlsx` decode to one page, `pptx` to one page per slide.

use super::{normalized_extension, DecodeOptions, DecodeOutput, DecodeStrategy};
use crate::error::IngestError;
use crate::models::DecodedPage;
use quick_xml::events::Event;
use quick_xml::Reader;
use std::io::{Cursor, Read};
use std::path::Path;

/// Upper bound on one decompressed archive entry.
const MAX_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
const MAX_SHEETS: usize = 100;
const MAX_CELLS_PER_SHEET: usize = 100_000;

type Archive<'a> = zip::ZipArchive<Cursor<&'a [u8]>>;

#[derive(Debug, Default)]
pub struct OfficeDecoder;

impl DecodeStrategy for OfficeDecoder {
    fn name(&self) -> &'static str {
        "office"
    }

    fn decode(
        &self,
        path: &Path,
        bytes: &[u8],
        _options: &DecodeOptions,
    ) -> Result<DecodeOutput, IngestError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(ooxml_error)?;
        let pages = match normalized_extension(path).as_str() {
            "docx" => vec![DecodedPage::text(0, docx_text(&mut archive)?)],
            "pptx" => pptx_slides(&mut archive)?
                .into_iter()
                .enumerate()
                .map(|(index, text)| DecodedPage::text(index as u32, text))
                .collect(),
            "xlsx" => vec![DecodedPage::text(0, xlsx_text(&mut archive)?)],
            other => {
                return Err(IngestError::UnsupportedType {
                    path: path.display().to_string(),
                    extension: other.to_string(),
                })
            }
        };
        Ok(DecodeOutput::from_pages(pages))
    }
}

fn ooxml_error(error: impl std::fmt::Display) -> IngestError {
    IngestError::Ooxml(error.to_string())
}

fn read_entry(archive: &mut Archive<'_>, name: &str) -> Result<Vec<u8>, IngestError> {
    let entry = archive.by_name(name).map_err(|error| ooxml_error(format!("{name}: {error}")))?;
    let mut out = Vec::new();
    entry
        .take(MAX_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(ooxml_error)?;
    if out.len() as u64 >= MAX_ENTRY_BYTES {
        return Err(ooxml_error(format!("{name} exceeds {MAX_ENTRY_BYTES} bytes")));
    }
    Ok(out)
}

/// Entry names matching `prefix<N>.xml`, ordered by `N`.
fn numbered_entries(archive: &Archive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<(u32, String)> = archive
        .file_names()
        .filter_map(|name| {
            let number = name.strip_prefix(prefix)?.strip_suffix(".xml")?.parse().ok()?;
            Some((number, name.to_string()))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, name)| name).collect()
}

/// Concatenates `<t>` runs, ending each paragraph with a newline.
fn paragraph_text(xml: &[u8]) -> Result<String, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut in_run_text = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(element) if element.local_name().as_ref() == b"t" => in_run_text = true,
            Event::Text(text) if in_run_text => {
                out.push_str(&text.unescape().map_err(ooxml_error)?);
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"t" => in_run_text = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Event::Empty(element) => match element.local_name().as_ref() {
                b"br" => out.push('\n'),
                b"tab" => out.push('\t'),
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn docx_text(archive: &mut Archive<'_>) -> Result<String, IngestError> {
    let xml = read_entry(archive, "word/document.xml")?;
    paragraph_text(&xml)
}

fn pptx_slides(archive: &mut Archive<'_>) -> Result<Vec<String>, IngestError> {
    let names = numbered_entries(archive, "ppt/slides/slide");
    if names.is_empty() {
        return Err(ooxml_error("presentation has no slides"));
    }
    names
        .iter()
        .map(|name| paragraph_text(&read_entry(archive, name)?))
        .collect()
}

fn xlsx_text(archive: &mut Archive<'_>) -> Result<String, IngestError> {
    let shared = if archive.by_name("xl/sharedStrings.xml").is_ok() {
        shared_strings(&read_entry(archive, "xl/sharedStrings.xml")?)?
    } else {
        Vec::new()
    };

    let mut sheets = Vec::new();
    for name in numbered_entries(archive, "xl/worksheets/sheet").into_iter().take(MAX_SHEETS) {
        let text = sheet_text(&read_entry(archive, &name)?, &shared)?;
        if !text.is_empty() {
            sheets.push(text);
        }
    }
    Ok(sheets.join("\n\n"))
}

fn shared_strings(xml: &[u8]) -> Result<Vec<String>, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
    let mut current: Option<String> = None;
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"si" => current = Some(String::new()),
                b"t" => in_text = true,
                _ => {}
            },
            Event::Text(text) if in_text => {
                if let Some(item) = current.as_mut() {
                    item.push_str(&text.unescape().map_err(ooxml_error)?);
                }
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"si" => strings.extend(current.take()),
                b"t" => in_text = false,
                _ => {}
            },
            Event::Empty(element) if element.local_name().as_ref() == b"si" => {
                strings.push(String::new());
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Rows become lines and cells are tab-separated.
fn sheet_text(xml: &[u8], shared: &[String]) -> Result<String, IngestError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut lines: Vec<String> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut cell_type: Vec<u8> = Vec::new();
    let mut cell_value = String::new();
    let mut capture = false;
    let mut cells = 0usize;

    loop {
        if cells >= MAX_CELLS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf).map_err(ooxml_error)? {
            Event::Start(element) => match element.local_name().as_ref() {
                b"c" => {
                    cell_type = element
                        .attributes()
                        .flatten()
                        .find(|attribute| attribute.key.as_ref() == b"t")
                        .map(|attribute| attribute.value.into_owned())
                        .unwrap_or_default();
                    cell_value.clear();
                }
                b"v" | b"t" => capture = true,
                _ => {}
            },
            Event::Text(text) if capture => {
                cell_value.push_str(&text.unescape().map_err(ooxml_error)?);
            }
            Event::End(element) => match element.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    let value = cell_value.trim();
                    let resolved = if cell_type == b"s" {
                        value
                            .parse::<usize>()
                            .ok()
                            .and_then(|index| shared.get(index))
                            .cloned()
                            .unwrap_or_default()
                    } else {
                        value.to_string()
                    };
                    if !resolved.is_empty() {
                        row.push(resolved);
                        cells += 1;
                    }
                }
                b"row" => {
                    if !row.is_empty() {
                        lines.push(row.join("\t"));
                        row.clear();
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if !row.is_empty() {
        lines.push(row.join("\t"));
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    pub fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, body) in entries {
            writer
                .start_file(*name, SimpleFileOptions::default())
                .expect("start zip entry");
            writer.write_all(body.as_bytes()).expect("write zip entry");
        }
        writer.finish().expect("finish zip").into_inner()
    }

    pub fn docx(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|text| format!("<w:p><w:r><w:t>{text}</w:t></w:r></w:p>"))
            .collect();
        let xml = format!(
            r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        zip_with(&[("word/document.xml", &xml)])
    }
}

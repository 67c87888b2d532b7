use super::{non_whitespace_chars, DecodeOptions, DecodeOutput, DecodeStrategy, PageFailure};
use crate::error::IngestError;
use crate::models::DecodedPage;
use image::{DynamicImage, GrayImage, ImageFormat, RgbImage};
use lopdf::{Dictionary, Document, Object, ObjectId, Stream};
use std::path::Path;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct PdfPage {
    /// 1-based page number as stored in the document.
    pub number: u32,
    pub text: Result<String, String>,
    /// Largest embedded raster, only probed for low-text pages.
    pub raster: Option<DynamicImage>,
}

pub trait PdfExtractor: Send + Sync {
    /// Extracts every page; rasters are looked up for pages with fewer than
    /// `raster_below` non-whitespace chars.
    fn extract_pages(&self, bytes: &[u8], raster_below: Option<usize>) -> Result<Vec<PdfPage>, IngestError>;
}

#[derive(Debug, Default)]
pub struct LopdfExtractor;

impl PdfExtractor for LopdfExtractor {
    fn extract_pages(&self, bytes: &[u8], raster_below: Option<usize>) -> Result<Vec<PdfPage>, IngestError> {
        let document = Document::load_mem(bytes).map_err(|error| IngestError::PdfParse(error.to_string()))?;

        let mut pages = Vec::new();
        for (page_no, page_id) in document.get_pages() {
            let text = document
                .extract_text(&[page_no])
                .map_err(|error| error.to_string());
            let raster = match (&text, raster_below) {
                (Ok(text), Some(threshold)) if non_whitespace_chars(text) < threshold => {
                    largest_page_raster(&document, page_id)
                }
                _ => None,
            };
            pages.push(PdfPage {
                number: page_no,
                text,
                raster,
            });
        }
        Ok(pages)
    }
}

pub struct PdfDecoder {
    extractor: Box<dyn PdfExtractor>,
}

impl PdfDecoder {
    pub fn new(extractor: Box<dyn PdfExtractor>) -> Self {
        Self { extractor }
    }
}

impl Default for PdfDecoder {
    fn default() -> Self {
        Self::new(Box::new(LopdfExtractor))
    }
}

impl DecodeStrategy for PdfDecoder {
    fn name(&self) -> &'static str {
        "pdf"
    }

    fn decode(
        &self,
        path: &Path,
        bytes: &[u8],
        options: &DecodeOptions,
    ) -> Result<DecodeOutput, IngestError> {
        let raster_below = options.use_ocr.then_some(options.min_text_chars);
        let pages = self.extractor.extract_pages(bytes, raster_below)?;

        let mut output = DecodeOutput::default();
        for page in pages {
            let page_index = page.number.saturating_sub(1);
            match page.text {
                Err(details) => {
                    warn!(path = %path.display(), page_index, %details, "pdf page failed to decode");
                    output.page_failures.push(PageFailure { page_index, details });
                    output.pages.push(DecodedPage::text(page_index, String::new()));
                }
                Ok(text) => {
                    let sparse = non_whitespace_chars(&text) < options.min_text_chars;
                    match page.raster {
                        Some(raster) if options.use_ocr && sparse => {
                            debug!(path = %path.display(), page_index, "pdf page queued for OCR");
                            output.pages.push(DecodedPage::image(page_index, raster));
                        }
                        _ => {
                            if options.use_ocr && sparse {
                                warn!(
                                    path = %path.display(),
                                    page_index,
                                    "pdf page has little text and no embedded raster; keeping extracted text"
                                );
                            }
                            output.pages.push(DecodedPage::text(page_index, text));
                        }
                    }
                }
            }
        }
        Ok(output)
    }
}

fn largest_page_raster(document: &Document, page_id: ObjectId) -> Option<DynamicImage> {
    let (inline, referenced) = document.get_page_resources(page_id);
    let mut resources: Vec<&Dictionary> = inline.into_iter().collect();
    resources.extend(
        referenced
            .into_iter()
            .filter_map(|id| document.get_dictionary(id).ok()),
    );

    let mut best: Option<DynamicImage> = None;
    for resource in resources {
        let Some(xobjects) = resolve_dictionary(document, resource.get(b"XObject").ok()) else {
            continue;
        };
        for (_, entry) in xobjects.iter() {
            let Some(stream) = resolve_stream(document, entry) else {
                continue;
            };
            let is_image = stream
                .dict
                .get(b"Subtype")
                .and_then(Object::as_name)
                .map(|name| name == b"Image")
                .unwrap_or(false);
            if !is_image {
                continue;
            }
            if let Some(image) = decode_image_stream(stream) {
                let area = u64::from(image.width()) * u64::from(image.height());
                let best_area = best
                    .as_ref()
                    .map(|current| u64::from(current.width()) * u64::from(current.height()))
                    .unwrap_or(0);
                if area > best_area {
                    best = Some(image);
                }
            }
        }
    }
    best
}

fn resolve_dictionary<'a>(document: &'a Document, object: Option<&'a Object>) -> Option<&'a Dictionary> {
    match object? {
        Object::Dictionary(dictionary) => Some(dictionary),
        Object::Reference(id) => document.get_dictionary(*id).ok(),
        _ => None,
    }
}

fn resolve_stream<'a>(document: &'a Document, object: &'a Object) -> Option<&'a Stream> {
    match object {
        Object::Stream(stream) => Some(stream),
        Object::Reference(id) => document.get_object(*id).and_then(Object::as_stream).ok(),
        _ => None,
    }
}

fn stream_filters(stream: &Stream) -> Vec<Vec<u8>> {
    match stream.dict.get(b"Filter") {
        Ok(Object::Name(name)) => vec![name.clone()],
        Ok(Object::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_name().ok().map(<[u8]>::to_vec))
            .collect(),
        _ => Vec::new(),
    }
}

fn dict_u32(dictionary: &Dictionary, key: &[u8]) -> Option<u32> {
    dictionary
        .get(key)
        .and_then(Object::as_i64)
        .ok()
        .and_then(|value| u32::try_from(value).ok())
}

/// Decodes JPEG streams and raw or Flate-compressed gray/RGB/CMYK samples.
fn decode_image_stream(stream: &Stream) -> Option<DynamicImage> {
    let filters = stream_filters(stream);
    if filters.iter().any(|filter| filter == b"DCTDecode") {
        return image::load_from_memory_with_format(&stream.content, ImageFormat::Jpeg).ok();
    }
    if filters
        .iter()
        .any(|filter| filter != b"FlateDecode")
    {
        return None;
    }

    let width = dict_u32(&stream.dict, b"Width")?;
    let height = dict_u32(&stream.dict, b"Height")?;
    let bits = dict_u32(&stream.dict, b"BitsPerComponent").unwrap_or(8);
    let samples = if filters.is_empty() {
        stream.content.clone()
    } else {
        stream.decompressed_content().ok()?
    };
    samples_to_image(&samples, width, height, bits)
}

fn samples_to_image(samples: &[u8], width: u32, height: u32, bits: u32) -> Option<DynamicImage> {
    let pixels = (width as usize).checked_mul(height as usize)?;
    if pixels == 0 {
        return None;
    }

    match bits {
        1 => {
            let row_bytes = (width as usize).div_ceil(8);
            if samples.len() < row_bytes * height as usize {
                return None;
            }
            let mut gray = Vec::with_capacity(pixels);
            for row in samples.chunks(row_bytes).take(height as usize) {
                for x in 0..width as usize {
                    let bit = (row[x / 8] >> (7 - (x % 8))) & 1;
                    gray.push(if bit == 1 { 255 } else { 0 });
                }
            }
            GrayImage::from_raw(width, height, gray).map(DynamicImage::ImageLuma8)
        }
        8 => match samples.len() / pixels {
            1 => GrayImage::from_raw(width, height, samples[..pixels].to_vec()).map(DynamicImage::ImageLuma8),
            3 => RgbImage::from_raw(width, height, samples[..pixels * 3].to_vec()).map(DynamicImage::ImageRgb8),
            4 => {
                let rgb = samples[..pixels * 4]
                    .chunks_exact(4)
                    .flat_map(|cmyk| {
                        let k = 255 - u16::from(cmyk[3]);
                        [0, 1, 2].map(|channel| ((255 - u16::from(cmyk[channel])) * k / 255) as u8)
                    })
                    .collect();
                RgbImage::from_raw(width, height, rgb).map(DynamicImage::ImageRgb8)
            }
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use lopdf::content::{Content, Operation};
    use lopdf::{dictionary, Document, Object, Stream};

    /// Builds a PDF whose pages carry the given text; `raster` attaches a
    /// gray 8x8 image XObject to every page.
    pub fn pdf_with_pages(texts: &[&str], raster: bool) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let image_id = doc.add_object(Stream::new(
            dictionary! {
                "Type" => "XObject",
                "Subtype" => "Image",
                "Width" => 8,
                "Height" => 8,
                "ColorSpace" => "DeviceGray",
                "BitsPerComponent" => 8,
            },
            vec![200u8; 64],
        ));

        let mut kids: Vec<Object> = Vec::new();
        for text in texts {
            let mut operations = vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 12.into()]),
                Operation::new("Td", vec![72.into(), 720.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ];
            if raster {
                operations.push(Operation::new("Do", vec!["Im1".into()]));
            }
            let content = Content { operations };
            let content_id = doc.add_object(Stream::new(
                dictionary! {},
                content.encode().unwrap_or_default(),
            ));
            let mut resources = dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            };
            if raster {
                resources.set("XObject", dictionary! { "Im1" => image_id });
            }
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => pages_id,
                "Contents" => content_id,
                "Resources" => resources,
                "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            });
            kids.push(page_id.into());
        }

        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).unwrap_or_default();
        bytes
    }
}

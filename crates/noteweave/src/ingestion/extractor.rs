//! Text extraction from uploaded bytes

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::providers::vision::ImageDescriber;
use crate::providers::InlineImage;
use crate::types::FileKind;

/// Converts raw bytes plus a MIME type into plain text
#[derive(Clone)]
pub struct Extractor {
    timeout: Duration,
    describer: Option<Arc<dyn ImageDescriber>>,
}

impl Extractor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            describer: None,
        }
    }

    /// Enable image uploads by describing them with a vision model
    pub fn with_describer(mut self, describer: Arc<dyn ImageDescriber>) -> Self {
        self.describer = Some(describer);
        self
    }

    /// Extract text; fails if the format is unsupported or yields no text
    pub async fn extract(&self, filename: &str, mime_type: &str, data: Vec<u8>) -> Result<String> {
        let kind = FileKind::from_mime(mime_type)
            .ok_or_else(|| Error::extraction(filename, format!("Unsupported MIME type {}", mime_type)))?;

        let text = match kind {
            FileKind::Text | FileKind::Markdown => decode_text(filename, &data)?,
            FileKind::Pdf => self.blocking(filename, move |name| extract_pdf(&name, &data)).await?,
            FileKind::Docx => self.blocking(filename, move |name| extract_docx(&name, &data)).await?,
            FileKind::Image => {
                let describer = self.describer.as_ref().ok_or_else(|| {
                    Error::extraction(filename, "No vision model available to describe images")
                })?;
                let image = InlineImage::from_bytes(mime_type, &data);
                match timeout(self.timeout, describer.describe(&image)).await {
                    Ok(result) => result
                        .map_err(|e| Error::extraction(filename, format!("Image description failed: {}", e)))?,
                    Err(_) => return Err(self.timeout_error(filename)),
                }
            }
        };

        if text.trim().is_empty() {
            return Err(Error::extraction(filename, "No text content could be extracted"));
        }

        tracing::debug!("Extracted {} chars from {}", text.chars().count(), filename);
        Ok(text)
    }

    /// Run a CPU-bound parser off the async runtime, bounded by the extraction timeout
    async fn blocking<F>(&self, filename: &str, parse: F) -> Result<String>
    where
        F: FnOnce(String) -> Result<String> + Send + 'static,
    {
        let name = filename.to_string();
        let task = tokio::task::spawn_blocking(move || parse(name));
        match timeout(self.timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::extraction(filename, format!("Parser crashed: {}", e))),
            Err(_) => Err(self.timeout_error(filename)),
        }
    }

    fn timeout_error(&self, filename: &str) -> Error {
        tracing::error!("Extraction of '{}' timed out after {:?}", filename, self.timeout);
        Error::extraction(filename, format!("Extraction timed out after {}s", self.timeout.as_secs()))
    }
}

fn decode_text(filename: &str, data: &[u8]) -> Result<String> {
    let data = data.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(data);
    match std::str::from_utf8(data) {
        Ok(text) => Ok(text.to_string()),
        Err(e) => {
            tracing::warn!("{} is not valid UTF-8 ({}), decoding lossily", filename, e);
            Ok(String::from_utf8_lossy(data).into_owned())
        }
    }
}

fn extract_pdf(filename: &str, data: &[u8]) -> Result<String> {
    let text = match pdf_extract::extract_text_from_mem(data) {
        Ok(text) if !text.trim().is_empty() => text,
        Ok(_) => {
            tracing::warn!("pdf-extract found no text in {}, trying fallback", filename);
            extract_pdf_fallback(filename, data)?
        }
        Err(e) => {
            tracing::warn!("pdf-extract failed on {}: {}, trying fallback", filename, e);
            extract_pdf_fallback(filename, data)?
        }
    };
    Ok(clean_pdf_text(&text))
}

/// Page-by-page extraction with lopdf
fn extract_pdf_fallback(filename: &str, data: &[u8]) -> Result<String> {
    let doc = lopdf::Document::load_mem(data)
        .map_err(|e| Error::extraction(filename, format!("Failed to load PDF: {}", e)))?;

    let pages: Vec<u32> = doc.get_pages().keys().copied().collect();
    let mut text = String::new();
    for page in pages {
        match doc.extract_text(&[page]) {
            Ok(page_text) if !page_text.trim().is_empty() => {
                if !text.is_empty() {
                    text.push('\n');
                }
                text.push_str(&page_text);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Could not extract page {} of {}: {}", page, filename, e),
        }
    }

    if text.trim().is_empty() {
        return Err(Error::extraction(
            filename,
            "PDF appears to be image-based or has no extractable text",
        ));
    }
    Ok(text)
}

/// Drop NUL bytes, common ligatures and blank lines left by PDF text layers
fn clean_pdf_text(text: &str) -> String {
    text.replace('\0', "")
        .replace('\u{FB01}', "fi")
        .replace('\u{FB02}', "fl")
        .replace('\u{FB00}', "ff")
        .replace('\u{00A0}', " ")
        .lines()
        .map(str::trim_end)
        .filter(|l| !l.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

fn extract_docx(filename: &str, data: &[u8]) -> Result<String> {
    let docx = docx_rs::read_docx(data).map_err(|e| Error::extraction(filename, e.to_string()))?;

    let mut paragraphs = Vec::new();
    for child in docx.document.children {
        match child {
            docx_rs::DocumentChild::Paragraph(p) => paragraphs.push(paragraph_text(&p)),
            docx_rs::DocumentChild::Table(table) => {
                for row in table.rows {
                    let docx_rs::TableChild::TableRow(row) = row;
                    let cells: Vec<String> = row
                        .cells
                        .into_iter()
                        .map(|cell| {
                            let docx_rs::TableRowChild::TableCell(cell) = cell;
                            cell.children
                                .iter()
                                .filter_map(|c| match c {
                                    docx_rs::TableCellContent::Paragraph(p) => Some(paragraph_text(p)),
                                    _ => None,
                                })
                                .collect::<Vec<_>>()
                                .join(" ")
                        })
                        .collect();
                    paragraphs.push(cells.join(" | "));
                }
            }
            _ => {}
        }
    }

    Ok(paragraphs
        .into_iter()
        .filter(|p| !p.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n"))
}

fn paragraph_text(paragraph: &docx_rs::Paragraph) -> String {
    let mut text = String::new();
    for child in &paragraph.children {
        if let docx_rs::ParagraphChild::Run(run) = child {
            for run_child in &run.children {
                match run_child {
                    docx_rs::RunChild::Text(t) => text.push_str(&t.text),
                    docx_rs::RunChild::Tab(_) => text.push('\t'),
                    docx_rs::RunChild::Break(_) => text.push('\n'),
                    _ => {}
                }
            }
        }
    }
    text
}

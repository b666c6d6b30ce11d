//! PDF text extraction.
//!
//! Pages are extracted individually and concatenated with a `[Page N]`
//! marker in front of each one, so chunks keep a rough pointer back to
//! where their text came from.

use crate::error::{Error, Result};

pub const MIME_PDF: &str = "application/pdf";

/// Extract the text of every page, each formatted as `[Page N]\n{text}\n\n`.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String> {
    let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
        .map_err(|e| Error::Extraction(format!("Error extracting text from PDF: {}", e)))?;
    if pages.iter().all(|p| p.trim().is_empty()) {
        return Err(Error::Extraction("PDF contains no extractable text".into()));
    }
    Ok(join_pages(&pages))
}

fn join_pages(pages: &[String]) -> String {
    let mut text = String::new();
    for (i, page) in pages.iter().enumerate() {
        text.push_str(&format!("[Page {}]\n{}\n\n", i + 1, page));
    }
    text
}

/// Whether an upload looks like a PDF, by declared content type or magic bytes.
pub fn is_pdf(content_type: Option<&str>, bytes: &[u8]) -> bool {
    match content_type {
        Some(ct) if ct.eq_ignore_ascii_case(MIME_PDF) => true,
        Some("application/octet-stream") | None => bytes.starts_with(b"%PDF-"),
        Some(_) => false,
    }
}

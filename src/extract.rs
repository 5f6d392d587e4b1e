//! Plain-text extraction from harvested PDF files.
//!
//! Gazette issues and court decisions arrive as PDFs; this module turns
//! their bytes into UTF-8 text for the analysis and embedding stages.

/// Extraction error. Extraction never panics; a failed document is
/// recorded and the batch moves on.
#[derive(Debug)]
pub enum ExtractError {
    Pdf(String),
    Empty,
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtractError::Pdf(e) => write!(f, "PDF extraction failed: {}", e),
            ExtractError::Empty => write!(f, "PDF contained no extractable text"),
        }
    }
}

impl std::error::Error for ExtractError {}

/// Extract text from PDF bytes. Whitespace-only output counts as a
/// failure: an image-only scan must not mark the extract stage done.
pub fn extract_pdf_text(bytes: &[u8]) -> Result<String, ExtractError> {
    let text =
        pdf_extract::extract_text_from_mem(bytes).map_err(|e| ExtractError::Pdf(e.to_string()))?;
    let cleaned = collapse_whitespace(&text);
    if cleaned.is_empty() {
        return Err(ExtractError::Empty);
    }
    Ok(cleaned)
}

/// Collapse runs of whitespace while preserving paragraph breaks, which
/// downstream summarization relies on.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            continue;
        }
        if !out.is_empty() {
            out.push_str(if blank_run > 0 { "\n\n" } else { "\n" });
        }
        blank_run = 0;
        let mut first = true;
        for word in line.split_whitespace() {
            if !first {
                out.push(' ');
            }
            out.push_str(word);
            first = false;
        }
    }
    out
}

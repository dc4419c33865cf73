//! Extraction for documents that are already text.

use async_trait::async_trait;

use super::{ProviderError, ProviderResult, TextExtractor};

/// Extracts UTF-8 text and markdown documents
#[derive(Debug, Clone, Default)]
pub struct PlainTextExtractor;

impl PlainTextExtractor {
    pub fn new() -> Self {
        Self
    }
}

/// Strip a BOM, normalise line endings and collapse runs of blank lines
fn normalise(text: &str) -> String {
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let text = text.replace("\r\n", "\n").replace('\r', "\n");

    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim_end();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }

    out.trim().to_string()
}

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    fn name(&self) -> &str {
        "plain_text"
    }

    async fn extract_text(&self, document_name: &str, content: &[u8]) -> ProviderResult<String> {
        let text = std::str::from_utf8(content).map_err(|e| {
            ProviderError::invalid_input(format!(
                "'{}' is not UTF-8 text (invalid byte at {})",
                document_name,
                e.valid_up_to()
            ))
        })?;

        let text = normalise(text);
        if text.is_empty() {
            return Err(ProviderError::invalid_input(format!(
                "no text could be extracted from '{}'",
                document_name
            )));
        }

        Ok(text)
    }
}

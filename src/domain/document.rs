//! Uploaded source documents.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::resource::{RecordError, ResourceRecord, ResourceStatus};

/// Name of the payload part holding extracted text
pub const TEXT_PART: &str = "text";

/// Extraction status of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionStatus {
    Pending,
    Succeeded,
    Failed,
}

impl From<ResourceStatus> for ExtractionStatus {
    fn from(status: ResourceStatus) -> Self {
        match status {
            ResourceStatus::Pending | ResourceStatus::Running => ExtractionStatus::Pending,
            ResourceStatus::Succeeded => ExtractionStatus::Succeeded,
            ResourceStatus::Failed => ExtractionStatus::Failed,
        }
    }
}

/// A document as seen by callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub name: String,
    pub size_bytes: u64,
    pub content_type: String,
    pub extraction_status: ExtractionStatus,

    /// Present only when extraction succeeded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RecordError>,

    pub created_at: DateTime<Utc>,
}

impl Document {
    pub fn from_record(record: &ResourceRecord, extracted_text: Option<String>) -> Self {
        let extraction_status = ExtractionStatus::from(record.status);
        Self {
            id: record.id.clone(),
            name: record.meta_str("name").unwrap_or_default().to_string(),
            size_bytes: record.meta_u64("size_bytes").unwrap_or(0),
            content_type: record
                .meta_str("content_type")
                .unwrap_or("application/octet-stream")
                .to_string(),
            extracted_text: extracted_text
                .filter(|_| extraction_status == ExtractionStatus::Succeeded),
            extraction_status,
            error: record.last_error.clone(),
            created_at: record.created_at,
        }
    }
}

/// Guess a MIME type from a document name
pub fn guess_content_type(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "txt" | "text" => "text/plain",
        "md" | "markdown" => "text/markdown",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        _ => "application/octet-stream",
    }
}

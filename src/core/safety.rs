//! Safety limits enforced before any stage runs.
//!
//! Guards the pipeline against:
//! - Empty or oversized uploads
//! - Uploads whose names match denylist patterns (to avoid processing secrets)
//! - Podcasts referencing too many or duplicate documents
//! - Adapter calls that never return (per-call timeout)

use std::collections::HashSet;
use std::time::Duration;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::PipelineError;

/// Safety limits for pipeline execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Maximum uploaded document size in bytes (default: 10MB)
    #[serde(default = "default_max_document_bytes")]
    pub max_document_bytes: u64,

    /// Maximum number of documents one podcast may reference (default: 20)
    #[serde(default = "default_max_documents_per_podcast")]
    pub max_documents_per_podcast: usize,

    /// Per adapter call timeout in seconds (default: 300 = 5 min)
    #[serde(default = "default_call_timeout")]
    pub call_timeout_seconds: u64,

    /// Glob patterns to reject (documents with matching names won't be accepted)
    #[serde(default = "default_denylist")]
    pub denylist_patterns: Vec<String>,
}

fn default_max_document_bytes() -> u64 {
    10 * 1024 * 1024
} // 10MB
fn default_max_documents_per_podcast() -> usize {
    20
}
fn default_call_timeout() -> u64 {
    300
} // 5 min

fn default_denylist() -> Vec<String> {
    vec![
        "**/.env*".to_string(),
        "**/secrets*".to_string(),
        "**/*credential*".to_string(),
        "**/*.pem".to_string(),
        "**/*.key".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_document_bytes: default_max_document_bytes(),
            max_documents_per_podcast: default_max_documents_per_podcast(),
            call_timeout_seconds: default_call_timeout(),
            denylist_patterns: default_denylist(),
        }
    }
}

impl SafetyLimits {
    /// Timeout applied to every adapter call
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_seconds)
    }

    /// Check if a document name matches any denylist pattern
    pub fn is_denylisted(&self, name: &str) -> bool {
        self.denylist_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(name))
    }

    /// Validate an upload against size limits and the denylist
    pub fn validate_document(&self, name: &str, content: &[u8]) -> Result<(), SafetyViolation> {
        if name.trim().is_empty() {
            return Err(SafetyViolation::MissingName);
        }

        if self.is_denylisted(name) {
            return Err(SafetyViolation::DenylistMatch {
                name: name.to_string(),
            });
        }

        let size = content.len() as u64;
        if size == 0 {
            return Err(SafetyViolation::EmptyDocument {
                name: name.to_string(),
            });
        }
        if size > self.max_document_bytes {
            return Err(SafetyViolation::MaxDocumentBytes {
                actual: size,
                limit: self.max_document_bytes,
            });
        }

        Ok(())
    }

    /// Validate the document list of a podcast request
    pub fn validate_podcast_inputs(&self, document_ids: &[String]) -> Result<(), SafetyViolation> {
        if document_ids.is_empty() {
            return Err(SafetyViolation::NoDocuments);
        }

        if document_ids.len() > self.max_documents_per_podcast {
            return Err(SafetyViolation::TooManyDocuments {
                actual: document_ids.len(),
                limit: self.max_documents_per_podcast,
            });
        }

        let mut seen = HashSet::new();
        for id in document_ids {
            if !seen.insert(id.as_str()) {
                return Err(SafetyViolation::DuplicateDocument { id: id.clone() });
            }
        }

        Ok(())
    }
}

/// Safety violation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SafetyViolation {
    #[error("Document name is required")]
    MissingName,

    #[error("Document '{name}' is empty")]
    EmptyDocument { name: String },

    #[error("Maximum document bytes exceeded: {actual} > {limit}")]
    MaxDocumentBytes { actual: u64, limit: u64 },

    #[error("Document name matches denylist pattern: {name}")]
    DenylistMatch { name: String },

    #[error("At least one document is required")]
    NoDocuments,

    #[error("Too many documents for one podcast: {actual} > {limit}")]
    TooManyDocuments { actual: usize, limit: usize },

    #[error("Document {id} is listed more than once")]
    DuplicateDocument { id: String },
}

impl From<SafetyViolation> for PipelineError {
    fn from(violation: SafetyViolation) -> Self {
        PipelineError::Validation(violation.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = SafetyLimits::default();
        assert_eq!(limits.max_document_bytes, 10 * 1024 * 1024);
        assert_eq!(limits.max_documents_per_podcast, 20);
        assert_eq!(limits.call_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn test_denylist_matching() {
        let limits = SafetyLimits::default();

        assert!(limits.is_denylisted(".env"));
        assert!(limits.is_denylisted(".env.local"));
        assert!(limits.is_denylisted("config/secrets.json"));
        assert!(limits.is_denylisted("keys/server.key"));
        assert!(limits.is_denylisted("certs/server.pem"));

        assert!(!limits.is_denylisted("notes.md"));
        assert!(!limits.is_denylisted("quarterly-report.txt"));
    }

    #[test]
    fn test_document_validation() {
        let limits = SafetyLimits {
            max_document_bytes: 100,
            ..Default::default()
        };

        assert!(limits.validate_document("a.txt", b"short").is_ok());

        let long = vec![b'x'; 200];
        assert!(matches!(
            limits.validate_document("a.txt", &long),
            Err(SafetyViolation::MaxDocumentBytes { .. })
        ));
        assert!(matches!(
            limits.validate_document("a.txt", b""),
            Err(SafetyViolation::EmptyDocument { .. })
        ));
        assert!(matches!(
            limits.validate_document("server.pem", b"-----BEGIN"),
            Err(SafetyViolation::DenylistMatch { .. })
        ));
    }

    #[test]
    fn test_podcast_input_validation() {
        let limits = SafetyLimits {
            max_documents_per_podcast: 2,
            ..Default::default()
        };
        let ids = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert!(limits.validate_podcast_inputs(&ids(&["a", "b"])).is_ok());
        assert_eq!(
            limits.validate_podcast_inputs(&[]),
            Err(SafetyViolation::NoDocuments)
        );
        assert!(matches!(
            limits.validate_podcast_inputs(&ids(&["a", "b", "c"])),
            Err(SafetyViolation::TooManyDocuments { .. })
        ));
        assert!(matches!(
            limits.validate_podcast_inputs(&ids(&["a", "a"])),
            Err(SafetyViolation::DuplicateDocument { .. })
        ));
    }

    #[test]
    fn test_violation_is_validation_error() {
        let err: PipelineError = SafetyViolation::NoDocuments.into();
        assert_eq!(err.code(), "validation_error");
    }
}

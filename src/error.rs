//! Error taxonomy for the pipeline and the envelopes handed to transports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::stage::Stage;
use crate::domain::{ResourceStatus, ResourceType};

/// Errors surfaced by the store, the stage runner and the orchestrator
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Provider temporarily unavailable: {0}")]
    TransientProvider(String),

    #[error("Provider failed: {0}")]
    PermanentProvider(String),

    #[error("Dependency {resource} is not ready (status: {status})")]
    DependencyNotReady {
        resource: String,
        status: ResourceStatus,
    },

    #[error("Index for '{resource_type}' cannot be loaded: {message}")]
    IndexCorruption {
        resource_type: ResourceType,
        message: String,
    },

    #[error("Could not allocate a unique {resource_type} id after {attempts} attempts")]
    AllocationExhausted {
        resource_type: ResourceType,
        attempts: u32,
    },

    #[error("Invalid status transition for {resource}: {from} -> {to}")]
    InvalidTransition {
        resource: String,
        from: ResourceStatus,
        to: ResourceStatus,
    },

    #[error("Job {0} was cancelled")]
    Cancelled(String),

    #[error("{resource} was interrupted while {status}; invoke its stage again")]
    Interrupted {
        resource: String,
        status: ResourceStatus,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Stage '{stage}' failed for {resource} after {attempts} attempt(s): {source}")]
    StageFailed {
        stage: Stage,
        resource: String,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

impl PipelineError {
    pub fn not_found(resource: impl ToString) -> Self {
        Self::NotFound {
            resource: resource.to_string(),
        }
    }

    /// Stable machine-readable code.
    ///
    /// A failed stage reports the code of the error that ended it.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::NotFound { .. } => "not_found",
            PipelineError::Validation(_) => "validation_error",
            PipelineError::TransientProvider(_) => "transient_provider_error",
            PipelineError::PermanentProvider(_) => "permanent_provider_error",
            PipelineError::DependencyNotReady { .. } => "dependency_not_ready",
            PipelineError::IndexCorruption { .. } => "index_corruption",
            PipelineError::AllocationExhausted { .. } => "allocation_exhausted",
            PipelineError::InvalidTransition { .. } => "invalid_transition",
            PipelineError::Cancelled(_) => "cancelled",
            PipelineError::Interrupted { .. } => "interrupted",
            PipelineError::Internal(_) => "internal_error",
            PipelineError::StageFailed { source, .. } => source.code(),
            PipelineError::Io(_) => "io_error",
            PipelineError::Serialization(_) => "serialization_error",
        }
    }

    /// The innermost error, looking through `StageFailed` wrappers
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::StageFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Whether the stage retry loop may try again
    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientProvider(_))
    }

    /// Structured details for the error envelope
    pub fn details(&self) -> serde_json::Value {
        match self {
            PipelineError::NotFound { resource } => serde_json::json!({ "resource": resource }),
            PipelineError::DependencyNotReady { resource, status } => serde_json::json!({
                "resource": resource,
                "status": status,
            }),
            PipelineError::Interrupted { resource, status } => serde_json::json!({
                "resource": resource,
                "status": status,
            }),
            PipelineError::IndexCorruption { resource_type, .. } => {
                serde_json::json!({ "resource_type": resource_type })
            }
            PipelineError::InvalidTransition { resource, from, to } => serde_json::json!({
                "resource": resource,
                "from": from,
                "to": to,
            }),
            PipelineError::StageFailed {
                stage,
                resource,
                attempts,
                source,
            } => serde_json::json!({
                "stage": stage,
                "resource": resource,
                "attempts": attempts,
                "cause": source.root_cause().to_string(),
            }),
            _ => serde_json::Value::Null,
        }
    }

    pub fn to_envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope {
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                details: self.details(),
            },
        }
    }
}

/// `{error: {code, message, details}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: serde_json::Value,
}

//! Resource identity and the record envelope kept for every artifact.
//!
//! Every durable artifact (document, segment set, podcast, audio) is
//! addressed by a `(type, id)` pair and described by a [`ResourceRecord`]
//! in the store's index.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Free-form metadata attached to a record
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Name of the payload part written by a plain `put`
pub const DEFAULT_PART: &str = "content";

/// Kinds of resources kept by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    /// An uploaded source document and its extracted text
    Document,

    /// Story segments generated for a podcast (shares the podcast id)
    Segments,

    /// A composed podcast
    Podcast,

    /// Synthesized audio for a podcast
    Audio,
}

impl ResourceType {
    /// All stored resource types, in index order
    pub const ALL: [ResourceType; 4] = [
        ResourceType::Document,
        ResourceType::Segments,
        ResourceType::Podcast,
        ResourceType::Audio,
    ];

    /// Stable lowercase name used in paths and index file names
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Document => "document",
            ResourceType::Segments => "segments",
            ResourceType::Podcast => "podcast",
            ResourceType::Audio => "audio",
        }
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceType {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "document" | "documents" => Ok(ResourceType::Document),
            "segments" => Ok(ResourceType::Segments),
            "podcast" | "podcasts" => Ok(ResourceType::Podcast),
            "audio" => Ok(ResourceType::Audio),
            _ => Err(PipelineError::Validation(format!(
                "unknown resource type: {}",
                s
            ))),
        }
    }
}

/// A `(type, id)` pair identifying one resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_type: ResourceType,
    pub id: String,
}

impl ResourceKey {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
        }
    }

    pub fn document(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Document, id)
    }

    pub fn segments(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Segments, id)
    }

    pub fn podcast(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Podcast, id)
    }

    pub fn audio(id: impl Into<String>) -> Self {
        Self::new(ResourceType::Audio, id)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.resource_type, self.id)
    }
}

/// Lifecycle status of a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceStatus {
    /// Allocated, nothing produced yet
    Pending,

    /// The producing stage is executing
    Running,

    /// Output is complete and immutable
    Succeeded,

    /// The producing stage failed; `last_error` explains why
    Failed,
}

impl ResourceStatus {
    /// Whether a record may move from `self` to `next`.
    ///
    /// `Failed -> Pending` is only reachable through an explicit re-open.
    pub fn can_transition_to(&self, next: ResourceStatus) -> bool {
        use ResourceStatus::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Failed) | (Running, Succeeded) | (Running, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceStatus::Succeeded | ResourceStatus::Failed)
    }
}

impl Default for ResourceStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Pending => "pending",
            ResourceStatus::Running => "running",
            ResourceStatus::Succeeded => "succeeded",
            ResourceStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Error retained on a failed record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordError {
    /// Stable error code (see `PipelineError::code`)
    pub code: String,

    /// Human-readable message
    pub message: String,
}

impl From<&PipelineError> for RecordError {
    fn from(err: &PipelineError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Reference to one stored payload part
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartRef {
    /// File name inside the record's location
    pub file: String,

    /// Size in bytes
    pub size_bytes: u64,

    /// Hex SHA-256 of the bytes
    pub checksum: String,
}

/// The envelope the store keeps for every resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub resource_type: ResourceType,
    pub id: String,

    /// Directory holding the payload parts, relative to the store root
    pub location: String,

    pub status: ResourceStatus,

    #[serde(default)]
    pub metadata: Metadata,

    /// Payload parts by name
    #[serde(default)]
    pub parts: BTreeMap<String, PartRef>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<RecordError>,
}

impl ResourceRecord {
    /// Create a fresh pending record
    pub fn new(key: &ResourceKey, metadata: Metadata) -> Self {
        let now = Utc::now();
        Self {
            resource_type: key.resource_type,
            id: key.id.clone(),
            location: format!("objects/{}/{}", key.resource_type, key.id),
            status: ResourceStatus::Pending,
            metadata,
            parts: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            last_error: None,
        }
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey::new(self.resource_type, self.id.clone())
    }

    /// Read a string metadata value
    pub fn meta_str(&self, name: &str) -> Option<&str> {
        self.metadata.get(name).and_then(|v| v.as_str())
    }

    /// Read an unsigned metadata value
    pub fn meta_u64(&self, name: &str) -> Option<u64> {
        self.metadata.get(name).and_then(|v| v.as_u64())
    }
}

/// Scheme of a resource URI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UriScheme {
    Document,
    Podcast,
    Audio,
    Voices,
}

impl UriScheme {
    fn as_str(&self) -> &'static str {
        match self {
            UriScheme::Document => "document",
            UriScheme::Podcast => "podcast",
            UriScheme::Audio => "audio",
            UriScheme::Voices => "voices",
        }
    }
}

/// A parsed `{type}://{id}[/{sub-resource}]` address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceUri {
    pub scheme: UriScheme,
    pub id: String,
    pub sub_resource: Option<String>,
}

impl ResourceUri {
    pub fn new(scheme: UriScheme, id: impl Into<String>) -> Self {
        Self {
            scheme,
            id: id.into(),
            sub_resource: None,
        }
    }

    pub fn with_sub(mut self, sub: impl Into<String>) -> Self {
        self.sub_resource = Some(sub.into());
        self
    }
}

impl fmt::Display for ResourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.id)?;
        if let Some(ref sub) = self.sub_resource {
            write!(f, "/{}", sub)?;
        }
        Ok(())
    }
}

impl FromStr for ResourceUri {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || PipelineError::Validation(format!("invalid resource uri: {}", s));

        let (scheme, rest) = s.split_once("://").ok_or_else(invalid)?;
        let scheme = match scheme {
            "document" => UriScheme::Document,
            "podcast" => UriScheme::Podcast,
            "audio" => UriScheme::Audio,
            "voices" => UriScheme::Voices,
            _ => return Err(invalid()),
        };

        let (id, sub) = match rest.split_once('/') {
            Some((id, sub)) if !sub.is_empty() => (id, Some(sub.to_string())),
            Some((id, _)) => (id, None),
            None => (rest, None),
        };

        if id.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            scheme,
            id: id.to_string(),
            sub_resource: sub,
        })
    }
}

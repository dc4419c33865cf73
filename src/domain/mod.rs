//! Domain types for the podcast pipeline.
//!
//! This module contains the core data structures:
//! - Resource: Identity, status and the record envelope
//! - Document, Podcast, Audio: Typed views over stored artifacts
//! - Events: Stage journal entries

pub mod audio;
pub mod document;
pub mod events;
pub mod podcast;
pub mod resource;

// Re-export commonly used types
pub use audio::{estimate_duration_ms, AudioArtifact, AudioSegmentRef, VoiceFilter, VoiceProfile};
pub use document::{guess_content_type, Document, ExtractionStatus, TEXT_PART};
pub use events::{StageEvent, StageEventType};
pub use podcast::{
    assemble_script, default_title, Podcast, SegmentDraft, SegmentKind, SegmentSet, StorySegment,
};
pub use resource::{
    Metadata, PartRef, RecordError, ResourceKey, ResourceRecord, ResourceStatus, ResourceType,
    ResourceUri, UriScheme, DEFAULT_PART,
};

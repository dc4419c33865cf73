//! Capability adapters for external systems.
//!
//! Stages reach extraction, text generation, speech synthesis and the voice
//! catalogue only through the narrow async traits below. Each call is one
//! unit of work for the stage's timeout and retry policy; adapters do not
//! report progress themselves.

pub mod azure_speech;
pub mod fabric;
pub mod plain_text;
pub mod template;
pub mod voices;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{SegmentDraft, VoiceFilter, VoiceProfile};
use crate::error::PipelineError;

pub use azure_speech::AzureSpeechAdapter;
pub use fabric::FabricAdapter;
pub use plain_text::PlainTextExtractor;
pub use template::TemplateComposer;
pub use voices::{builtin_voices, default_style_for, StaticVoiceCatalog, VoiceCasting};

/// How a provider failure should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Network hiccup, rate limit, 5xx: worth retrying
    Transient,

    /// The provider will never accept this call
    Permanent,

    /// The input itself is unusable (empty text, unknown encoding, ...)
    InvalidInput,
}

/// Error returned by every adapter call
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            kind: ProviderErrorKind::InvalidInput,
            message: message.into(),
        }
    }
}

impl From<ProviderError> for PipelineError {
    fn from(err: ProviderError) -> Self {
        match err.kind {
            ProviderErrorKind::Transient => PipelineError::TransientProvider(err.message),
            ProviderErrorKind::Permanent => PipelineError::PermanentProvider(err.message),
            ProviderErrorKind::InvalidInput => PipelineError::Validation(err.message),
        }
    }
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Extracted text of one document, as handed to segment generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceText {
    pub document_id: String,
    pub name: String,
    pub text: String,
}

/// Knobs for segment generation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOptions {
    pub title: Option<String>,
    pub length_minutes: u32,
}

impl GenerationOptions {
    /// Stories to ask for per document
    pub fn target_segment_count(&self) -> usize {
        (self.length_minutes as usize / 2).max(3)
    }
}

/// Audio returned by a synthesizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub data: Vec<u8>,

    /// Playback length, if the provider reports it
    pub duration_ms: Option<u64>,
}

/// Turns raw document bytes into text
#[async_trait]
pub trait TextExtractor: Send + Sync {
    fn name(&self) -> &str;

    async fn extract_text(&self, document_name: &str, content: &[u8]) -> ProviderResult<String>;
}

/// Writes story segments from extracted texts
#[async_trait]
pub trait SegmentGenerator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate_segments(
        &self,
        sources: &[SourceText],
        options: &GenerationOptions,
    ) -> ProviderResult<Vec<SegmentDraft>>;
}

/// Orders stories and adds host segments (intro, transitions, outro)
#[async_trait]
pub trait PodcastComposer: Send + Sync {
    fn name(&self) -> &str;

    async fn compose_podcast(
        &self,
        stories: &[SegmentDraft],
        title: &str,
    ) -> ProviderResult<Vec<SegmentDraft>>;
}

/// Text to speech
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    fn name(&self) -> &str;

    async fn synthesize(
        &self,
        text: &str,
        voice_name: &str,
        voice_style: Option<&str>,
    ) -> ProviderResult<SynthesizedAudio>;
}

/// Lists the voices a synthesizer offers
#[async_trait]
pub trait VoiceCatalog: Send + Sync {
    async fn list_voices(&self, filter: &VoiceFilter) -> ProviderResult<Vec<VoiceProfile>>;
}

/// Escape text for inclusion in XML (SSML) or prompts that quote it
pub(crate) fn escape_xml(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// First `max_chars` characters of `text`, on a char boundary
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_classification() {
        let err: PipelineError = ProviderError::transient("429").into();
        assert!(err.is_transient());

        let err: PipelineError = ProviderError::permanent("401").into();
        assert_eq!(err.code(), "permanent_provider_error");

        let err: PipelineError = ProviderError::invalid_input("empty").into();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn test_target_segment_count() {
        let opts = |m| GenerationOptions {
            title: None,
            length_minutes: m,
        };
        assert_eq!(opts(5).target_segment_count(), 3);
        assert_eq!(opts(0).target_segment_count(), 3);
        assert_eq!(opts(10).target_segment_count(), 5);
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }

    #[test]
    fn test_escape_xml() {
        assert_eq!(escape_xml("a < b & \"c\""), "a &lt; b &amp; &quot;c&quot;");
    }
}

//! Built-in voice catalogue and default voice casting.

use async_trait::async_trait;

use crate::domain::{SegmentKind, VoiceFilter, VoiceProfile};

use super::{ProviderResult, VoiceCatalog};

/// The en-US neural voices offered out of the box
pub fn builtin_voices() -> Vec<VoiceProfile> {
    vec![
        VoiceProfile::new(
            "en-US-JennyNeural",
            "Female",
            "en-US",
            &["chat", "cheerful", "empathetic"],
        ),
        VoiceProfile::new("en-US-GuyNeural", "Male", "en-US", &["newscast", "calm"]),
        VoiceProfile::new(
            "en-US-DavisNeural",
            "Male",
            "en-US",
            &["chat", "narration-professional"],
        ),
        VoiceProfile::new(
            "en-US-AriaNeural",
            "Female",
            "en-US",
            &["newscast", "narration-professional", "customerservice"],
        ),
    ]
}

/// Style used for a voice when the caller does not pick one
pub fn default_style_for(voice_name: &str) -> Option<&'static str> {
    match voice_name {
        "en-US-JennyNeural" => Some("cheerful"),
        "en-US-GuyNeural" => Some("newscast"),
        "en-US-DavisNeural" => Some("narration-professional"),
        "en-US-AriaNeural" => Some("newscast"),
        _ => None,
    }
}

/// Who reads which segment when no voice override is given
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VoiceCasting {
    pub host_voice: String,
    pub reporter_voices: Vec<String>,
}

impl VoiceCasting {
    /// Host voice for intro, transitions and outro; reporters take turns on
    /// stories (`story_index` counts stories only)
    pub fn voice_for(&self, kind: SegmentKind, story_index: usize) -> &str {
        if kind.is_host_segment() || self.reporter_voices.is_empty() {
            return &self.host_voice;
        }
        &self.reporter_voices[story_index % self.reporter_voices.len()]
    }
}

/// Voice catalogue backed by [`builtin_voices`]
#[derive(Debug, Clone)]
pub struct StaticVoiceCatalog {
    voices: Vec<VoiceProfile>,
}

impl Default for StaticVoiceCatalog {
    fn default() -> Self {
        Self::new(builtin_voices())
    }
}

impl StaticVoiceCatalog {
    pub fn new(voices: Vec<VoiceProfile>) -> Self {
        Self { voices }
    }
}

#[async_trait]
impl VoiceCatalog for StaticVoiceCatalog {
    async fn list_voices(&self, filter: &VoiceFilter) -> ProviderResult<Vec<VoiceProfile>> {
        Ok(self
            .voices
            .iter()
            .filter(|v| filter.matches(v))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_catalog_filters() {
        let catalog = StaticVoiceCatalog::default();

        let all = catalog.list_voices(&VoiceFilter::default()).await.unwrap();
        assert_eq!(all.len(), 4);

        let female = catalog
            .list_voices(&VoiceFilter {
                gender: Some("Female".to_string()),
                locale: Some("en-US".to_string()),
            })
            .await
            .unwrap();
        let names: Vec<&str> = female.iter().map(|v| v.name.as_str()).collect();
        assert_eq!(names, vec!["en-US-JennyNeural", "en-US-AriaNeural"]);
    }

    #[test]
    fn test_casting_rotates_reporters() {
        let casting = VoiceCasting {
            host_voice: "host".to_string(),
            reporter_voices: vec!["r1".to_string(), "r2".to_string()],
        };

        assert_eq!(casting.voice_for(SegmentKind::Intro, 0), "host");
        assert_eq!(casting.voice_for(SegmentKind::Story, 0), "r1");
        assert_eq!(casting.voice_for(SegmentKind::Story, 1), "r2");
        assert_eq!(casting.voice_for(SegmentKind::Story, 2), "r1");
        assert_eq!(casting.voice_for(SegmentKind::Transition, 1), "host");
    }

    #[test]
    fn test_default_styles_are_supported() {
        for voice in builtin_voices() {
            let style = default_style_for(&voice.name).unwrap();
            assert!(voice.supports_style(style), "{} / {}", voice.name, style);
        }
    }
}

//! Audio artifacts and the voice catalogue.

use serde::{Deserialize, Serialize};

use super::podcast::SegmentKind;

/// Bytes per second of the 16 kHz, 32 kbit/s mono MP3 output format
pub const MP3_BYTES_PER_SECOND: u64 = 4_000;

/// Estimate playback length of MP3 bytes in the default output format
pub fn estimate_duration_ms(size_bytes: u64) -> u64 {
    size_bytes * 1000 / MP3_BYTES_PER_SECOND
}

/// A voice offered by the speech provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceProfile {
    pub name: String,
    pub gender: String,
    pub locale: String,
    #[serde(default)]
    pub styles: Vec<String>,
}

impl VoiceProfile {
    pub fn new(name: &str, gender: &str, locale: &str, styles: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            gender: gender.to_string(),
            locale: locale.to_string(),
            styles: styles.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn supports_style(&self, style: &str) -> bool {
        self.styles.iter().any(|s| s.eq_ignore_ascii_case(style))
    }
}

/// Optional filter for voice listings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceFilter {
    pub gender: Option<String>,
    pub locale: Option<String>,
}

impl VoiceFilter {
    pub fn matches(&self, voice: &VoiceProfile) -> bool {
        let gender_ok = self
            .gender
            .as_ref()
            .map(|g| voice.gender.eq_ignore_ascii_case(g))
            .unwrap_or(true);
        let locale_ok = self
            .locale
            .as_ref()
            .map(|l| voice.locale.eq_ignore_ascii_case(l))
            .unwrap_or(true);
        gender_ok && locale_ok
    }
}

/// Where one segment's audio lives inside an artifact's bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioSegmentRef {
    pub index: usize,
    pub segment_id: String,
    pub kind: SegmentKind,
    pub voice_name: String,
    #[serde(default)]
    pub voice_style: Option<String>,
    pub offset: u64,
    pub length: u64,
    pub duration_ms: u64,
}

/// Synthesized audio for a podcast or a preview
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioArtifact {
    pub id: String,

    /// Absent for previews of ad-hoc text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podcast_id: Option<String>,

    /// Voice override requested by the caller, if any
    #[serde(default)]
    pub voice_name: Option<String>,
    #[serde(default)]
    pub voice_style: Option<String>,

    pub format: String,
    pub size_bytes: u64,
    pub duration_ms: u64,
    pub segments: Vec<AudioSegmentRef>,
}

impl AudioArtifact {
    pub fn segment(&self, index: usize) -> Option<&AudioSegmentRef> {
        self.segments.iter().find(|s| s.index == index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_voice_filter() {
        let jenny = VoiceProfile::new("en-US-JennyNeural", "Female", "en-US", &["chat"]);
        let guy = VoiceProfile::new("en-US-GuyNeural", "Male", "en-US", &["newscast"]);

        let filter = VoiceFilter {
            gender: Some("female".to_string()),
            locale: None,
        };
        assert!(filter.matches(&jenny));
        assert!(!filter.matches(&guy));

        let filter = VoiceFilter {
            gender: None,
            locale: Some("de-DE".to_string()),
        };
        assert!(!filter.matches(&jenny));
        assert!(VoiceFilter::default().matches(&guy));
    }

    #[test]
    fn test_duration_estimate() {
        assert_eq!(estimate_duration_ms(4_000), 1_000);
        assert_eq!(estimate_duration_ms(0), 0);
        assert_eq!(estimate_duration_ms(10_000), 2_500);
    }
}

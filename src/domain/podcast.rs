//! Story segments and composed podcasts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Role of a segment within a podcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Story,
    Intro,
    Transition,
    Outro,
}

impl SegmentKind {
    /// Segments voiced by the host rather than a reporter
    pub fn is_host_segment(&self) -> bool {
        !matches!(self, SegmentKind::Story)
    }
}

impl std::fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SegmentKind::Story => write!(f, "story"),
            SegmentKind::Intro => write!(f, "intro"),
            SegmentKind::Transition => write!(f, "transition"),
            SegmentKind::Outro => write!(f, "outro"),
        }
    }
}

/// A segment as returned by a generation or composition adapter, before
/// the pipeline assigns identity and ordering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDraft {
    pub kind: SegmentKind,

    #[serde(default)]
    pub title: Option<String>,

    pub content: String,

    /// Ids of the documents this segment was derived from
    #[serde(default)]
    pub source_documents: Vec<String>,
}

impl SegmentDraft {
    pub fn story(
        title: impl Into<String>,
        content: impl Into<String>,
        source_documents: Vec<String>,
    ) -> Self {
        Self {
            kind: SegmentKind::Story,
            title: Some(title.into()),
            content: content.into(),
            source_documents,
        }
    }

    pub fn host(kind: SegmentKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            title: None,
            content: content.into(),
            source_documents: Vec::new(),
        }
    }
}

/// One ordered segment of a podcast script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorySegment {
    pub id: String,

    /// Position within its sequence (0-based)
    pub index: usize,

    pub kind: SegmentKind,

    #[serde(default)]
    pub title: Option<String>,

    pub content: String,

    #[serde(default)]
    pub source_documents: Vec<String>,
}

impl StorySegment {
    pub fn from_draft(id: String, index: usize, draft: SegmentDraft) -> Self {
        Self {
            id,
            index,
            kind: draft.kind,
            title: draft.title,
            content: draft.content,
            source_documents: draft.source_documents,
        }
    }

    /// Strip identity back off, for handing to adapters
    pub fn to_draft(&self) -> SegmentDraft {
        SegmentDraft {
            kind: self.kind,
            title: self.title.clone(),
            content: self.content.clone(),
            source_documents: self.source_documents.clone(),
        }
    }
}

/// Output of the GenerateSegments stage, stored under the podcast id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentSet {
    pub podcast_id: String,

    #[serde(default)]
    pub title: Option<String>,

    pub length_minutes: u32,

    pub document_ids: Vec<String>,

    pub segments: Vec<StorySegment>,

    pub created_at: DateTime<Utc>,
}

/// A composed podcast. Never mutated once its record has succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Podcast {
    pub id: String,

    pub title: String,

    pub segments: Vec<StorySegment>,

    pub document_ids: Vec<String>,

    pub created_at: DateTime<Utc>,
}

impl Podcast {
    /// The full script as a single text
    pub fn full_script(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn story_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.kind == SegmentKind::Story)
            .count()
    }
}

/// Title used when the caller gives none
pub fn default_title(story_count: usize) -> String {
    format!("Podcast with {} segments", story_count)
}

/// Lay out a script: intro, stories with a transition between each adjacent
/// pair (when given), outro.
///
/// `transitions[i]` goes between `stories[i]` and `stories[i + 1]`; extra
/// transitions are ignored.
pub fn assemble_script(
    intro: SegmentDraft,
    stories: &[SegmentDraft],
    transitions: Vec<SegmentDraft>,
    outro: SegmentDraft,
) -> Vec<SegmentDraft> {
    let mut script = Vec::with_capacity(stories.len() * 2 + 2);
    let mut transitions = transitions.into_iter();

    script.push(intro);
    for (i, story) in stories.iter().enumerate() {
        script.push(story.clone());
        if i + 1 < stories.len() {
            if let Some(transition) = transitions.next() {
                script.push(transition);
            }
        }
    }
    script.push(outro);

    script
}

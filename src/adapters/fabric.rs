//! Fabric adapter for segment generation and composition.
//!
//! Uses subprocess mode, calling the `fabric` CLI directly: the prompt is
//! piped to `fabric -p <pattern>` on stdin and the answer read from stdout.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{assemble_script, SegmentDraft, SegmentKind};

use super::{
    truncate_chars, GenerationOptions, PodcastComposer, ProviderError, ProviderResult,
    SegmentGenerator, SourceText,
};

/// Characters of each document handed to the model
const MAX_SOURCE_CHARS: usize = 3000;

/// Characters of each story quoted in host prompts
const SUMMARY_CHARS: usize = 200;

/// Fabric adapter using subprocess mode
#[derive(Debug, Clone)]
pub struct FabricAdapter {
    /// Path to the fabric binary (default: "fabric")
    binary_path: String,

    /// Pattern that turns a document into story segments (JSON)
    segments_pattern: String,

    /// Pattern that writes host lines (intro, transitions, outro)
    host_pattern: String,

    show_transitions: bool,
}

impl Default for FabricAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricAdapter {
    /// Create a new Fabric adapter with default binary path
    ///
    /// Looks for fabric-ai first (Homebrew install), falls back to fabric
    pub fn new() -> Self {
        let binary_path = if std::process::Command::new("fabric-ai")
            .arg("--help")
            .output()
            .is_ok()
        {
            "fabric-ai".to_string()
        } else {
            "fabric".to_string()
        };

        Self::with_binary_path(binary_path)
    }

    /// Create a Fabric adapter with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            segments_pattern: "create_podcast_segments".to_string(),
            host_pattern: "write_podcast_host".to_string(),
            show_transitions: true,
        }
    }

    pub fn with_patterns(
        mut self,
        segments_pattern: impl Into<String>,
        host_pattern: impl Into<String>,
    ) -> Self {
        self.segments_pattern = segments_pattern.into();
        self.host_pattern = host_pattern.into();
        self
    }

    pub fn with_transitions(mut self, show_transitions: bool) -> Self {
        self.show_transitions = show_transitions;
        self
    }

    /// Run a pattern via subprocess.
    ///
    /// The child is killed if the caller's timeout drops this future.
    async fn run_pattern(&self, pattern: &str, input: &str) -> ProviderResult<String> {
        let mut child = Command::new(&self.binary_path)
            .args(["-p", pattern])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::permanent(format!(
                    "Failed to spawn {} for pattern '{}': {}",
                    self.binary_path, pattern, e
                ))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(|e| {
                ProviderError::transient(format!("Failed to write to fabric stdin: {}", e))
            })?;
            // Drop stdin to signal EOF
        }

        let output = child.wait_with_output().await.map_err(|e| {
            ProviderError::transient(format!(
                "Failed to wait for fabric process for pattern '{}': {}",
                pattern, e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(ProviderError::transient(format!(
                "Fabric pattern '{}' failed with exit code {}: {}",
                pattern,
                exit_code,
                stderr.trim()
            )));
        }

        String::from_utf8(output.stdout)
            .map_err(|_| ProviderError::transient("Fabric output is not valid UTF-8"))
    }

    async fn host_line(&self, kind: SegmentKind, prompt: String) -> ProviderResult<SegmentDraft> {
        let text = self.run_pattern(&self.host_pattern, &prompt).await?;
        let text = text.trim();
        if text.is_empty() {
            return Err(ProviderError::transient(format!(
                "Fabric returned an empty {}",
                kind
            )));
        }
        Ok(SegmentDraft::host(kind, text))
    }
}

fn segments_prompt(source: &SourceText, count: usize) -> String {
    format!(
        "Create {count} distinct podcast segments from the document below.\n\
         Each segment is 1-2 conversational paragraphs on one topic, with a clear title.\n\
         Return only JSON: {{\"segments\": [{{\"title\": \"...\", \"content\": \"...\"}}]}}\n\n\
         Document: {name}\n\n{text}",
        count = count,
        name = source.name,
        text = truncate_chars(&source.text, MAX_SOURCE_CHARS),
    )
}

fn summaries(stories: &[SegmentDraft]) -> String {
    stories
        .iter()
        .map(|s| {
            format!(
                "- {}: {}...",
                s.title.as_deref().unwrap_or("Untitled"),
                truncate_chars(&s.content, SUMMARY_CHARS / 2)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Debug, Deserialize)]
struct SegmentsResponse {
    segments: Vec<GeneratedSegment>,
}

#[derive(Debug, Deserialize)]
struct GeneratedSegment {
    title: String,
    content: String,
}

/// Pull the JSON object out of a model answer that may wrap it in prose or
/// code fences
fn parse_segments(raw: &str) -> ProviderResult<Vec<GeneratedSegment>> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if s < e => &raw[s..=e],
        _ => return Err(ProviderError::transient("Fabric answer contains no JSON object")),
    };

    let response: SegmentsResponse = serde_json::from_str(json).map_err(|e| {
        ProviderError::transient(format!("Fabric answer is not valid segment JSON: {}", e))
    })?;

    let segments: Vec<GeneratedSegment> = response
        .segments
        .into_iter()
        .filter(|s| !s.content.trim().is_empty())
        .collect();
    if segments.is_empty() {
        return Err(ProviderError::transient("Fabric returned no segments"));
    }

    Ok(segments)
}

#[async_trait]
impl SegmentGenerator for FabricAdapter {
    fn name(&self) -> &str {
        "fabric"
    }

    async fn generate_segments(
        &self,
        sources: &[SourceText],
        options: &GenerationOptions,
    ) -> ProviderResult<Vec<SegmentDraft>> {
        let count = options.target_segment_count();
        let mut drafts = Vec::new();

        for source in sources {
            debug!(document_id = %source.document_id, count, "Generating segments via fabric");
            let raw = self
                .run_pattern(&self.segments_pattern, &segments_prompt(source, count))
                .await?;

            drafts.extend(parse_segments(&raw)?.into_iter().map(|s| {
                SegmentDraft::story(
                    s.title.trim(),
                    s.content.trim(),
                    vec![source.document_id.clone()],
                )
            }));
        }

        Ok(drafts)
    }
}

#[async_trait]
impl PodcastComposer for FabricAdapter {
    fn name(&self) -> &str {
        "fabric"
    }

    async fn compose_podcast(
        &self,
        stories: &[SegmentDraft],
        title: &str,
    ) -> ProviderResult<Vec<SegmentDraft>> {
        if stories.is_empty() {
            return Err(ProviderError::invalid_input(
                "cannot compose a podcast with no story segments",
            ));
        }

        let overview = summaries(stories);

        let intro = self
            .host_line(
                SegmentKind::Intro,
                format!(
                    "Write a 3-4 sentence podcast introduction for \"{}\" that welcomes \
                     listeners and previews these segments:\n{}",
                    title, overview
                ),
            )
            .await?;

        let mut transitions = Vec::new();
        if self.show_transitions {
            for pair in stories.windows(2) {
                let prompt = format!(
                    "Write a 1-2 sentence podcast transition.\nFrom: {} - {}\nTo: {} - {}",
                    pair[0].title.as_deref().unwrap_or("Untitled"),
                    truncate_chars(&pair[0].content, SUMMARY_CHARS),
                    pair[1].title.as_deref().unwrap_or("Untitled"),
                    truncate_chars(&pair[1].content, SUMMARY_CHARS),
                );
                transitions.push(self.host_line(SegmentKind::Transition, prompt).await?);
            }
        }

        let outro = self
            .host_line(
                SegmentKind::Outro,
                format!(
                    "Write a 2-3 sentence outro for the podcast \"{}\" that sums up these \
                     segments and thanks the audience:\n{}",
                    title, overview
                ),
            )
            .await?;

        Ok(assemble_script(intro, stories, transitions, outro))
    }
}

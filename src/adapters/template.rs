//! Offline composer that writes host segments from fixed templates.
//!
//! Useful when no text-generation backend is configured; the stories are
//! kept verbatim and only the intro, transitions and outro are templated.

use async_trait::async_trait;

use crate::domain::{assemble_script, SegmentDraft, SegmentKind};

use super::{PodcastComposer, ProviderError, ProviderResult};

#[derive(Debug, Clone)]
pub struct TemplateComposer {
    show_transitions: bool,
}

impl Default for TemplateComposer {
    fn default() -> Self {
        Self::new(true)
    }
}

impl TemplateComposer {
    pub fn new(show_transitions: bool) -> Self {
        Self { show_transitions }
    }
}

fn story_title(story: &SegmentDraft) -> &str {
    story.title.as_deref().unwrap_or("our next story")
}

fn list_titles(stories: &[SegmentDraft]) -> String {
    let titles: Vec<&str> = stories.iter().map(story_title).collect();
    match titles.as_slice() {
        [] => String::new(),
        [only] => only.to_string(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

#[async_trait]
impl PodcastComposer for TemplateComposer {
    fn name(&self) -> &str {
        "template"
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

        let intro = SegmentDraft::host(
            SegmentKind::Intro,
            format!(
                "Welcome to {}. Today we have {} stories for you: {}. Let's get started.",
                title,
                stories.len(),
                list_titles(stories)
            ),
        );

        let transitions = if self.show_transitions {
            stories
                .windows(2)
                .map(|pair| {
                    SegmentDraft::host(
                        SegmentKind::Transition,
                        format!(
                            "That was {}. Next up: {}.",
                            story_title(&pair[0]),
                            story_title(&pair[1])
                        ),
                    )
                })
                .collect()
        } else {
            Vec::new()
        };

        let outro = SegmentDraft::host(
            SegmentKind::Outro,
            format!(
                "That wraps up {}. We covered {}. Thanks for listening, and see you next time.",
                title,
                list_titles(stories)
            ),
        );

        Ok(assemble_script(intro, stories, transitions, outro))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stories() -> Vec<SegmentDraft> {
        vec![
            SegmentDraft::story("Rust 2024", "Edition news.", vec!["d1".into()]),
            SegmentDraft::story("Async traits", "Stabilised.", vec!["d2".into()]),
        ]
    }

    #[tokio::test]
    async fn test_composes_with_transitions() {
        let script = TemplateComposer::new(true)
            .compose_podcast(&stories(), "Weekly")
            .await
            .unwrap();

        let kinds: Vec<SegmentKind> = script.iter().map(|s| s.kind).collect();
        assert_eq!(
            kinds,
            vec![
                SegmentKind::Intro,
                SegmentKind::Story,
                SegmentKind::Transition,
                SegmentKind::Story,
                SegmentKind::Outro
            ]
        );
        assert!(script[0].content.contains("Rust 2024 and Async traits"));
    }

    #[tokio::test]
    async fn test_composes_without_transitions() {
        let script = TemplateComposer::new(false)
            .compose_podcast(&stories(), "Weekly")
            .await
            .unwrap();

        assert_eq!(script.len(), 4);
    }

    #[tokio::test]
    async fn test_no_stories_is_invalid() {
        let result = TemplateComposer::default().compose_podcast(&[], "x").await;
        assert!(result.is_err());
    }
}

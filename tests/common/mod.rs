//! Shared fixtures: scripted adapters and an orchestrator on a temp store.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;

use castwright::adapters::{
    GenerationOptions, PlainTextExtractor, ProviderError, ProviderResult, SegmentGenerator,
    SourceText, SpeechSynthesizer, StaticVoiceCatalog, SynthesizedAudio, TemplateComposer,
};
use castwright::core::{ProgressHub, RetryPolicy};
use castwright::domain::SegmentDraft;
use castwright::{Adapters, Orchestrator, OrchestratorSettings};

/// One story per document, quoting the start of its text
pub struct QuotingGenerator;

#[async_trait]
impl SegmentGenerator for QuotingGenerator {
    fn name(&self) -> &str {
        "quoting"
    }

    async fn generate_segments(
        &self,
        sources: &[SourceText],
        _options: &GenerationOptions,
    ) -> ProviderResult<Vec<SegmentDraft>> {
        Ok(sources
            .iter()
            .map(|s| {
                let quote: String = s.text.chars().take(60).collect();
                SegmentDraft::story(
                    format!("About {}", s.name),
                    format!("Today's story: {}", quote),
                    vec![s.document_id.clone()],
                )
            })
            .collect())
    }
}

/// Fails with a transient error for the first `failures` calls, then
/// returns `[voice|style] text` as the audio bytes
#[derive(Default)]
pub struct ScriptedSynthesizer {
    failures: AtomicU32,
    calls: AtomicU32,
}

impl ScriptedSynthesizer {
    pub fn failing(failures: u32) -> Self {
        Self {
            failures: AtomicU32::new(failures),
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechSynthesizer for ScriptedSynthesizer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn synthesize(
        &self,
        text: &str,
        voice_name: &str,
        voice_style: Option<&str>,
    ) -> ProviderResult<SynthesizedAudio> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(ProviderError::transient("speech service unavailable"));
        }

        Ok(SynthesizedAudio {
            data: format!("[{}|{}] {}", voice_name, voice_style.unwrap_or("-"), text).into_bytes(),
            duration_ms: None,
        })
    }
}

/// Always fails transiently
pub struct DownSynthesizer;

#[async_trait]
impl SpeechSynthesizer for DownSynthesizer {
    fn name(&self) -> &str {
        "down"
    }

    async fn synthesize(
        &self,
        _text: &str,
        _voice_name: &str,
        _voice_style: Option<&str>,
    ) -> ProviderResult<SynthesizedAudio> {
        Err(ProviderError::transient("503 Service Unavailable"))
    }
}

pub fn adapters(synthesizer: Arc<dyn SpeechSynthesizer>) -> Adapters {
    Adapters {
        extractor: Arc::new(PlainTextExtractor::new()),
        generator: Arc::new(QuotingGenerator),
        composer: Arc::new(TemplateComposer::default()),
        synthesizer,
        voices: Arc::new(StaticVoiceCatalog::default()),
    }
}

/// Settings with undelayed retries (3 attempts)
pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        retry: RetryPolicy::immediate(3),
        ..OrchestratorSettings::default()
    }
}

pub async fn orchestrator_with(adapters: Adapters) -> (TempDir, Orchestrator) {
    let temp = TempDir::new().unwrap();
    let orchestrator = Orchestrator::open(
        temp.path().join("store"),
        adapters,
        settings(),
        ProgressHub::disabled(),
    )
    .await
    .unwrap();
    (temp, orchestrator)
}

/// Open a second orchestrator on the store of an earlier one, as a restarted
/// process would
pub async fn reopen(temp: &TempDir) -> Orchestrator {
    Orchestrator::open(
        temp.path().join("store"),
        adapters(Arc::new(ScriptedSynthesizer::default())),
        settings(),
        ProgressHub::disabled(),
    )
    .await
    .unwrap()
}

pub async fn orchestrator() -> (TempDir, Orchestrator) {
    orchestrator_with(adapters(Arc::new(ScriptedSynthesizer::default()))).await
}

/// Upload two documents and run them through compose; returns the podcast id
pub async fn composed_podcast(orchestrator: &Orchestrator) -> String {
    let d1 = orchestrator
        .upload_document(b"Rust 1.80 ships LazyCell and LazyLock.", "rust.md")
        .await
        .unwrap();
    let d2 = orchestrator
        .upload_document(b"The tide tables for October are out.", "tides.txt")
        .await
        .unwrap();

    let podcast_id = orchestrator
        .generate_podcast(&[d1, d2], Some("Weekly".to_string()), None)
        .await
        .unwrap();
    orchestrator.compose_podcast(&podcast_id, None).await.unwrap();
    podcast_id
}

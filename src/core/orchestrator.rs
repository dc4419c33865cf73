//! Main orchestrator for the document -> podcast -> audio workflow.
//!
//! Each boundary operation allocates its output resource, runs one stage
//! through the [`StageRunner`] and returns the id of what it produced.
//! Stages for one podcast id are strictly ordered by their declared inputs;
//! independent documents extract in parallel.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use crate::adapters::{
    default_style_for, GenerationOptions, PodcastComposer, SegmentGenerator, SourceText,
    SpeechSynthesizer, TextExtractor, VoiceCasting, VoiceCatalog,
};
use crate::config::{PodcastConfig, ResolvedConfig};
use crate::domain::{
    default_title, estimate_duration_ms, guess_content_type, AudioArtifact, AudioSegmentRef,
    Document, Metadata, Podcast, ResourceKey, ResourceRecord, ResourceStatus, ResourceType,
    ResourceUri, SegmentDraft, SegmentKind, SegmentSet, StageEvent, StorySegment, UriScheme,
    VoiceFilter,
    VoiceProfile, DEFAULT_PART, TEXT_PART,
};
use crate::error::{PipelineError, Result};

use super::identity::{token, IdAllocator};
use super::journal::Journal;
use super::progress::ProgressHub;
use super::resource_store::ResourceStore;
use super::retry::RetryPolicy;
use super::safety::SafetyLimits;
use super::stage::{ActiveStage, Stage, StageContext, StageRunner};

/// Part of a podcast record holding the plain-text script
pub const SCRIPT_PART: &str = "script";

/// Part of an audio record holding the segment byte ranges
pub const MANIFEST_PART: &str = "manifest";

const AUDIO_FORMAT: &str = "mp3";

/// Capability adapters the stages call
#[derive(Clone)]
pub struct Adapters {
    pub extractor: Arc<dyn TextExtractor>,
    pub generator: Arc<dyn SegmentGenerator>,
    pub composer: Arc<dyn PodcastComposer>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub voices: Arc<dyn VoiceCatalog>,
}

/// Tunables for the workflow
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub retry: RetryPolicy,
    pub safety: SafetyLimits,
    pub casting: VoiceCasting,
    pub default_length_minutes: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        let podcast = PodcastConfig::default();
        Self {
            retry: RetryPolicy::default(),
            safety: SafetyLimits::default(),
            casting: podcast.casting(),
            default_length_minutes: podcast.default_length_minutes,
        }
    }
}

impl From<&ResolvedConfig> for OrchestratorSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            retry: config.retry.clone(),
            safety: config.safety.clone(),
            casting: config.podcast.casting(),
            default_length_minutes: config.podcast.default_length_minutes,
        }
    }
}

struct Inner {
    store: Arc<ResourceStore>,
    ids: IdAllocator,
    runner: StageRunner,
    adapters: Adapters,
    settings: OrchestratorSettings,
}

/// Main pipeline orchestrator; cheap to clone
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    /// Open (or create) a store under `root` and build an orchestrator on it.
    ///
    /// Records a previous process left unfinished are failed as
    /// `interrupted`, so their stages can be invoked again.
    pub async fn open(
        root: impl Into<std::path::PathBuf>,
        adapters: Adapters,
        settings: OrchestratorSettings,
        progress: ProgressHub,
    ) -> Result<Self> {
        let store = Arc::new(ResourceStore::open(root).await?);
        let recovered = store.recover_interrupted().await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "Recovered interrupted resources");
        }
        Ok(Self::new(store, adapters, settings, progress))
    }

    pub fn new(
        store: Arc<ResourceStore>,
        adapters: Adapters,
        settings: OrchestratorSettings,
        progress: ProgressHub,
    ) -> Self {
        let journal = Journal::new(store.jobs_dir());
        let runner = StageRunner::new(
            store.clone(),
            journal,
            progress,
            settings.retry.clone(),
            settings.safety.call_timeout(),
        );

        Self {
            inner: Arc::new(Inner {
                ids: IdAllocator::new(store.clone()),
                store,
                runner,
                adapters,
                settings,
            }),
        }
    }

    pub fn store(&self) -> &ResourceStore {
        &self.inner.store
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.inner.settings
    }

    /// Store a document and extract its text
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub async fn upload_document(&self, content: &[u8], name: &str) -> Result<String> {
        let inner = &self.inner;
        inner.settings.safety.validate_document(name, content)?;

        let mut metadata = Metadata::new();
        metadata.insert("name".to_string(), json!(name));
        metadata.insert("size_bytes".to_string(), json!(content.len()));
        metadata.insert("content_type".to_string(), json!(guess_content_type(name)));

        let record = inner
            .ids
            .allocate_record(ResourceType::Document, metadata)
            .await?;
        let key = record.key();

        let mut active = inner
            .runner
            .begin(StageContext {
                stage: Stage::Extract,
                job_id: key.id.clone(),
                inputs: Vec::new(),
                output: key.clone(),
            })
            .await?;

        if let Err(e) = inner
            .store
            .put_part(&key, DEFAULT_PART, content, Metadata::new())
            .await
        {
            return Err(active.fail(e).await);
        }
        info!(document_id = %key.id, "Document stored");

        let extractor = &inner.adapters.extractor;
        let text = match active
            .call("extract_text", move || extractor.extract_text(name, content))
            .await
        {
            Ok(text) if text.trim().is_empty() => Err(PipelineError::Validation(format!(
                "no text could be extracted from {}",
                name
            ))),
            other => other,
        };
        let text = match text {
            Ok(text) => text,
            Err(e) => return Err(active.fail(e).await),
        };

        let mut metadata = Metadata::new();
        metadata.insert("text_chars".to_string(), json!(text.chars().count()));
        active
            .succeed(vec![(TEXT_PART, text.into_bytes())], metadata)
            .await?;

        Ok(key.id)
    }

    /// Upload several documents; extraction runs concurrently.
    ///
    /// Results keep the order of `documents`.
    pub async fn upload_documents(&self, documents: Vec<(String, Vec<u8>)>) -> Vec<Result<String>> {
        let mut tasks = JoinSet::new();
        let count = documents.len();

        for (index, (name, content)) in documents.into_iter().enumerate() {
            let orchestrator = self.clone();
            tasks.spawn(async move {
                let result = orchestrator.upload_document(&content, &name).await;
                (index, result)
            });
        }

        let mut results: Vec<Option<Result<String>>> = (0..count).map(|_| None).collect();
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => {
                    warn!(error = %e, "Upload task panicked");
                    failure = Some(e.to_string());
                }
            }
        }

        results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(PipelineError::Internal(format!(
                        "upload task did not complete: {}",
                        failure.as_deref().unwrap_or("aborted")
                    )))
                })
            })
            .collect()
    }

    /// Generate story segments from extracted documents; returns the podcast id
    #[instrument(skip(self, title), fields(documents = document_ids.len()))]
    pub async fn generate_podcast(
        &self,
        document_ids: &[String],
        title: Option<String>,
        length_minutes: Option<u32>,
    ) -> Result<String> {
        let inner = &self.inner;
        inner.settings.safety.validate_podcast_inputs(document_ids)?;

        let length_minutes = length_minutes.unwrap_or(inner.settings.default_length_minutes);
        if length_minutes == 0 {
            return Err(PipelineError::Validation(
                "length_minutes must be at least 1".to_string(),
            ));
        }

        let inputs: Vec<ResourceKey> = document_ids.iter().map(ResourceKey::document).collect();
        let documents = inner.runner.ensure_ready(&inputs).await?;

        let mut metadata = Metadata::new();
        metadata.insert("document_ids".to_string(), json!(document_ids));
        metadata.insert("length_minutes".to_string(), json!(length_minutes));
        if let Some(ref title) = title {
            metadata.insert("title".to_string(), json!(title));
        }

        let record = inner
            .ids
            .allocate_record(ResourceType::Segments, metadata)
            .await?;
        let podcast_id = record.id.clone();
        info!(%podcast_id, "Generating segments");

        let mut active = inner
            .runner
            .begin(StageContext {
                stage: Stage::GenerateSegments,
                job_id: podcast_id.clone(),
                inputs,
                output: record.key(),
            })
            .await?;

        let options = GenerationOptions {
            title: title.clone(),
            length_minutes,
        };
        let outcome = self
            .segments_body(&mut active, &documents, &options, &podcast_id)
            .await;
        let set = match outcome {
            Ok(set) => set,
            Err(e) => return Err(active.fail(e).await),
        };

        let mut metadata = Metadata::new();
        metadata.insert("segment_count".to_string(), json!(set.segments.len()));
        active
            .succeed(vec![(DEFAULT_PART, serde_json::to_vec_pretty(&set)?)], metadata)
            .await?;

        Ok(podcast_id)
    }

    async fn segments_body(
        &self,
        active: &mut ActiveStage<'_>,
        documents: &[ResourceRecord],
        options: &GenerationOptions,
        podcast_id: &str,
    ) -> Result<SegmentSet> {
        let mut sources = Vec::with_capacity(documents.len());
        for record in documents {
            let text = self.inner.store.get_part(&record.key(), TEXT_PART).await?;
            sources.push(SourceText {
                document_id: record.id.clone(),
                name: record.meta_str("name").unwrap_or(&record.id).to_string(),
                text: String::from_utf8_lossy(&text).into_owned(),
            });
        }
        active.progress(20, "Generating story segments");

        let generator = &self.inner.adapters.generator;
        let sources_ref = &sources;
        let drafts = active
            .call("generate_segments", move || {
                generator.generate_segments(sources_ref, options)
            })
            .await?;

        let document_ids: Vec<String> = sources.iter().map(|s| s.document_id.clone()).collect();
        let segments: Vec<StorySegment> = drafts
            .into_iter()
            .filter(|d| d.kind == SegmentKind::Story && !d.content.trim().is_empty())
            .enumerate()
            .map(|(index, mut draft)| {
                // Attribution to documents outside this podcast is dropped
                draft.source_documents.retain(|id| document_ids.contains(id));
                if draft.source_documents.is_empty() {
                    draft.source_documents = document_ids.clone();
                }
                StorySegment::from_draft(token(), index, draft)
            })
            .collect();

        if segments.is_empty() {
            return Err(PipelineError::PermanentProvider(format!(
                "{} produced no story segments",
                generator.name()
            )));
        }
        debug!(count = segments.len(), "Segments generated");

        Ok(SegmentSet {
            podcast_id: podcast_id.to_string(),
            title: options.title.clone(),
            length_minutes: options.length_minutes,
            document_ids,
            segments,
            created_at: Utc::now(),
        })
    }

    /// Compose generated segments into a podcast script
    #[instrument(skip(self, title))]
    pub async fn compose_podcast(&self, podcast_id: &str, title: Option<String>) -> Result<String> {
        let inner = &self.inner;
        let segments_key = ResourceKey::segments(podcast_id);
        let output = ResourceKey::podcast(podcast_id);
        inner
            .runner
            .ensure_ready(std::slice::from_ref(&segments_key))
            .await?;

        match inner.store.find(&output).await? {
            None => {
                inner.store.create(&output, Metadata::new()).await?;
            }
            Some(record) => match record.status {
                ResourceStatus::Failed => {
                    info!(podcast_id, "Reopening failed composition");
                    inner.store.reopen(&output).await?;
                }
                ResourceStatus::Succeeded => {
                    return Err(PipelineError::Validation(format!(
                        "podcast {} is already composed; generate a new podcast to recompose",
                        podcast_id
                    )))
                }
                status => {
                    return Err(PipelineError::Validation(format!(
                        "composition of {} is already {}",
                        output, status
                    )))
                }
            },
        }

        let mut active = inner
            .runner
            .begin(StageContext {
                stage: Stage::Compose,
                job_id: podcast_id.to_string(),
                inputs: vec![segments_key],
                output,
            })
            .await?;

        let podcast = match self.compose_body(&mut active, podcast_id, title).await {
            Ok(podcast) => podcast,
            Err(e) => return Err(active.fail(e).await),
        };

        let mut metadata = Metadata::new();
        metadata.insert("title".to_string(), json!(podcast.title));
        metadata.insert("segment_count".to_string(), json!(podcast.segments.len()));
        metadata.insert("story_count".to_string(), json!(podcast.story_count()));
        let script = podcast.full_script().into_bytes();
        active
            .succeed(
                vec![
                    (DEFAULT_PART, serde_json::to_vec_pretty(&podcast)?),
                    (SCRIPT_PART, script),
                ],
                metadata,
            )
            .await?;

        Ok(podcast_id.to_string())
    }

    async fn compose_body(
        &self,
        active: &mut ActiveStage<'_>,
        podcast_id: &str,
        title: Option<String>,
    ) -> Result<Podcast> {
        let set = self.segments(podcast_id).await?;
        let stories: Vec<_> = set.segments.iter().map(StorySegment::to_draft).collect();
        let title = title
            .or_else(|| set.title.clone())
            .unwrap_or_else(|| default_title(stories.len()));
        active.progress(20, "Writing host segments");

        let composer = &self.inner.adapters.composer;
        let stories_ref = &stories;
        let title_ref = title.as_str();
        let script = active
            .call("compose_podcast", move || {
                composer.compose_podcast(stories_ref, title_ref)
            })
            .await?;

        if !script.iter().any(|d| d.kind == SegmentKind::Story) {
            return Err(PipelineError::PermanentProvider(format!(
                "{} returned a script without stories",
                composer.name()
            )));
        }

        // Stories keep the ids they were generated with
        let mut story_ids = set.segments.iter().map(|s| s.id.clone());
        let segments = script
            .into_iter()
            .enumerate()
            .map(|(index, draft)| {
                let id = match draft.kind {
                    SegmentKind::Story => story_ids.next().unwrap_or_else(token),
                    _ => token(),
                };
                StorySegment::from_draft(id, index, draft)
            })
            .collect();

        Ok(Podcast {
            id: podcast_id.to_string(),
            title,
            segments,
            document_ids: set.document_ids,
            created_at: Utc::now(),
        })
    }

    /// Synthesize a composed podcast into one audio artifact; returns the audio id
    #[instrument(skip(self))]
    pub async fn generate_audio(
        &self,
        podcast_id: &str,
        voice_name: Option<String>,
        voice_style: Option<String>,
    ) -> Result<String> {
        let inner = &self.inner;
        let input = self.ensure_composed(podcast_id).await?;

        let mut metadata = Metadata::new();
        metadata.insert("podcast_id".to_string(), json!(podcast_id));
        if let Some(ref voice) = voice_name {
            metadata.insert("voice".to_string(), json!(voice));
        }
        if let Some(ref style) = voice_style {
            metadata.insert("style".to_string(), json!(style));
        }

        let record = inner
            .ids
            .allocate_record(ResourceType::Audio, metadata)
            .await?;
        let audio_id = record.id.clone();
        info!(%audio_id, "Generating audio");

        let mut active = inner
            .runner
            .begin(StageContext {
                stage: Stage::SynthesizeAudio,
                job_id: podcast_id.to_string(),
                inputs: vec![input],
                output: record.key(),
            })
            .await?;

        let outcome = self
            .audio_body(&mut active, &audio_id, podcast_id, voice_name, voice_style)
            .await;
        let (data, artifact) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return Err(active.fail(e).await),
        };

        let mut metadata = Metadata::new();
        metadata.insert("format".to_string(), json!(artifact.format));
        metadata.insert("size_bytes".to_string(), json!(artifact.size_bytes));
        metadata.insert("duration_ms".to_string(), json!(artifact.duration_ms));
        metadata.insert("segment_count".to_string(), json!(artifact.segments.len()));
        active
            .succeed(
                vec![
                    (DEFAULT_PART, data),
                    (MANIFEST_PART, serde_json::to_vec_pretty(&artifact)?),
                ],
                metadata,
            )
            .await?;

        Ok(audio_id)
    }

    /// Fail fast unless `podcast_id` has been composed.
    ///
    /// Before composition the id only names its segment set, so the podcast
    /// counts as a pending dependency.
    async fn ensure_composed(&self, podcast_id: &str) -> Result<ResourceKey> {
        let store = &self.inner.store;
        let input = ResourceKey::podcast(podcast_id);
        if !store.contains(&input).await?
            && store.contains(&ResourceKey::segments(podcast_id)).await?
        {
            return Err(PipelineError::DependencyNotReady {
                resource: input.to_string(),
                status: ResourceStatus::Pending,
            });
        }

        self.inner
            .runner
            .ensure_ready(std::slice::from_ref(&input))
            .await?;
        Ok(input)
    }

    async fn audio_body(
        &self,
        active: &mut ActiveStage<'_>,
        audio_id: &str,
        podcast_id: &str,
        voice_name: Option<String>,
        voice_style: Option<String>,
    ) -> Result<(Vec<u8>, AudioArtifact)> {
        let podcast = self.podcast(podcast_id).await?;
        if podcast.segments.is_empty() {
            return Err(PipelineError::Validation(format!(
                "podcast {} has no segments",
                podcast_id
            )));
        }

        self.synthesize_segments(
            active,
            audio_id,
            Some(podcast_id),
            &podcast.segments,
            voice_name,
            voice_style,
        )
        .await
    }

    /// Voice every segment and concatenate the results with their byte ranges
    async fn synthesize_segments(
        &self,
        active: &mut ActiveStage<'_>,
        audio_id: &str,
        podcast_id: Option<&str>,
        segments: &[StorySegment],
        voice_name: Option<String>,
        voice_style: Option<String>,
    ) -> Result<(Vec<u8>, AudioArtifact)> {
        let catalog = &self.inner.adapters.voices;
        let filter = VoiceFilter::default();
        let filter_ref = &filter;
        let voices = active
            .call("list_voices", move || catalog.list_voices(filter_ref))
            .await?;

        let override_voice = match voice_name {
            Some(ref name) => Some(find_voice(&voices, name).ok_or_else(|| {
                PipelineError::PermanentProvider(format!("unknown voice '{}'", name))
            })?),
            None => None,
        };
        if let (Some(voice), Some(style)) = (override_voice, voice_style.as_deref()) {
            if !voice.supports_style(style) {
                return Err(PipelineError::Validation(format!(
                    "voice {} does not support style '{}'",
                    voice.name, style
                )));
            }
        }

        let casting = &self.inner.settings.casting;
        let synthesizer = &self.inner.adapters.synthesizer;
        let total = segments.len();
        let mut data = Vec::new();
        let mut refs = Vec::with_capacity(total);
        let mut story_index = 0;

        for (i, segment) in segments.iter().enumerate() {
            let voice = match override_voice {
                Some(voice) => voice.name.clone(),
                None => casting.voice_for(segment.kind, story_index).to_string(),
            };
            if segment.kind == SegmentKind::Story {
                story_index += 1;
            }
            let style = pick_style(&voices, &voice, voice_style.as_deref());

            active.progress(
                (5 + 90 * i / total) as u8,
                &format!("Synthesizing segment {}/{}", i + 1, total),
            );

            let text = segment.content.as_str();
            let (voice_ref, style_ref) = (voice.as_str(), style.as_deref());
            let audio = active
                .call("synthesize", move || {
                    synthesizer.synthesize(text, voice_ref, style_ref)
                })
                .await?;

            let length = audio.data.len() as u64;
            refs.push(AudioSegmentRef {
                index: i,
                segment_id: segment.id.clone(),
                kind: segment.kind,
                voice_name: voice,
                voice_style: style,
                offset: data.len() as u64,
                length,
                duration_ms: audio.duration_ms.unwrap_or_else(|| estimate_duration_ms(length)),
            });
            data.extend_from_slice(&audio.data);
        }

        let artifact = AudioArtifact {
            id: audio_id.to_string(),
            podcast_id: podcast_id.map(str::to_string),
            voice_name,
            voice_style,
            format: AUDIO_FORMAT.to_string(),
            size_bytes: data.len() as u64,
            duration_ms: refs.iter().map(|r| r.duration_ms).sum(),
            segments: refs,
        };

        Ok((data, artifact))
    }

    /// Synthesize ad-hoc text into its own audio resource; returns the audio id.
    ///
    /// Runs the SynthesizeAudio stage with no podcast input, so a voice and
    /// style can be auditioned before voicing a whole podcast.
    #[instrument(skip(self, text), fields(chars = text.len()))]
    pub async fn preview_audio(
        &self,
        text: &str,
        voice_name: Option<String>,
        voice_style: Option<String>,
    ) -> Result<String> {
        let inner = &self.inner;
        if text.trim().is_empty() {
            return Err(PipelineError::Validation(
                "preview text must not be empty".to_string(),
            ));
        }

        let mut metadata = Metadata::new();
        metadata.insert("preview".to_string(), json!(true));
        if let Some(ref voice) = voice_name {
            metadata.insert("voice".to_string(), json!(voice));
        }
        if let Some(ref style) = voice_style {
            metadata.insert("style".to_string(), json!(style));
        }

        let record = inner
            .ids
            .allocate_record(ResourceType::Audio, metadata)
            .await?;
        let audio_id = record.id.clone();

        let mut active = inner
            .runner
            .begin(StageContext {
                stage: Stage::SynthesizeAudio,
                job_id: audio_id.clone(),
                inputs: Vec::new(),
                output: record.key(),
            })
            .await?;

        let segment = StorySegment::from_draft(
            token(),
            0,
            SegmentDraft::story("Preview", text, Vec::new()),
        );
        let outcome = self
            .synthesize_segments(
                &mut active,
                &audio_id,
                None,
                std::slice::from_ref(&segment),
                voice_name,
                voice_style,
            )
            .await;
        let (data, artifact) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => return Err(active.fail(e).await),
        };

        let mut metadata = Metadata::new();
        metadata.insert("format".to_string(), json!(artifact.format));
        metadata.insert("size_bytes".to_string(), json!(artifact.size_bytes));
        metadata.insert("duration_ms".to_string(), json!(artifact.duration_ms));
        active
            .succeed(
                vec![
                    (DEFAULT_PART, data),
                    (MANIFEST_PART, serde_json::to_vec_pretty(&artifact)?),
                ],
                metadata,
            )
            .await?;

        Ok(audio_id)
    }

    /// One voice of the catalogue, matched case-insensitively
    pub async fn voice(&self, name: &str) -> Result<VoiceProfile> {
        let voices = self.list_voices(None, None).await?;
        find_voice(&voices, name)
            .cloned()
            .ok_or_else(|| PipelineError::not_found(format!("voices://{}", name)))
    }

    /// Voices offered by the catalogue, optionally filtered
    pub async fn list_voices(
        &self,
        gender: Option<String>,
        locale: Option<String>,
    ) -> Result<Vec<VoiceProfile>> {
        let filter = VoiceFilter { gender, locale };
        Ok(self.inner.adapters.voices.list_voices(&filter).await?)
    }

    /// A document with its extracted text (when extraction succeeded)
    pub async fn document(&self, document_id: &str) -> Result<Document> {
        let key = ResourceKey::document(document_id);
        let record = self.inner.store.record(&key).await?;
        let text = if record.parts.contains_key(TEXT_PART) {
            let bytes = self.inner.store.get_part(&key, TEXT_PART).await?;
            Some(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            None
        };
        Ok(Document::from_record(&record, text))
    }

    /// Story segments generated for a podcast id
    pub async fn segments(&self, podcast_id: &str) -> Result<SegmentSet> {
        let (bytes, _) = self.inner.store.get(&ResourceKey::segments(podcast_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// A composed podcast
    pub async fn podcast(&self, podcast_id: &str) -> Result<Podcast> {
        let (bytes, _) = self.inner.store.get(&ResourceKey::podcast(podcast_id)).await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Manifest of a synthesized audio artifact
    pub async fn audio(&self, audio_id: &str) -> Result<AudioArtifact> {
        let bytes = self
            .inner
            .store
            .get_part(&ResourceKey::audio(audio_id), MANIFEST_PART)
            .await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn record(&self, key: &ResourceKey) -> Result<ResourceRecord> {
        self.inner.store.record(key).await
    }

    pub async fn list(&self, resource_type: ResourceType) -> Result<Vec<ResourceRecord>> {
        self.inner.store.records(resource_type).await
    }

    /// Resolve a `{type}://{id}[/{sub}]` address to bytes and a MIME type
    pub async fn read(&self, uri: &str) -> Result<(Vec<u8>, String)> {
        let uri: ResourceUri = uri.parse()?;
        let store = &self.inner.store;
        let unknown = || PipelineError::not_found(uri.to_string());
        let json_mime = || "application/json".to_string();

        let key = match uri.scheme {
            UriScheme::Document => ResourceKey::document(&uri.id),
            UriScheme::Podcast => ResourceKey::podcast(&uri.id),
            UriScheme::Audio => ResourceKey::audio(&uri.id),
            UriScheme::Voices => {
                if uri.sub_resource.is_some() {
                    return Err(unknown());
                }
                let body = if uri.id == "list" {
                    serde_json::to_vec_pretty(&self.list_voices(None, None).await?)?
                } else {
                    serde_json::to_vec_pretty(&self.voice(&uri.id).await?)?
                };
                return Ok((body, json_mime()));
            }
        };

        match (uri.scheme, uri.sub_resource.as_deref()) {
            (_, Some("metadata")) => {
                // Before composition a podcast id only names its segment set
                let mut key = key;
                if uri.scheme == UriScheme::Podcast && !store.contains(&key).await? {
                    key = ResourceKey::segments(&uri.id);
                }
                let record = store.record(&key).await?;
                Ok((serde_json::to_vec_pretty(&record)?, json_mime()))
            }
            (UriScheme::Document, None) => {
                let (bytes, record) = store.get(&key).await?;
                let mime = record
                    .meta_str("content_type")
                    .unwrap_or("application/octet-stream")
                    .to_string();
                Ok((bytes, mime))
            }
            (UriScheme::Document, Some("text")) => Ok((
                store.get_part(&key, TEXT_PART).await?,
                "text/plain".to_string(),
            )),
            (UriScheme::Podcast, None) => Ok((store.get(&key).await?.0, json_mime())),
            (UriScheme::Podcast, Some("segments")) => Ok((
                store.get(&ResourceKey::segments(&uri.id)).await?.0,
                json_mime(),
            )),
            (UriScheme::Podcast, Some("script")) => Ok((
                store.get_part(&key, SCRIPT_PART).await?,
                "text/plain".to_string(),
            )),
            (UriScheme::Audio, None) => Ok((store.get(&key).await?.0, "audio/mpeg".to_string())),
            (UriScheme::Audio, Some("manifest")) => {
                Ok((store.get_part(&key, MANIFEST_PART).await?, json_mime()))
            }
            (UriScheme::Audio, Some(sub)) => {
                let index: usize = sub
                    .strip_prefix("segment/")
                    .and_then(|n| n.parse().ok())
                    .ok_or_else(unknown)?;
                let artifact = self.audio(&uri.id).await?;
                let segment = artifact.segment(index).ok_or_else(unknown)?;
                let (bytes, _) = store.get(&key).await?;
                let start = segment.offset as usize;
                let end = start + segment.length as usize;
                let slice = bytes.get(start..end).ok_or_else(|| {
                    PipelineError::Validation(format!(
                        "segment {} lies outside the audio payload",
                        index
                    ))
                })?;
                Ok((slice.to_vec(), "audio/mpeg".to_string()))
            }
            _ => Err(unknown()),
        }
    }

    /// Stop scheduling further stages for a job (document or podcast id)
    pub async fn cancel(&self, job_id: &str) -> bool {
        self.inner.runner.cancel(job_id).await
    }

    pub async fn is_cancelled(&self, job_id: &str) -> bool {
        self.inner.runner.is_cancelled(job_id).await
    }

    /// Stage events journaled for a job
    pub async fn history(&self, job_id: &str) -> Result<Vec<StageEvent>> {
        self.inner.runner.journal().replay(job_id).await
    }
}

fn find_voice<'a>(voices: &'a [VoiceProfile], name: &str) -> Option<&'a VoiceProfile> {
    voices.iter().find(|v| v.name.eq_ignore_ascii_case(name))
}

/// Style for one segment: the requested one where the voice supports it,
/// else the voice's default style
fn pick_style(voices: &[VoiceProfile], voice: &str, requested: Option<&str>) -> Option<String> {
    let profile = find_voice(voices, voice);
    let supported = |style: &str| profile.map_or(true, |p| p.supports_style(style));

    requested
        .filter(|s| supported(s))
        .or_else(|| default_style_for(voice).filter(|s| supported(s)))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::builtin_voices;

    #[test]
    fn test_pick_style_prefers_supported_request() {
        let voices = builtin_voices();

        assert_eq!(
            pick_style(&voices, "en-US-GuyNeural", Some("calm")).as_deref(),
            Some("calm")
        );
        // Jenny has no newscast style; her default applies
        assert_eq!(
            pick_style(&voices, "en-US-JennyNeural", Some("newscast")).as_deref(),
            Some("cheerful")
        );
        assert_eq!(pick_style(&voices, "en-GB-Unknown", None), None);
    }

    #[test]
    fn test_find_voice_ignores_case() {
        let voices = builtin_voices();
        assert!(find_voice(&voices, "en-us-guyneural").is_some());
        assert!(find_voice(&voices, "does-not-exist").is_none());
    }
}

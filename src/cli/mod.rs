//! Command-line interface for castwright.
//!
//! Provides commands for uploading documents, generating, composing and
//! voicing podcasts, reading stored resources and inspecting job journals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use tokio::task::JoinHandle;

use crate::adapters::{
    AzureSpeechAdapter, FabricAdapter, PlainTextExtractor, PodcastComposer, StaticVoiceCatalog,
    TemplateComposer, VoiceCatalog,
};
use crate::config::{self, ComposerKind, ResolvedConfig};
use crate::core::{
    spawn_forwarder, Adapters, Orchestrator, OrchestratorSettings, ProgressEvent, ProgressHub,
    ProgressSink,
};
use crate::domain::{ResourceRecord, ResourceType};
use crate::error::PipelineError;

/// castwright - Turn documents into multi-voice podcasts
#[derive(Parser, Debug)]
#[command(name = "castwright")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload documents and extract their text (in parallel)
    Upload {
        /// Text or markdown files
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Generate story segments from extracted documents
    Generate {
        /// Document ids
        #[arg(required = true)]
        document_ids: Vec<String>,

        /// Podcast title
        #[arg(short, long)]
        title: Option<String>,

        /// Target length in minutes
        #[arg(short, long)]
        length: Option<u32>,
    },

    /// Compose generated segments into a script with host segments
    Compose {
        podcast_id: String,

        /// Podcast title (overrides the one given at generation)
        #[arg(short, long)]
        title: Option<String>,
    },

    /// Synthesize a composed podcast to audio
    Audio {
        podcast_id: String,

        /// Read every segment with this voice
        #[arg(short, long)]
        voice: Option<String>,

        /// Speaking style (must be supported by the voice)
        #[arg(short, long)]
        style: Option<String>,

        /// Write the audio to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run the whole workflow: upload, generate, compose, audio
    Run {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(short, long)]
        title: Option<String>,

        #[arg(short, long)]
        length: Option<u32>,

        #[arg(short, long)]
        voice: Option<String>,

        #[arg(short, long)]
        style: Option<String>,

        /// Write the audio to this file
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Stop after composing the script
        #[arg(long)]
        no_audio: bool,
    },

    /// Synthesize a short text to audition a voice and style
    Preview {
        text: String,

        #[arg(short, long)]
        voice: Option<String>,

        #[arg(short, long)]
        style: Option<String>,

        /// Write the audio to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show one voice and the styles it supports
    Voice { name: String },

    /// List available voices
    Voices {
        /// Filter by gender (e.g. Female)
        #[arg(short, long)]
        gender: Option<String>,

        /// Filter by locale (e.g. en-US)
        #[arg(short, long)]
        locale: Option<String>,
    },

    /// Read a resource by URI (e.g. podcast://<id>/script)
    Show {
        uri: String,

        /// Write the payload to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List resources of one type (document, segments, podcast, audio)
    List { resource_type: ResourceType },

    /// Show the stage journal of a job (document or podcast id)
    History { job_id: String },

    /// Cancel a job so none of its remaining stages run
    Cancel { job_id: String },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let result = match self.command {
            Commands::Config => show_config(),
            command => {
                let session = Session::open().await?;
                let result = run_command(&session.orchestrator, command).await;
                session.close().await;
                result
            }
        };

        if let Err(ref e) = result {
            if let Some(err) = e.downcast_ref::<PipelineError>() {
                eprintln!("{}", serde_json::to_string_pretty(&err.to_envelope())?);
                std::process::exit(1);
            }
        }
        result
    }
}

/// Prints progress lines to stderr
struct StderrProgress;

#[async_trait]
impl ProgressSink for StderrProgress {
    async fn deliver(&self, event: &ProgressEvent) -> Result<()> {
        match event.eta_seconds {
            Some(eta) if !event.is_final() => eprintln!(
                "[{:>3}%] {} - {} (~{}s left)",
                event.percentage, event.job_id, event.status, eta
            ),
            _ => eprintln!("[{:>3}%] {} - {}", event.percentage, event.job_id, event.status),
        }
        Ok(())
    }
}

/// An orchestrator plus the task forwarding its progress
struct Session {
    orchestrator: Orchestrator,
    forwarder: JoinHandle<()>,
}

impl Session {
    async fn open() -> Result<Self> {
        let cfg = config::config()?;
        let (progress, receiver) = ProgressHub::channel(cfg.progress.min_interval());
        let forwarder = spawn_forwarder(receiver, StderrProgress);

        let orchestrator = Orchestrator::open(
            cfg.store_dir(),
            build_adapters(cfg),
            OrchestratorSettings::from(cfg),
            progress,
        )
        .await
        .with_context(|| format!("Failed to open store at {}", cfg.store_dir().display()))?;

        Ok(Self {
            orchestrator,
            forwarder,
        })
    }

    /// Drop the hub and wait for queued progress to be printed
    async fn close(self) {
        drop(self.orchestrator);
        let _ = self.forwarder.await;
    }
}

/// Wire concrete adapters from configuration
fn build_adapters(cfg: &ResolvedConfig) -> Adapters {
    let fabric = match cfg.fabric.binary {
        Some(ref binary) => FabricAdapter::with_binary_path(binary),
        None => FabricAdapter::new(),
    }
    .with_patterns(&cfg.fabric.segments_pattern, &cfg.fabric.host_pattern)
    .with_transitions(cfg.podcast.show_transitions);

    let composer: Arc<dyn PodcastComposer> = match cfg.podcast.composer {
        ComposerKind::Fabric => Arc::new(fabric.clone()),
        ComposerKind::Template => Arc::new(TemplateComposer::new(cfg.podcast.show_transitions)),
    };

    let speech = Arc::new(
        AzureSpeechAdapter::new(
            cfg.speech.region.clone().unwrap_or_default(),
            cfg.speech.key.clone().unwrap_or_default(),
        )
        .with_output_format(&cfg.speech.output_format),
    );

    // Without credentials the built-in catalogue still answers `voices`
    let voices: Arc<dyn VoiceCatalog> = if cfg.speech.key.is_some() {
        speech.clone()
    } else {
        Arc::new(StaticVoiceCatalog::default())
    };

    Adapters {
        extractor: Arc::new(PlainTextExtractor::new()),
        generator: Arc::new(fabric),
        composer,
        synthesizer: speech,
        voices,
    }
}

async fn run_command(orchestrator: &Orchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::Upload { files } => {
            upload(orchestrator, &files).await?;
            Ok(())
        }
        Commands::Generate {
            document_ids,
            title,
            length,
        } => {
            let podcast_id = orchestrator
                .generate_podcast(&document_ids, title, length)
                .await?;
            println!("podcast://{}/segments", podcast_id);
            Ok(())
        }
        Commands::Compose { podcast_id, title } => {
            orchestrator.compose_podcast(&podcast_id, title).await?;
            println!("podcast://{}/script", podcast_id);
            Ok(())
        }
        Commands::Audio {
            podcast_id,
            voice,
            style,
            output,
        } => generate_audio(orchestrator, &podcast_id, voice, style, output).await,
        Commands::Run {
            files,
            title,
            length,
            voice,
            style,
            output,
            no_audio,
        } => {
            let document_ids = upload(orchestrator, &files).await?;
            let podcast_id = orchestrator
                .generate_podcast(&document_ids, title, length)
                .await?;
            orchestrator.compose_podcast(&podcast_id, None).await?;
            println!("podcast://{}/script", podcast_id);

            if no_audio {
                return Ok(());
            }
            generate_audio(orchestrator, &podcast_id, voice, style, output).await
        }
        Commands::Preview {
            text,
            voice,
            style,
            output,
        } => {
            let audio_id = orchestrator.preview_audio(&text, voice, style).await?;
            save_audio(orchestrator, &audio_id, output).await
        }
        Commands::Voice { name } => {
            let voice = orchestrator.voice(&name).await?;
            println!("{}", serde_json::to_string_pretty(&voice)?);
            Ok(())
        }
        Commands::Voices { gender, locale } => list_voices(orchestrator, gender, locale).await,
        Commands::Show { uri, output } => show(orchestrator, &uri, output).await,
        Commands::List { resource_type } => list(orchestrator, resource_type).await,
        Commands::History { job_id } => history(orchestrator, &job_id).await,
        Commands::Cancel { job_id } => {
            if orchestrator.cancel(&job_id).await {
                println!("Cancelled job {}", job_id);
            } else {
                println!("Job {} was already cancelled", job_id);
            }
            Ok(())
        }
        Commands::Config => show_config(),
    }
}

/// Upload files concurrently; fails with the first error after reporting all
async fn upload(orchestrator: &Orchestrator, files: &[PathBuf]) -> Result<Vec<String>> {
    let mut documents = Vec::with_capacity(files.len());
    for path in files {
        let content = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        documents.push((file_name(path), content));
    }

    let results = orchestrator.upload_documents(documents).await;
    let mut ids = Vec::with_capacity(results.len());
    let mut first_error = None;

    for (path, result) in files.iter().zip(results) {
        match result {
            Ok(id) => {
                println!("document://{}\t{}", id, path.display());
                ids.push(id);
            }
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e.into()),
        None => Ok(ids),
    }
}

async fn generate_audio(
    orchestrator: &Orchestrator,
    podcast_id: &str,
    voice: Option<String>,
    style: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let audio_id = orchestrator.generate_audio(podcast_id, voice, style).await?;
    save_audio(orchestrator, &audio_id, output).await
}

/// Print the audio URI and optionally write its bytes to `output`
async fn save_audio(
    orchestrator: &Orchestrator,
    audio_id: &str,
    output: Option<PathBuf>,
) -> Result<()> {
    println!("audio://{}", audio_id);

    if let Some(path) = output {
        let (bytes, _) = orchestrator.read(&format!("audio://{}", audio_id)).await?;
        write_output(&path, &bytes).await?;
    }
    Ok(())
}

async fn list_voices(
    orchestrator: &Orchestrator,
    gender: Option<String>,
    locale: Option<String>,
) -> Result<()> {
    let voices = orchestrator.list_voices(gender, locale).await?;
    if voices.is_empty() {
        println!("No voices found");
        return Ok(());
    }

    println!("{:<32} {:<8} {:<8} STYLES", "NAME", "GENDER", "LOCALE");
    println!("{}", "-".repeat(80));
    for voice in voices {
        println!(
            "{:<32} {:<8} {:<8} {}",
            voice.name,
            voice.gender,
            voice.locale,
            voice.styles.join(", ")
        );
    }
    Ok(())
}

async fn show(orchestrator: &Orchestrator, uri: &str, output: Option<PathBuf>) -> Result<()> {
    let (bytes, mime) = orchestrator.read(uri).await?;

    if let Some(path) = output {
        return write_output(&path, &bytes).await;
    }

    let printable = mime.starts_with("text/") || mime == "application/json";
    match String::from_utf8(bytes) {
        Ok(text) if printable => println!("{}", text),
        Ok(text) => eprintln!("{} bytes of {}; use --output to save", text.len(), mime),
        Err(e) => eprintln!("{} bytes of {}; use --output to save", e.as_bytes().len(), mime),
    }
    Ok(())
}

async fn list(orchestrator: &Orchestrator, resource_type: ResourceType) -> Result<()> {
    let records = orchestrator.list(resource_type).await?;
    if records.is_empty() {
        println!("No {} resources found", resource_type);
        return Ok(());
    }

    println!("{:<34} {:<10} {:<20} DETAIL", "ID", "STATUS", "CREATED");
    println!("{}", "-".repeat(90));
    for record in records {
        println!(
            "{:<34} {:<10} {:<20} {}",
            record.id,
            record.status,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            detail(&record)
        );
    }
    Ok(())
}

/// Short description for listings: the failure, else a name or title
fn detail(record: &ResourceRecord) -> String {
    if let Some(ref err) = record.last_error {
        return format!("{}: {}", err.code, err.message);
    }
    record
        .meta_str("name")
        .or_else(|| record.meta_str("title"))
        .or_else(|| record.meta_str("podcast_id"))
        .unwrap_or_default()
        .to_string()
}

async fn history(orchestrator: &Orchestrator, job_id: &str) -> Result<()> {
    let events = orchestrator.history(job_id).await?;
    if events.is_empty() {
        println!("No events for job {}", job_id);
        return Ok(());
    }

    for event in events {
        let mut line = format!(
            "{} {:<18} {:<18} #{} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.stage,
            serde_json::to_value(event.event_type)?
                .as_str()
                .unwrap_or_default(),
            event.attempt,
            event.summary
        );
        if let Some(error) = event.error {
            line.push_str(&format!(" ({})", error));
        }
        println!("{}", line);
    }
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Castwright configuration");
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Store:       {}", cfg.store_dir().display());
    println!(
        "Speech key:  {}",
        if cfg.speech.key.is_some() { "set" } else { "not set" }
    );
    println!();
    print!("{}", serde_yaml::to_string(cfg).context("Failed to render configuration")?);

    Ok(())
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    eprintln!("Wrote {} bytes to {}", bytes.len(), path.display());
    Ok(())
}

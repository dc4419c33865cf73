//! castwright - Turn documents into multi-voice podcasts
//!
//! A staged pipeline that extracts text from uploaded documents, generates
//! story segments, composes them into a hosted script and synthesizes the
//! script to audio.
//!
//! # Architecture
//!
//! Every intermediate and final output is a resource addressed by
//! `(type, id)`:
//! - Records and payloads live in a store whose per-type index is
//!   committed atomically (write, fsync, rename)
//! - Stages move records through `pending -> running -> succeeded | failed`
//!   and never start before their inputs have succeeded
//! - Failures stay on the record; earlier stages are never rolled back
//!
//! # Modules
//!
//! - `adapters`: Capability adapters (text extraction, fabric, Azure Speech)
//! - `core`: Store, id allocation, progress, stage runner, orchestrator
//! - `domain`: Data structures (records, documents, podcasts, audio)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Whole workflow
//! castwright run notes.md report.md --title "Weekly digest" --output digest.mp3
//!
//! # Inspect what was produced
//! castwright show podcast://<id>/script
//! castwright history <podcast-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod error;

// Re-export main types at crate root for convenience
pub use core::{Adapters, Orchestrator, OrchestratorSettings, ResourceStore};
pub use domain::{
    AudioArtifact, Document, Podcast, ResourceKey, ResourceRecord, ResourceStatus, ResourceType,
    ResourceUri,
};
pub use error::{ErrorEnvelope, PipelineError};

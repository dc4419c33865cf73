//! Core pipeline machinery.
//!
//! This module contains:
//! - ResourceStore: Durable records and payloads behind an atomically committed index
//! - IdAllocator: Collision-free ids per resource type
//! - StageRunner: Dependency checks, retries and status transitions
//! - ProgressHub: Coalesced per-job progress events
//! - Journal: Append-only stage events per job
//! - Safety: Upload and request limits
//! - Orchestrator: The document -> podcast -> audio workflow

pub mod identity;
pub mod journal;
pub mod orchestrator;
pub mod progress;
pub mod resource_store;
pub mod retry;
pub mod safety;
pub mod stage;

// Re-export commonly used types
pub use identity::IdAllocator;
pub use journal::Journal;
pub use orchestrator::{Adapters, Orchestrator, OrchestratorSettings};
pub use progress::{spawn_forwarder, ProgressEnvelope, ProgressEvent, ProgressHub, ProgressSink};
pub use resource_store::ResourceStore;
pub use retry::RetryPolicy;
pub use safety::{SafetyLimits, SafetyViolation};
pub use stage::{ActiveStage, Stage, StageContext, StageRunner};

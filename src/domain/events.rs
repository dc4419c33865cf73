//! Stage events recorded in a job's append-only journal.
//!
//! The journal is an audit trail; resource state itself lives in the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::stage::Stage;

/// A single entry in a job journal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The job this event belongs to (document or podcast id)
    pub job_id: String,

    pub stage: Stage,

    /// Output resource of the stage, as `type://id`
    pub resource: String,

    pub event_type: StageEventType,

    /// Attempt number for the adapter call (1-based, 0 if none was made)
    pub attempt: u32,

    /// Human-readable summary
    pub summary: String,

    /// Time taken in milliseconds (for finished stages)
    pub duration_ms: Option<u64>,

    /// Error message if failed or retrying
    pub error: Option<String>,
}

impl StageEvent {
    pub fn new(
        job_id: impl Into<String>,
        stage: Stage,
        resource: impl Into<String>,
        event_type: StageEventType,
        attempt: u32,
        summary: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            job_id: job_id.into(),
            stage,
            resource: resource.into(),
            event_type,
            attempt,
            summary: summary.into(),
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Types of stage events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageEventType {
    /// The stage's inputs were ready and it began running
    StageStarted,

    /// An adapter call failed transiently and will be retried
    StageRetrying,

    /// The stage's output was committed
    StageCompleted,

    /// The stage failed terminally
    StageFailed,

    /// The job was cancelled before the stage could run
    StageCancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = StageEvent::new(
            "p1",
            Stage::Compose,
            "podcast://p1",
            StageEventType::StageRetrying,
            2,
            "Compose attempt 2 failed",
        )
        .with_error("503 Service Unavailable");

        let json = serde_json::to_string(&event).unwrap();
        let parsed: StageEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_type, StageEventType::StageRetrying);
        assert_eq!(parsed.stage, Stage::Compose);
        assert_eq!(parsed.attempt, 2);
        assert_eq!(parsed.error.as_deref(), Some("503 Service Unavailable"));
    }

    #[test]
    fn test_event_with_duration() {
        let event = StageEvent::new(
            "d1",
            Stage::Extract,
            "document://d1",
            StageEventType::StageCompleted,
            1,
            "done",
        )
        .with_duration(1500);

        assert_eq!(event.duration_ms, Some(1500));
    }
}

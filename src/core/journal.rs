//! Append-only stage journal with file-based persistence.
//!
//! Each job (a document id or a podcast id) gets its own
//! `jobs/<job>/events.jsonl`. The journal is an audit trail only; resource
//! state is always read back from the store.

use std::path::{Path, PathBuf};

use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

use crate::domain::{StageEvent, StageEventType};
use crate::error::{PipelineError, Result};

/// File-based journal of stage events, one JSONL file per job
#[derive(Debug, Clone)]
pub struct Journal {
    /// Directory containing one subdirectory per job
    jobs_dir: PathBuf,
}

impl Journal {
    pub fn new(jobs_dir: impl Into<PathBuf>) -> Self {
        Self {
            jobs_dir: jobs_dir.into(),
        }
    }

    pub fn jobs_dir(&self) -> &Path {
        &self.jobs_dir
    }

    /// Path to a job's events file
    pub fn events_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id).join("events.jsonl")
    }

    /// Append an event to its job's log
    pub async fn append(&self, event: &StageEvent) -> Result<()> {
        let path = self.events_path(&event.job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;

        Ok(())
    }

    /// Append, logging instead of failing.
    ///
    /// Used by the stage runner so a journal hiccup never fails a stage.
    pub async fn record(&self, event: StageEvent) {
        if let Err(e) = self.append(&event).await {
            warn!(job_id = %event.job_id, error = %e, "Failed to append stage event");
        }
    }

    /// Replay all events of a job in order
    pub async fn replay(&self, job_id: &str) -> Result<Vec<StageEvent>> {
        let path = self.events_path(job_id);
        if !fs::try_exists(&path).await? {
            return Ok(Vec::new());
        }

        let file = File::open(&path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: StageEvent = serde_json::from_str(&line).map_err(|e| {
                PipelineError::Validation(format!("corrupt journal line for {}: {}", job_id, e))
            })?;
            events.push(event);
        }

        Ok(events)
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(
        &self,
        job_id: &str,
        event_type: StageEventType,
    ) -> Result<Option<StageEvent>> {
        let events = self.replay(job_id).await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Path to a job's cancellation marker
    fn cancelled_path(&self, job_id: &str) -> PathBuf {
        self.jobs_dir.join(job_id).join("cancelled")
    }

    /// Persist that `job_id` is cancelled so the cancellation outlives the process
    pub async fn mark_cancelled(&self, job_id: &str) -> Result<()> {
        let path = self.cancelled_path(job_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&path, chrono::Utc::now().to_rfc3339()).await?;
        Ok(())
    }

    pub async fn is_marked_cancelled(&self, job_id: &str) -> Result<bool> {
        Ok(fs::try_exists(self.cancelled_path(job_id)).await?)
    }

    /// List all job ids with a journal
    pub async fn list_jobs(&self) -> Result<Vec<String>> {
        if !fs::try_exists(&self.jobs_dir).await? {
            return Ok(Vec::new());
        }

        let mut jobs = Vec::new();
        let mut entries = fs::read_dir(&self.jobs_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    jobs.push(name.to_string());
                }
            }
        }
        jobs.sort();

        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stage::Stage;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_replay() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path());

        let started = StageEvent::new(
            "p1",
            Stage::Compose,
            "podcast://p1",
            StageEventType::StageStarted,
            0,
            "started",
        );
        let completed = StageEvent::new(
            "p1",
            Stage::Compose,
            "podcast://p1",
            StageEventType::StageCompleted,
            1,
            "done",
        )
        .with_duration(12);

        journal.append(&started).await.unwrap();
        journal.append(&completed).await.unwrap();

        let events = journal.replay("p1").await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, StageEventType::StageStarted);
        assert_eq!(events[1].duration_ms, Some(12));

        let last = journal
            .last_event_of_type("p1", StageEventType::StageCompleted)
            .await
            .unwrap();
        assert!(last.is_some());

        assert_eq!(journal.list_jobs().await.unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_cancellation_marker_persists() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path().join("jobs"));

        assert!(!journal.is_marked_cancelled("p1").await.unwrap());
        journal.mark_cancelled("p1").await.unwrap();

        let reopened = Journal::new(temp.path().join("jobs"));
        assert!(reopened.is_marked_cancelled("p1").await.unwrap());
        assert!(!reopened.is_marked_cancelled("p2").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_job_replays_empty() {
        let temp = TempDir::new().unwrap();
        let journal = Journal::new(temp.path().join("jobs"));

        assert!(journal.replay("nope").await.unwrap().is_empty());
        assert!(journal.list_jobs().await.unwrap().is_empty());
    }
}

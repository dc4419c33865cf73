//! Per-job progress events, decoupled from whoever forwards them.
//!
//! ```text
//! Stage runner              ProgressHub                 forwarder task
//!    │ report(job, 40%)          │                            │
//!    ├──────────────────────────►│ clamp, coalesce            │
//!    │                           ├── ProgressEvent ──────────►│ sink.deliver()
//!    │ finish(job)               │                            │
//!    ├──────────────────────────►│ exactly one 100% event     │
//!    │                           ├───────────────────────────►│
//! ```
//!
//! Reporting never blocks and never fails the caller: events go onto an
//! unbounded channel and delivery errors are only logged.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Minimum change in percentage that is always forwarded
pub const MIN_PERCENT_STEP: u8 = 5;

/// One forwarded progress update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    pub percentage: u8,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn is_final(&self) -> bool {
        self.percentage >= 100
    }

    /// `{progress: {percentage, status, eta_seconds?}}`
    pub fn envelope(&self) -> ProgressEnvelope {
        ProgressEnvelope {
            progress: ProgressBody {
                percentage: self.percentage,
                status: self.status.clone(),
                eta_seconds: self.eta_seconds,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEnvelope {
    pub progress: ProgressBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressBody {
    pub percentage: u8,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
}

/// Coalescing state of one job's stream
#[derive(Debug)]
struct JobState {
    started: Instant,
    percentage: u8,
    last_sent: Option<(u8, Instant)>,
}

/// Publishes progress for any number of jobs onto one channel
#[derive(Clone)]
pub struct ProgressHub {
    sender: mpsc::UnboundedSender<ProgressEvent>,
    jobs: Arc<Mutex<HashMap<String, JobState>>>,
    min_interval: Duration,
}

impl ProgressHub {
    /// Create a hub and the receiving end of its event stream
    pub fn channel(min_interval: Duration) -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let hub = Self {
            sender,
            jobs: Arc::new(Mutex::new(HashMap::new())),
            min_interval,
        };
        (hub, receiver)
    }

    /// A hub whose events go nowhere
    pub fn disabled() -> Self {
        Self::channel(Duration::ZERO).0
    }

    /// Report progress for `job_id`.
    ///
    /// Percentages never go backwards for a job; a lower value is clamped to
    /// the highest seen. Reaching 100 finishes the job.
    pub fn report(&self, job_id: &str, percentage: u8, status: &str) {
        if percentage >= 100 {
            self.finish(job_id, status);
            return;
        }

        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let state = jobs.entry(job_id.to_string()).or_insert_with(|| JobState {
            started: now,
            percentage: 0,
            last_sent: None,
        });

        state.percentage = state.percentage.max(percentage);
        let current = state.percentage;

        let forward = match state.last_sent {
            None => true,
            Some((sent_pct, sent_at)) => {
                current.saturating_sub(sent_pct) >= MIN_PERCENT_STEP
                    || now.duration_since(sent_at) >= self.min_interval
            }
        };

        if !forward {
            return;
        }

        state.last_sent = Some((current, now));
        let eta_seconds = estimate_eta(now.duration_since(state.started), current);
        self.send(ProgressEvent {
            job_id: job_id.to_string(),
            percentage: current,
            status: status.to_string(),
            eta_seconds,
            timestamp: Utc::now(),
        });
    }

    /// Emit the single final 100% event for `job_id` and forget the job
    pub fn finish(&self, job_id: &str, status: &str) {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.remove(job_id);

        // Sent while holding the lock so it cannot overtake an earlier event
        self.send(ProgressEvent {
            job_id: job_id.to_string(),
            percentage: 100,
            status: status.to_string(),
            eta_seconds: Some(0),
            timestamp: Utc::now(),
        });
    }

    fn send(&self, event: ProgressEvent) {
        debug!(job_id = %event.job_id, percentage = event.percentage, status = %event.status, "Progress");
        if self.sender.send(event).is_err() {
            debug!("Progress receiver dropped, event discarded");
        }
    }
}

/// Remaining time, extrapolated linearly from elapsed time
fn estimate_eta(elapsed: Duration, percentage: u8) -> Option<u64> {
    if percentage == 0 {
        return None;
    }
    let remaining = elapsed.as_secs_f64() * f64::from(100 - percentage) / f64::from(percentage);
    Some(remaining.round() as u64)
}

/// Downstream consumer of progress events (a transport, a terminal, ...)
#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn deliver(&self, event: &ProgressEvent) -> anyhow::Result<()>;
}

/// Forward every event from `receiver` to `sink` until the hub is dropped.
///
/// Delivery failures are logged and swallowed.
pub fn spawn_forwarder<S>(mut receiver: mpsc::UnboundedReceiver<ProgressEvent>, sink: S) -> JoinHandle<()>
where
    S: ProgressSink + 'static,
{
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            if let Err(e) = sink.deliver(&event).await {
                warn!(job_id = %event.job_id, error = %e, "Progress delivery failed");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_percentages_never_decrease() {
        let (hub, mut rx) = ProgressHub::channel(Duration::ZERO);

        hub.report("job", 10, "a");
        hub.report("job", 50, "b");
        hub.report("job", 30, "c");
        hub.finish("job", "done");

        let pcts: Vec<u8> = drain(&mut rx).iter().map(|e| e.percentage).collect();
        assert_eq!(pcts, vec![10, 50, 50, 100]);
    }

    #[test]
    fn test_small_steps_are_coalesced() {
        let (hub, mut rx) = ProgressHub::channel(Duration::from_secs(3600));

        hub.report("job", 0, "start");
        hub.report("job", 1, "tick");
        hub.report("job", 2, "tick");
        hub.report("job", 7, "jump");
        hub.finish("job", "done");

        let pcts: Vec<u8> = drain(&mut rx).iter().map(|e| e.percentage).collect();
        assert_eq!(pcts, vec![0, 7, 100]);
    }

    #[test]
    fn test_report_of_100_finishes_once() {
        let (hub, mut rx) = ProgressHub::channel(Duration::ZERO);

        hub.report("job", 40, "half");
        hub.report("job", 100, "done");

        let events = drain(&mut rx);
        assert_eq!(events.iter().filter(|e| e.is_final()).count(), 1);
        assert_eq!(events.last().unwrap().status, "done");
    }

    #[test]
    fn test_dropped_receiver_does_not_fail_reporter() {
        let (hub, rx) = ProgressHub::channel(Duration::ZERO);
        drop(rx);

        hub.report("job", 10, "still fine");
        hub.finish("job", "done");
    }

    #[test]
    fn test_eta_estimate() {
        assert_eq!(estimate_eta(Duration::from_secs(10), 0), None);
        assert_eq!(estimate_eta(Duration::from_secs(10), 50), Some(10));
        assert_eq!(estimate_eta(Duration::from_secs(30), 75), Some(10));
    }

    #[test]
    fn test_envelope_shape() {
        let event = ProgressEvent {
            job_id: "podcast://p1".to_string(),
            percentage: 40,
            status: "Composing".to_string(),
            eta_seconds: None,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(event.envelope()).unwrap();
        assert_eq!(json["progress"]["percentage"], 40);
        assert_eq!(json["progress"]["status"], "Composing");
        assert!(json["progress"].get("eta_seconds").is_none());
    }
}

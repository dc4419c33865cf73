//! Stage execution: dependency checks, status transitions, retries.
//!
//! A stage consumes input resources that must all have succeeded, calls
//! capability adapters under a per-call timeout and retry policy, and
//! commits its output resource. The runner is the only component that
//! moves a record through `pending -> running -> {succeeded | failed}`.

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::domain::{
    Metadata, RecordError, ResourceKey, ResourceRecord, ResourceStatus, StageEvent,
    StageEventType,
};
use crate::error::{PipelineError, Result};

use super::journal::Journal;
use super::progress::ProgressHub;
use super::resource_store::ResourceStore;
use super::retry::RetryPolicy;

/// The fixed stages of the workflow, in dependency order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Extract,
    GenerateSegments,
    Compose,
    SynthesizeAudio,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Extract => "extract",
            Stage::GenerateSegments => "generate_segments",
            Stage::Compose => "compose",
            Stage::SynthesizeAudio => "synthesize_audio",
        }
    }

    /// Human-readable verb for progress messages
    fn activity(&self) -> &'static str {
        match self {
            Stage::Extract => "Extracting text",
            Stage::GenerateSegments => "Generating story segments",
            Stage::Compose => "Composing podcast",
            Stage::SynthesizeAudio => "Synthesizing audio",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// In-process cache of cancelled jobs; the journal marker is authoritative
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    cancelled: Mutex<HashSet<String>>,
}

impl CancellationRegistry {
    /// Returns false if the job was already cancelled
    pub fn cancel(&self, job_id: &str) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job_id.to_string())
    }

    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(job_id)
    }
}

/// What one stage invocation consumes and produces
#[derive(Debug, Clone)]
pub struct StageContext {
    pub stage: Stage,

    /// Journal and cancellation scope (document id or podcast id)
    pub job_id: String,

    /// Resources that must have succeeded before the stage may run
    pub inputs: Vec<ResourceKey>,

    /// Pending record the stage will fill
    pub output: ResourceKey,
}

/// Runs stages against the store
pub struct StageRunner {
    store: Arc<ResourceStore>,
    journal: Journal,
    progress: ProgressHub,
    retry: RetryPolicy,
    call_timeout: Duration,
    cancellations: CancellationRegistry,
}

impl StageRunner {
    pub fn new(
        store: Arc<ResourceStore>,
        journal: Journal,
        progress: ProgressHub,
        retry: RetryPolicy,
        call_timeout: Duration,
    ) -> Self {
        Self {
            store,
            journal,
            progress,
            retry,
            call_timeout,
            cancellations: CancellationRegistry::default(),
        }
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn progress(&self) -> &ProgressHub {
        &self.progress
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Cancel a job; returns false if it was already cancelled.
    ///
    /// The cancellation is persisted in the job's journal directory so a
    /// later process honours it too.
    pub async fn cancel(&self, job_id: &str) -> bool {
        info!(job_id, "Cancelling job");
        let already = self.is_cancelled(job_id).await;
        self.cancellations.cancel(job_id);
        if let Err(e) = self.journal.mark_cancelled(job_id).await {
            warn!(job_id, error = %e, "Could not persist cancellation");
        }
        !already
    }

    pub async fn is_cancelled(&self, job_id: &str) -> bool {
        if self.cancellations.is_cancelled(job_id) {
            return true;
        }
        match self.journal.is_marked_cancelled(job_id).await {
            Ok(true) => {
                self.cancellations.cancel(job_id);
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(job_id, error = %e, "Could not read cancellation marker");
                false
            }
        }
    }

    /// Fail fast unless every input exists and has succeeded
    pub async fn ensure_ready(&self, inputs: &[ResourceKey]) -> Result<Vec<ResourceRecord>> {
        let mut records = Vec::with_capacity(inputs.len());
        for key in inputs {
            let record = self.store.record(key).await?;
            if record.status != ResourceStatus::Succeeded {
                return Err(PipelineError::DependencyNotReady {
                    resource: key.to_string(),
                    status: record.status,
                });
            }
            records.push(record);
        }
        Ok(records)
    }

    /// Start a stage: move its output to `running` once inputs are ready.
    ///
    /// A cancelled job or a not-ready input fails the output record instead.
    pub async fn begin(&self, ctx: StageContext) -> Result<ActiveStage<'_>> {
        // A re-invoked output reports on a fresh stream
        let invocation = match self.store.find(&ctx.output).await {
            Ok(record) => record.and_then(|r| r.meta_u64("invocation")),
            Err(_) => None,
        };
        let progress_job = progress_job_id(&ctx.output, invocation);

        let mut active = ActiveStage {
            runner: self,
            ctx,
            progress_job,
            started: Instant::now(),
            attempts: 0,
            calls: 0,
        };

        if self.is_cancelled(&active.ctx.job_id).await {
            let err = PipelineError::Cancelled(active.ctx.job_id.clone());
            return Err(active.fail(err).await);
        }

        if let Err(e) = self.ensure_ready(&active.ctx.inputs).await {
            return Err(active.fail(e).await);
        }

        let output = active.ctx.output.clone();
        if let Err(e) = self
            .store
            .update_status(&output, ResourceStatus::Running, None)
            .await
        {
            return Err(active.fail(e).await);
        }

        info!(stage = %active.ctx.stage, resource = %output, "Stage started");
        active
            .journal(StageEventType::StageStarted, 0, format!("Stage '{}' started", active.ctx.stage))
            .await;
        active.progress(0, active.ctx.stage.activity());

        Ok(active)
    }
}

/// Progress job id for an output: its URI, suffixed `#n` from the second
/// invocation on so a re-run never reports below an earlier 100%
pub fn progress_job_id(output: &ResourceKey, invocation: Option<u64>) -> String {
    match invocation {
        Some(n) if n > 1 => format!("{}#{}", output, n),
        _ => output.to_string(),
    }
}

/// A stage whose output is `running`; must end in `succeed` or `fail`
pub struct ActiveStage<'a> {
    runner: &'a StageRunner,
    ctx: StageContext,

    /// Progress stream this invocation reports on
    progress_job: String,
    started: Instant,

    /// Most attempts any single adapter call needed
    attempts: u32,

    /// Adapter calls made
    calls: u32,
}

impl<'a> ActiveStage<'a> {
    pub fn output(&self) -> &ResourceKey {
        &self.ctx.output
    }

    pub fn stage(&self) -> Stage {
        self.ctx.stage
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn progress_job(&self) -> &str {
        &self.progress_job
    }

    /// Report stage-local progress (0-99); 100 is reserved for the end
    pub fn progress(&self, percentage: u8, status: &str) {
        self.runner
            .progress
            .report(&self.progress_job, percentage.min(99), status);
    }

    /// Invoke an adapter under the call timeout, retrying transient failures
    pub async fn call<T, E, F, Fut>(&mut self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        E: Into<PipelineError>,
    {
        let policy = self.runner.retry.clone();
        let timeout = self.runner.call_timeout;
        let mut attempt = 0u32;
        self.calls += 1;

        loop {
            attempt += 1;
            self.attempts = self.attempts.max(attempt);

            let err = match tokio::time::timeout(timeout, op()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e.into(),
                Err(_) => PipelineError::TransientProvider(format!(
                    "{} timed out after {}s",
                    label,
                    timeout.as_secs()
                )),
            };

            if !err.is_transient() || !policy.should_retry(attempt) {
                return Err(err);
            }

            if self.runner.is_cancelled(&self.ctx.job_id).await {
                return Err(PipelineError::Cancelled(self.ctx.job_id.clone()));
            }

            let delay = policy.delay_for_attempt(attempt);
            warn!(
                stage = %self.ctx.stage,
                call = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Adapter call failed, retrying"
            );
            self.runner
                .journal
                .record(
                    self.event(
                        StageEventType::StageRetrying,
                        attempt,
                        format!("{} failed, retrying in {:?}", label, delay),
                    )
                    .with_error(err.to_string()),
                )
                .await;

            tokio::time::sleep(delay).await;
        }
    }

    /// Commit the output's payload parts and mark it succeeded
    pub async fn succeed(
        mut self,
        parts: Vec<(&str, Vec<u8>)>,
        mut metadata: Metadata,
    ) -> Result<ResourceRecord> {
        let output = self.ctx.output.clone();
        let runner = self.runner;
        let store = &runner.store;

        for (name, bytes) in parts {
            if let Err(e) = store.put_part(&output, name, &bytes, Metadata::new()).await {
                return Err(self.fail(e).await);
            }
        }

        metadata.extend(self.accounting());
        let record = match store
            .transition(&output, ResourceStatus::Succeeded, None, metadata)
            .await
        {
            Ok(record) => record,
            Err(e) => return Err(self.fail(e).await),
        };

        let duration_ms = self.started.elapsed().as_millis() as u64;
        info!(
            stage = %self.ctx.stage,
            resource = %output,
            attempts = self.attempts,
            duration_ms,
            "Stage completed"
        );
        self.journal_with(
            StageEventType::StageCompleted,
            format!("Stage '{}' completed in {}ms", self.ctx.stage, duration_ms),
            |e| e.with_duration(duration_ms),
        )
        .await;
        runner.progress.finish(
            &self.progress_job,
            &format!("{} complete", self.ctx.stage.activity()),
        );

        Ok(record)
    }

    /// Mark the output failed, retaining `err`, and wrap it as a stage failure
    pub async fn fail(&mut self, err: PipelineError) -> PipelineError {
        let output = self.ctx.output.clone();
        let record_error = RecordError::from(&err);

        if let Err(e) = self
            .runner
            .store
            .transition(
                &output,
                ResourceStatus::Failed,
                Some(record_error),
                self.accounting(),
            )
            .await
        {
            error!(resource = %output, error = %e, "Could not record stage failure");
        }

        let duration_ms = self.started.elapsed().as_millis() as u64;
        let event_type = match err {
            PipelineError::Cancelled(_) => StageEventType::StageCancelled,
            _ => StageEventType::StageFailed,
        };
        error!(
            stage = %self.ctx.stage,
            resource = %output,
            attempts = self.attempts,
            error = %err,
            "Stage failed"
        );
        let message = err.to_string();
        self.journal_with(
            event_type,
            format!(
                "Stage '{}' failed after {} attempt(s)",
                self.ctx.stage, self.attempts
            ),
            |e| e.with_duration(duration_ms).with_error(message),
        )
        .await;
        self.runner.progress.finish(
            &self.progress_job,
            &format!("{} failed: {}", self.ctx.stage.activity(), err),
        );

        PipelineError::StageFailed {
            stage: self.ctx.stage,
            resource: output.to_string(),
            attempts: self.attempts,
            source: Box::new(err),
        }
    }

    fn accounting(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("attempts".to_string(), serde_json::json!(self.attempts));
        metadata.insert("adapter_calls".to_string(), serde_json::json!(self.calls));
        metadata.insert("stage".to_string(), serde_json::json!(self.ctx.stage));
        metadata
    }

    fn event(&self, event_type: StageEventType, attempt: u32, summary: String) -> StageEvent {
        StageEvent::new(
            self.ctx.job_id.clone(),
            self.ctx.stage,
            self.ctx.output.to_string(),
            event_type,
            attempt,
            summary,
        )
    }

    async fn journal(&self, event_type: StageEventType, attempt: u32, summary: String) {
        self.runner
            .journal
            .record(self.event(event_type, attempt, summary))
            .await;
    }

    async fn journal_with<F>(&self, event_type: StageEventType, summary: String, decorate: F)
    where
        F: FnOnce(StageEvent) -> StageEvent,
    {
        let event = decorate(self.event(event_type, self.attempts, summary));
        self.runner.journal.record(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::TempDir;

    async fn runner(temp: &TempDir, retry: RetryPolicy) -> (Arc<ResourceStore>, StageRunner) {
        let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
        let runner = StageRunner::new(
            store.clone(),
            Journal::new(store.jobs_dir()),
            ProgressHub::disabled(),
            retry,
            Duration::from_secs(5),
        );
        (store, runner)
    }

    async fn succeeded(store: &ResourceStore, key: &ResourceKey) {
        store.create(key, Metadata::new()).await.unwrap();
        store
            .update_status(key, ResourceStatus::Running, None)
            .await
            .unwrap();
        store
            .update_status(key, ResourceStatus::Succeeded, None)
            .await
            .unwrap();
    }

    fn ctx(input: &ResourceKey, output: &ResourceKey) -> StageContext {
        StageContext {
            stage: Stage::Compose,
            job_id: "p1".to_string(),
            inputs: vec![input.clone()],
            output: output.clone(),
        }
    }

    #[test]
    fn test_stage_labels() {
        assert_eq!(Stage::SynthesizeAudio.to_string(), "synthesize_audio");
        let json = serde_json::to_string(&Stage::GenerateSegments).unwrap();
        assert_eq!(json, "\"generate_segments\"");
    }

    #[tokio::test]
    async fn test_pending_input_is_not_ready() {
        let temp = TempDir::new().unwrap();
        let (store, runner) = runner(&temp, RetryPolicy::immediate(3)).await;
        let input = ResourceKey::segments("p1");
        store.create(&input, Metadata::new()).await.unwrap();

        let result = runner.ensure_ready(&[input]).await;
        assert!(matches!(
            result,
            Err(PipelineError::DependencyNotReady {
                status: ResourceStatus::Pending,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_and_counted() {
        let temp = TempDir::new().unwrap();
        let (store, runner) = runner(&temp, RetryPolicy::immediate(3)).await;
        let input = ResourceKey::segments("p1");
        let output = ResourceKey::podcast("p1");
        succeeded(&store, &input).await;
        store.create(&output, Metadata::new()).await.unwrap();

        let failures = AtomicU32::new(0);
        let failures = &failures;
        let mut active = runner.begin(ctx(&input, &output)).await.unwrap();
        let value = active
            .call("flaky", move || async move {
                if failures.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(PipelineError::TransientProvider("503".to_string()))
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 42);

        let record = active
            .succeed(vec![("content", b"ok".to_vec())], Metadata::new())
            .await
            .unwrap();
        assert_eq!(record.status, ResourceStatus::Succeeded);
        assert_eq!(record.meta_u64("attempts"), Some(3));

        let events = runner.journal().replay("p1").await.unwrap();
        let retries = events
            .iter()
            .filter(|e| e.event_type == StageEventType::StageRetrying)
            .count();
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let temp = TempDir::new().unwrap();
        let (store, runner) = runner(&temp, RetryPolicy::immediate(3)).await;
        let input = ResourceKey::segments("p1");
        let output = ResourceKey::podcast("p1");
        succeeded(&store, &input).await;
        store.create(&output, Metadata::new()).await.unwrap();

        let calls = AtomicU32::new(0);
        let calls = &calls;
        let mut active = runner.begin(ctx(&input, &output)).await.unwrap();
        let err = active
            .call("broken", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(PipelineError::PermanentProvider("bad request".to_string()))
            })
            .await
            .unwrap_err();
        let err = active.fail(err).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), "permanent_provider_error");

        let record = store.record(&output).await.unwrap();
        assert_eq!(record.status, ResourceStatus::Failed);
        assert_eq!(
            record.last_error.map(|e| e.code),
            Some("permanent_provider_error".to_string())
        );
    }

    #[tokio::test]
    async fn test_timeout_counts_as_transient() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(ResourceStore::open(temp.path()).await.unwrap());
        let runner = StageRunner::new(
            store.clone(),
            Journal::new(store.jobs_dir()),
            ProgressHub::disabled(),
            RetryPolicy::immediate(2),
            Duration::from_millis(20),
        );
        let input = ResourceKey::segments("p1");
        let output = ResourceKey::podcast("p1");
        succeeded(&store, &input).await;
        store.create(&output, Metadata::new()).await.unwrap();

        let mut active = runner.begin(ctx(&input, &output)).await.unwrap();
        let err = active
            .call("slow", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, PipelineError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(active.attempts(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_job_fails_output_without_running() {
        let temp = TempDir::new().unwrap();
        let (store, runner) = runner(&temp, RetryPolicy::immediate(3)).await;
        let input = ResourceKey::segments("p1");
        let output = ResourceKey::podcast("p1");
        succeeded(&store, &input).await;
        store.create(&output, Metadata::new()).await.unwrap();

        assert!(runner.cancel("p1").await);
        assert!(!runner.cancel("p1").await);
        let err = runner.begin(ctx(&input, &output)).await.err().unwrap();

        assert_eq!(err.code(), "cancelled");
        let record = store.record(&output).await.unwrap();
        assert_eq!(record.status, ResourceStatus::Failed);

        let last = runner
            .journal()
            .last_event_of_type("p1", StageEventType::StageCancelled)
            .await
            .unwrap();
        assert!(last.is_some());
    }

    #[test]
    fn test_progress_job_id_per_invocation() {
        let output = ResourceKey::podcast("p1");
        assert_eq!(progress_job_id(&output, None), "podcast://p1");
        assert_eq!(progress_job_id(&output, Some(1)), "podcast://p1");
        assert_eq!(progress_job_id(&output, Some(3)), "podcast://p1#3");
    }
}

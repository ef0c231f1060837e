//! Detection job lifecycle.
//!
//! ```text
//! Received ─▶ Running ─▶ Resolving ─▶ Publishing ─▶ Responded ─┐
//!               │            │             │                    ├─▶ CleaningUp ─▶ Done
//!               └────────────┴─────────────┴──────▶ Errored ───┘
//! ```
//!
//! Each job produces exactly one response through its [`Responder`] and then
//! removes the stored upload and, when one was located, the detector's run
//! directory. Cleanup failures are logged and counted, never reported to the
//! caller. An upload stays registered as pending until its file is gone.

use crate::artifact_locator::{ArtifactLocator, ResolvedArtifact};
use crate::error::DetectionError;
use crate::process_runner::ProcessRunner;
use crate::publisher::Publisher;
use crate::upload_store::{DetectionRequest, PendingUploads};
use serde::Serialize;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Successful detection response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResponse {
    /// Detector stdout, trimmed
    pub result: String,
    /// Reference to the published result image
    pub image_url: String,
}

pub type JobResult = Result<DetectionResponse, DetectionError>;

/// Lifecycle states of one detection job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Received,
    Running,
    Resolving,
    Publishing,
    Responded,
    Errored,
    CleaningUp,
    Done,
}

/// Single-use response channel for one job.
///
/// Once a response went out, later sends are dropped.
pub struct Responder {
    sender: Option<oneshot::Sender<JobResult>>,
}

impl Responder {
    pub fn channel() -> (Self, oneshot::Receiver<JobResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { sender: Some(tx) }, rx)
    }

    pub fn is_sent(&self) -> bool {
        self.sender.is_none()
    }

    /// Emit the response. Returns false when one was already sent or the
    /// caller went away.
    pub fn send(&mut self, result: JobResult) -> bool {
        match self.sender.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }
}

/// Request-scoped job bookkeeping
struct Job {
    request: DetectionRequest,
    state: JobState,
    artifact: Option<ResolvedArtifact>,
}

impl Job {
    fn transition(&mut self, next: JobState) {
        debug!(
            request_id = %self.request.request_id,
            from = ?self.state,
            to = ?next,
            "Job state change"
        );
        self.state = next;
    }
}

/// Runs detection jobs: detector, locator, publisher, then cleanup.
pub struct JobOrchestrator {
    runner: ProcessRunner,
    locator: ArtifactLocator,
    publisher: Arc<dyn Publisher>,
    detector_slots: Arc<Semaphore>,
    pending_uploads: PendingUploads,
}

impl JobOrchestrator {
    pub fn new(
        runner: ProcessRunner,
        locator: ArtifactLocator,
        publisher: Arc<dyn Publisher>,
        max_concurrent_jobs: usize,
    ) -> Self {
        info!(max_concurrent_jobs, "Job orchestrator initialized");

        Self {
            runner,
            locator,
            publisher,
            detector_slots: Arc::new(Semaphore::new(max_concurrent_jobs)),
            pending_uploads: PendingUploads::default(),
        }
    }

    /// Share the upload store's registry so result scans skip uploads of
    /// running jobs and finished jobs release theirs.
    pub fn with_pending_uploads(mut self, pending_uploads: PendingUploads) -> Self {
        self.pending_uploads = pending_uploads;
        self
    }

    /// Start a job on its own task.
    ///
    /// The receiver yields the job's single response; the handle completes
    /// once cleanup has finished.
    pub fn submit(
        self: &Arc<Self>,
        request: DetectionRequest,
    ) -> (oneshot::Receiver<JobResult>, JoinHandle<JobState>) {
        let (responder, rx) = Responder::channel();
        let orchestrator = Arc::clone(self);
        let handle = tokio::spawn(async move { orchestrator.execute(request, responder).await });
        (rx, handle)
    }

    /// Drive one job to completion and return its final state.
    #[instrument(skip(self, request, responder), fields(request_id = %request.request_id))]
    pub async fn execute(&self, request: DetectionRequest, mut responder: Responder) -> JobState {
        let started = Instant::now();
        let mut job = Job {
            request,
            state: JobState::Received,
            artifact: None,
        };

        let result = self.drive(&mut job).await;

        let outcome = match &result {
            Ok(_) => "success",
            Err(e) => e.kind(),
        };

        match result {
            Ok(response) => {
                job.transition(JobState::Responded);
                if !responder.send(Ok(response)) {
                    warn!(request_id = %job.request.request_id, "Caller gone before response");
                }
            }
            Err(err) => {
                job.transition(JobState::Errored);
                error!(
                    request_id = %job.request.request_id,
                    kind = err.kind(),
                    error = %err,
                    details = ?err.details(),
                    "Detection job failed"
                );
                if !responder.is_sent() {
                    responder.send(Err(err));
                }
            }
        }

        metrics::counter!("detection_jobs_total", "outcome" => outcome).increment(1);
        metrics::histogram!("detection_job_duration_seconds")
            .record(started.elapsed().as_secs_f64());

        job.transition(JobState::CleaningUp);
        let upload_removed = cleanup(
            &job.request.source_path,
            job.artifact.as_ref().and_then(|a| a.containing_dir.as_deref()),
        )
        .await;
        if upload_removed {
            self.pending_uploads.release(&job.request.source_path);
        }
        job.transition(JobState::Done);

        job.state
    }

    /// Running → Resolving → Publishing. Any error ends the job as Errored.
    async fn drive(&self, job: &mut Job) -> Result<DetectionResponse, DetectionError> {
        let (outcome, artifact) = {
            // Held through resolution so the newest run directory is ours.
            let _permit = self
                .detector_slots
                .acquire()
                .await
                .map_err(|_| DetectionError::JobAborted)?;

            job.transition(JobState::Running);
            let outcome = self.runner.run(&job.request.detector_arg()).await?;

            if !outcome.success() {
                return Err(DetectionError::ProcessExit {
                    code: outcome.exit_code,
                    stderr: outcome.stderr_text,
                });
            }

            job.transition(JobState::Resolving);
            let artifact = self
                .locator
                .locate(&job.request.source_path, &self.pending_uploads)
                .await
                .map_err(|e| DetectionError::from_locate(e, &outcome.stdout_text))?;

            (outcome, artifact)
        };

        job.artifact = Some(artifact.clone());

        job.transition(JobState::Publishing);
        let reference = self.publisher.publish(&artifact.file_path).await?;

        info!(
            request_id = %job.request.request_id,
            image_url = %reference.url,
            "Detection result published"
        );

        Ok(DetectionResponse {
            result: outcome.stdout_text.trim().to_string(),
            image_url: reference.url,
        })
    }
}

/// Remove the upload and the run directory. Already-missing paths count as
/// removed. Returns whether the upload is gone.
async fn cleanup(source: &Path, containing_dir: Option<&Path>) -> bool {
    let upload_removed = match tokio::fs::remove_file(source).await {
        Ok(()) => {
            debug!(path = %source.display(), "Deleted original upload");
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            metrics::counter!("detection_cleanup_failures_total").increment(1);
            warn!(path = %source.display(), error = %e, "Failed to delete original upload");
            false
        }
    };

    let Some(dir) = containing_dir else {
        return upload_removed;
    };

    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!(path = %dir.display(), "Deleted detection result folder"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            metrics::counter!("detection_cleanup_failures_total").increment(1);
            warn!(path = %dir.display(), error = %e, "Failed to delete detection result folder");
        }
    }

    upload_removed
}

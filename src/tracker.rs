//! Job tracking: one poller task per tracked job, plus the user actions that
//! mutate jobs (cancel, download, remove).
//!
//! Teardown is deterministic: every poller gets its own cancellation token,
//! stored in a map keyed by job id, and removal cancels the token and waits
//! for the task before touching the registry, so no poll fires after a job
//! is gone.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::types::JobStatus;
use crate::api::BatchApiClient;
use crate::error::AppError;
use crate::poller::{JobPoller, PollEnd, PollerConfig, ProgressProvider};
use crate::registry::{JobRecord, JobRegistry, JobUpdate};

/// Message stored on a record when cancellation is requested locally.
const CANCEL_REQUESTED_MESSAGE: &str = "Cancellation requested";

/// A running poller for one job.
struct PollerHandle {
    cancel: CancellationToken,
    task: JoinHandle<PollEnd>,
}

/// Owns the pollers for all tracked jobs and the job-level user actions.
pub struct JobTracker {
    registry: Arc<JobRegistry>,
    client: Arc<BatchApiClient>,
    poller: Arc<JobPoller>,
    active: Mutex<HashMap<String, PollerHandle>>,
}

impl JobTracker {
    /// Creates a tracker polling through the real API client.
    pub fn new(
        registry: Arc<JobRegistry>,
        client: Arc<BatchApiClient>,
        config: PollerConfig,
    ) -> Self {
        let provider: Arc<dyn ProgressProvider> = client.clone();
        Self::with_provider(registry, client, provider, config)
    }

    /// Creates a tracker with an explicit progress provider (used by tests).
    pub fn with_provider(
        registry: Arc<JobRegistry>,
        client: Arc<BatchApiClient>,
        provider: Arc<dyn ProgressProvider>,
        config: PollerConfig,
    ) -> Self {
        let poller = Arc::new(JobPoller::new(registry.clone(), provider, config));
        Self {
            registry,
            client,
            poller,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Starts a poller for a job. No-op (returning `false`) when the job is
    /// unknown, already terminal, or already being polled.
    pub async fn attach(&self, job_id: &str) -> bool {
        match self.registry.get(job_id).await {
            None => return false,
            Some(record) if record.is_terminal() => return false,
            Some(_) => {}
        }

        let mut active = self.active.lock().await;
        if let Some(handle) = active.get(job_id) {
            if !handle.task.is_finished() {
                return false;
            }
        }

        let cancel = CancellationToken::new();
        let task = {
            let poller = self.poller.clone();
            let cancel = cancel.clone();
            let job_id = job_id.to_string();
            tokio::spawn(async move { poller.run(&job_id, &cancel).await })
        };

        active.insert(job_id.to_string(), PollerHandle { cancel, task });
        true
    }

    /// Re-attaches pollers to every hydrated in-flight job. Called once at
    /// session start. Returns how many pollers were started.
    pub async fn resume_active(&self) -> usize {
        let mut resumed = 0;
        for job_id in self.registry.active_job_ids().await {
            if self.attach(&job_id).await {
                resumed += 1;
            }
        }
        if resumed > 0 {
            info!("[TRACKER] resumed polling for {} job(s)", resumed);
        }
        resumed
    }

    /// Cancels a job: one best-effort remote call, then the local record is
    /// optimistically finalized as cancelled and its poller torn down.
    ///
    /// When the remote call fails nothing local changes; the caller may retry
    /// and polling continues meanwhile.
    pub async fn cancel(&self, job_id: &str) -> Result<Option<JobRecord>, AppError> {
        self.client.cancel_job(job_id).await?;

        self.detach(job_id).await;
        let record = self
            .registry
            .update(
                job_id,
                JobUpdate::status_with_error(JobStatus::Cancelled, CANCEL_REQUESTED_MESSAGE),
            )
            .await?;

        Ok(record)
    }

    /// Downloads the result CSV of a completed job to `output_path`.
    pub async fn download(&self, job_id: &str, output_path: &Path) -> Result<u64, AppError> {
        if let Some(record) = self.registry.get(job_id).await {
            if record.status != JobStatus::Completed {
                return Err(AppError::NotReady(format!(
                    "Job is {}, result not ready",
                    record.status.as_str()
                )));
            }
        }
        self.client.download_result(job_id, output_path).await
    }

    /// Removes a job: tears down its poller first, then deletes the record.
    /// Returns whether the record existed.
    pub async fn remove(&self, job_id: &str) -> Result<bool, AppError> {
        self.detach(job_id).await;
        self.registry.remove(job_id).await
    }

    /// Waits for the poller of a job to finish, returning how it ended.
    /// `None` when no poller is attached.
    pub async fn wait(&self, job_id: &str) -> Option<PollEnd> {
        let handle = self.active.lock().await.remove(job_id)?;
        match handle.task.await {
            Ok(end) => Some(end),
            Err(e) => {
                warn!("[TRACKER] poller task for {} panicked: {}", job_id, e);
                None
            }
        }
    }

    /// Cancels every poller and waits for all of them to stop.
    pub async fn shutdown(&self) {
        let handles: Vec<(String, PollerHandle)> =
            self.active.lock().await.drain().collect();
        for (_, handle) in &handles {
            handle.cancel.cancel();
        }
        for (job_id, handle) in handles {
            if let Err(e) = handle.task.await {
                warn!("[TRACKER] poller task for {} panicked: {}", job_id, e);
            }
        }
    }

    /// Whether a poller is currently attached (and still running) for a job.
    pub async fn is_polling(&self, job_id: &str) -> bool {
        self.active
            .lock()
            .await
            .get(job_id)
            .map(|h| !h.task.is_finished())
            .unwrap_or(false)
    }

    /// Stops and removes the poller for one job, waiting until it is gone.
    async fn detach(&self, job_id: &str) {
        let handle = self.active.lock().await.remove(job_id);
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                warn!("[TRACKER] poller task for {} panicked: {}", job_id, e);
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

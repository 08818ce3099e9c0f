//! Per-job polling loop.
//!
//! One poller keeps one tracked job synchronized with remote truth until the
//! job reaches a terminal state, the attempt budget runs out, or an
//! unrecoverable error class is hit. Polls are strictly serialized: the next
//! request is not issued until the previous response has been applied to the
//! registry, so responses take effect in issue order by construction.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::types::{JobProgress, JobStatus};
use crate::api::BatchApiClient;
use crate::config::ClientConfig;
use crate::error::AppError;
use crate::registry::{JobRegistry, JobUpdate};

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Message stored when the server no longer knows the job.
const NOT_FOUND_MESSAGE: &str =
    "Job not found on the server — it may have been cancelled or deleted";

/// Message prefix stored when polling dies on a connectivity failure.
const CONNECTIVITY_MESSAGE: &str = "Lost contact with the analysis service";

// ─────────────────────────────────────────────────────────────────────────────
// ProgressProvider Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Trait for fetching job progress from the analysis service.
///
/// Decouples the poller from the real HTTP client so tests can script
/// response sequences.
pub trait ProgressProvider: Send + Sync {
    /// Fetches the current progress of a job.
    fn job_progress<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobProgress, AppError>> + Send + 'a>>;
}

impl ProgressProvider for BatchApiClient {
    fn job_progress<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<JobProgress, AppError>> + Send + 'a>> {
        Box::pin(BatchApiClient::job_progress(self, job_id))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PollerConfig
// ─────────────────────────────────────────────────────────────────────────────

/// Polling cadence and budget.
#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    /// Interval between polls for one job.
    pub interval: Duration,
    /// Maximum polls before giving up on a job that never resolves.
    pub max_attempts: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: crate::config::DEFAULT_POLL_INTERVAL,
            max_attempts: crate::config::DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

impl From<&ClientConfig> for PollerConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            interval: config.poll_interval,
            max_attempts: config.max_poll_attempts,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PollEnd
// ─────────────────────────────────────────────────────────────────────────────

/// Why a poll loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollEnd {
    /// The job reached a terminal status, either before the first request or
    /// via a poll result.
    Terminal(JobStatus),
    /// The server reported the job gone (404/410); the record was marked
    /// failed with an explanatory message.
    Gone,
    /// A connectivity or server-error class failure; the record was marked
    /// failed rather than leaving the UI polling a dead endpoint.
    Transport,
    /// The attempt budget ran out. The record is left as-is: the job may
    /// still be running server-side, it just did not resolve locally.
    BudgetExhausted,
    /// The poller was cancelled, or its record was removed from the registry.
    Stopped,
}

// ─────────────────────────────────────────────────────────────────────────────
// JobPoller
// ─────────────────────────────────────────────────────────────────────────────

/// Polls one job at a time against the registry.
///
/// Cheap to share; one instance serves every tracked job.
pub struct JobPoller {
    registry: Arc<JobRegistry>,
    provider: Arc<dyn ProgressProvider>,
    config: PollerConfig,
}

impl JobPoller {
    pub fn new(
        registry: Arc<JobRegistry>,
        provider: Arc<dyn ProgressProvider>,
        config: PollerConfig,
    ) -> Self {
        Self {
            registry,
            provider,
            config,
        }
    }

    /// Runs the poll loop for one job until it ends.
    ///
    /// No request is issued after `cancel` fires, and none is issued at all
    /// when the record is already terminal on attach.
    pub async fn run(&self, job_id: &str, cancel: &CancellationToken) -> PollEnd {
        match self.registry.get(job_id).await {
            None => return PollEnd::Stopped,
            Some(record) if record.is_terminal() => return PollEnd::Terminal(record.status),
            Some(_) => {}
        }

        let mut attempts: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return PollEnd::Stopped;
            }
            // Removal and poller teardown are triggered together, but the
            // registry is re-checked each tick in case they raced.
            if self.registry.get(job_id).await.is_none() {
                return PollEnd::Stopped;
            }

            attempts += 1;

            // Teardown aborts an in-flight request rather than letting its
            // response land after the consumer is gone.
            let result = tokio::select! {
                _ = cancel.cancelled() => return PollEnd::Stopped,
                result = self.provider.job_progress(job_id) => result,
            };

            match result {
                Ok(progress) => {
                    match self.registry.update(job_id, JobUpdate::from(progress)).await {
                        Ok(Some(record)) if record.is_terminal() => {
                            info!(
                                "[POLLER] job {} reached {} after {} polls",
                                redact_id(job_id),
                                record.status.as_str(),
                                attempts
                            );
                            return PollEnd::Terminal(record.status);
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => return PollEnd::Stopped,
                        Err(e) => {
                            warn!(
                                "[POLLER] failed to persist update for {}: {}",
                                redact_id(job_id),
                                e
                            );
                        }
                    }
                }
                Err(AppError::JobGone { .. }) => {
                    let _ = self
                        .registry
                        .update(
                            job_id,
                            JobUpdate::status_with_error(JobStatus::Failed, NOT_FOUND_MESSAGE),
                        )
                        .await;
                    return PollEnd::Gone;
                }
                Err(err @ (AppError::ConnectionFailed(_) | AppError::Server(_))) => {
                    let _ = self
                        .registry
                        .update(
                            job_id,
                            JobUpdate::status_with_error(
                                JobStatus::Failed,
                                format!("{}: {}", CONNECTIVITY_MESSAGE, err),
                            ),
                        )
                        .await;
                    return PollEnd::Transport;
                }
                Err(err) => {
                    // Transient: logged, counted against the budget, polling
                    // continues.
                    warn!(
                        "[POLLER] transient poll failure for {}: {}",
                        redact_id(job_id),
                        err
                    );
                }
            }

            if attempts >= self.config.max_attempts {
                info!(
                    "[POLLER] giving up on {} after {} polls; last known status stands",
                    redact_id(job_id),
                    attempts
                );
                return PollEnd::BudgetExhausted;
            }

            tokio::select! {
                _ = cancel.cancelled() => return PollEnd::Stopped,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
    }
}

/// Redacts a job ID for logging (shows first 8 chars).
fn redact_id(id: &str) -> String {
    if id.len() > 8 {
        format!("{}...", &id[..8])
    } else {
        id.to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{JobRecord, SqliteStore};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Scripted progress provider: pops queued responses, then repeats the
    /// fallback forever. Counts every request it receives.
    struct ScriptedProvider {
        responses: Mutex<VecDeque<Result<JobProgress, AppError>>>,
        fallback: Option<JobProgress>,
        calls: AtomicU32,
    }

    impl ScriptedProvider {
        fn new(
            responses: Vec<Result<JobProgress, AppError>>,
            fallback: Option<JobProgress>,
        ) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                fallback,
                calls: AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl ProgressProvider for ScriptedProvider {
        fn job_progress<'a>(
            &'a self,
            _job_id: &'a str,
        ) -> Pin<Box<dyn Future<Output = Result<JobProgress, AppError>> + Send + 'a>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if let Some(scripted) = self.responses.lock().unwrap().pop_front() {
                    return scripted;
                }
                match &self.fallback {
                    Some(progress) => Ok(progress.clone()),
                    None => Err(AppError::Internal("script exhausted".into())),
                }
            })
        }
    }

    fn progress(status: JobStatus, completed: u64, total: u64) -> JobProgress {
        JobProgress {
            status,
            completed_rows: Some(completed),
            total_rows: Some(total),
            error: None,
        }
    }

    fn fast_config(max_attempts: u32) -> PollerConfig {
        PollerConfig {
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    async fn registry_with_job(job_id: &str) -> (TempDir, Arc<JobRegistry>) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open(temp_dir.path().join("jobs.db"))
                .await
                .unwrap(),
        );
        let registry = Arc::new(JobRegistry::load(store).await.unwrap());
        registry
            .add(JobRecord::new_queued(job_id.into(), "parcels.csv".into(), 10))
            .await
            .unwrap();
        (temp_dir, registry)
    }

    #[tokio::test]
    async fn terminal_record_on_attach_issues_no_requests() {
        let (_tmp, registry) = registry_with_job("J1").await;
        registry
            .update("J1", JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();

        let provider = Arc::new(ScriptedProvider::new(vec![], None));
        let poller = JobPoller::new(registry, provider.clone(), fast_config(5));

        let end = poller.run("J1", &CancellationToken::new()).await;

        assert_eq!(end, PollEnd::Terminal(JobStatus::Completed));
        assert_eq!(provider.calls(), 0, "no request for a terminal record");
    }

    #[tokio::test]
    async fn first_poll_completed_goes_straight_from_queued() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![Ok(progress(JobStatus::Completed, 10, 10))],
            None,
        ));
        let poller = JobPoller::new(registry.clone(), provider.clone(), fast_config(5));

        let end = poller.run("J1", &CancellationToken::new()).await;

        assert_eq!(end, PollEnd::Terminal(JobStatus::Completed));
        assert_eq!(provider.calls(), 1, "no further requests after terminal");

        let record = registry.get("J1").await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.completed_rows, 10);
        assert_eq!(record.total_rows, 10);
    }

    #[tokio::test]
    async fn budget_exhaustion_stops_without_failing_the_job() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![],
            Some(progress(JobStatus::Processing, 3, 10)),
        ));
        let poller = JobPoller::new(registry.clone(), provider.clone(), fast_config(7));

        let end = poller.run("J1", &CancellationToken::new()).await;

        assert_eq!(end, PollEnd::BudgetExhausted);
        assert_eq!(provider.calls(), 7, "exactly the configured attempt count");

        let record = registry.get("J1").await.unwrap();
        assert_eq!(
            record.status,
            JobStatus::Processing,
            "last known status stands; budget exhaustion is not failure"
        );
    }

    #[tokio::test]
    async fn job_gone_marks_failed_and_stops() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![
                Ok(progress(JobStatus::Processing, 2, 10)),
                Err(AppError::JobGone {
                    job_id: "J1".into(),
                }),
            ],
            Some(progress(JobStatus::Processing, 2, 10)),
        ));
        let poller = JobPoller::new(registry.clone(), provider.clone(), fast_config(50));

        let end = poller.run("J1", &CancellationToken::new()).await;

        assert_eq!(end, PollEnd::Gone);
        assert_eq!(provider.calls(), 2, "no requests after the 404");

        let record = registry.get("J1").await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.error.as_deref().unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn transport_error_marks_failed_and_stops() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![Err(AppError::ConnectionFailed("connection refused".into()))],
            Some(progress(JobStatus::Processing, 0, 10)),
        ));
        let poller = JobPoller::new(registry.clone(), provider.clone(), fast_config(50));

        let end = poller.run("J1", &CancellationToken::new()).await;

        assert_eq!(end, PollEnd::Transport);
        assert_eq!(provider.calls(), 1);

        let record = registry.get("J1").await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record
            .error
            .as_deref()
            .unwrap()
            .contains("Lost contact with the analysis service"));
    }

    #[tokio::test]
    async fn server_error_is_also_transport_class() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![Err(AppError::Server("HTTP 503 - Service Unavailable".into()))],
            None,
        ));
        let poller = JobPoller::new(registry.clone(), provider.clone(), fast_config(50));

        assert_eq!(
            poller.run("J1", &CancellationToken::new()).await,
            PollEnd::Transport
        );
        assert_eq!(registry.get("J1").await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn unclassified_errors_are_transient() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![
                Err(AppError::MalformedResponse("unknown job status".into())),
                Err(AppError::MalformedResponse("still garbled".into())),
                Ok(progress(JobStatus::Completed, 10, 10)),
            ],
            None,
        ));
        let poller = JobPoller::new(registry.clone(), provider.clone(), fast_config(50));

        let end = poller.run("J1", &CancellationToken::new()).await;

        assert_eq!(end, PollEnd::Terminal(JobStatus::Completed));
        assert_eq!(provider.calls(), 3, "polling survived transient failures");
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![],
            Some(progress(JobStatus::Processing, 1, 10)),
        ));
        // A long interval so the loop parks in the sleep arm.
        let poller = Arc::new(JobPoller::new(
            registry,
            provider.clone(),
            PollerConfig {
                interval: Duration::from_secs(60),
                max_attempts: 100,
            },
        ));

        let cancel = CancellationToken::new();
        let task = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run("J1", &cancel).await })
        };

        // Let the first poll land, then cancel during the sleep.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let end = task.await.unwrap();
        assert_eq!(end, PollEnd::Stopped);

        let calls_at_cancel = provider.calls();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(provider.calls(), calls_at_cancel, "no poll after teardown");
    }

    #[tokio::test]
    async fn removal_from_registry_stops_the_loop() {
        let (_tmp, registry) = registry_with_job("J1").await;

        let provider = Arc::new(ScriptedProvider::new(
            vec![Ok(progress(JobStatus::Processing, 1, 10))],
            Some(progress(JobStatus::Processing, 2, 10)),
        ));
        let poller = Arc::new(JobPoller::new(
            registry.clone(),
            provider,
            fast_config(100),
        ));

        let cancel = CancellationToken::new();
        let task = {
            let poller = poller.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { poller.run("J1", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.remove("J1").await.unwrap();

        let end = task.await.unwrap();
        assert_eq!(end, PollEnd::Stopped);
    }
}

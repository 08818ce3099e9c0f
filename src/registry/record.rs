//! Tracked job records and merge semantics.

use serde::{Deserialize, Serialize};

use crate::api::types::{JobProgress, JobStatus};

/// One batch analysis job known to this client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Server-assigned identifier. The client never generates these.
    pub job_id: String,
    /// Current lifecycle state.
    pub status: JobStatus,
    /// Total rows in the job. Starts as a client-side estimate and is
    /// reconciled by the first successful poll.
    pub total_rows: u64,
    /// Rows analyzed so far.
    pub completed_rows: u64,
    /// Display name of the originating upload; not guaranteed unique.
    pub filename: String,
    /// RFC-3339 timestamp set at submission time on this client.
    /// Used for sort ordering and display only.
    pub created_at: String,
    /// Human-readable failure/cancellation message, when present.
    pub error: Option<String>,
}

impl JobRecord {
    /// Creates the record for a freshly submitted job.
    pub fn new_queued(job_id: String, filename: String, estimated_rows: u64) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            total_rows: estimated_rows,
            completed_rows: 0,
            filename,
            created_at: chrono::Utc::now().to_rfc3339(),
            error: None,
        }
    }

    /// Returns true once the job can no longer change state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Merges an update into the record, returning whether anything changed.
    ///
    /// Rules:
    /// - a terminal record never changes again
    /// - status moves only forward along queued → processing → terminal;
    ///   a regression reported by the service is ignored
    /// - counts take the reported value, falling back to the previous one,
    ///   and `completed_rows` is clamped to `total_rows` when the total is
    ///   known (the service is an external source and not trusted blindly)
    pub fn apply(&mut self, update: &JobUpdate) -> bool {
        if self.is_terminal() {
            return false;
        }

        let before = self.clone();

        if let Some(status) = update.status {
            if status.rank() >= self.status.rank() {
                self.status = status;
            }
        }
        if let Some(total) = update.total_rows {
            self.total_rows = total;
        }
        if let Some(completed) = update.completed_rows {
            self.completed_rows = completed;
        }
        if self.total_rows > 0 && self.completed_rows > self.total_rows {
            self.completed_rows = self.total_rows;
        }
        if let Some(error) = &update.error {
            self.error = Some(error.clone());
        }

        *self != before
    }
}

/// Partial update merged into a [`JobRecord`].
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub total_rows: Option<u64>,
    pub completed_rows: Option<u64>,
    pub error: Option<String>,
}

impl JobUpdate {
    /// Update that only moves the status.
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Update that moves the status and records a message.
    pub fn status_with_error(status: JobStatus, error: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

impl From<JobProgress> for JobUpdate {
    fn from(progress: JobProgress) -> Self {
        Self {
            status: Some(progress.status),
            total_rows: progress.total_rows,
            completed_rows: progress.completed_rows,
            error: progress.error,
        }
    }
}

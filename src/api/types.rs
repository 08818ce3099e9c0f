//! Canonical job types and wire-shape normalization.
//!
//! The analysis service reports the same facts under several field spellings:
//! the job identifier arrives as `job_id` or nested under `job`, and progress
//! counts arrive as `completed_rows`/`total_rows`, `completedRows`/`totalRows`,
//! or a nested `progress { current, total }` object. Everything is mapped into
//! one canonical shape here, at the API boundary, and nowhere else.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// JobStatus
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a batch analysis job.
///
/// This is a closed enumeration; the service never reports other values, and
/// a payload carrying an unknown status is treated as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted by the service, waiting for a worker.
    Queued,
    /// A worker is running the analysis.
    Processing,
    /// All rows analyzed; results are downloadable.
    Completed,
    /// The job failed server-side.
    Failed,
    /// The job was cancelled.
    Cancelled,
}

impl JobStatus {
    /// Converts the status to its wire/storage string.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parses a wire/storage string. Returns `None` for anything outside the
    /// closed set.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(JobStatus::Queued),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            "cancelled" => Some(JobStatus::Cancelled),
            _ => None,
        }
    }

    /// Returns true if this is a terminal state (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position along the queued → processing → terminal progression.
    /// Used to reject regressions reported by the service.
    pub(crate) fn rank(&self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Processing => 1,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => 2,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// JobProgress
// ─────────────────────────────────────────────────────────────────────────────

/// One normalized progress report for a job.
///
/// Counts are optional because not every deployment includes them on every
/// poll; absent values fall back to the last known ones when applied to the
/// local record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobProgress {
    pub status: JobStatus,
    pub completed_rows: Option<u64>,
    pub total_rows: Option<u64>,
    pub error: Option<String>,
}

/// Normalizes a progress response body into [`JobProgress`].
///
/// # Errors
///
/// `AppError::MalformedResponse` when the status field is missing or outside
/// the closed enumeration.
pub fn parse_progress(body: &Value) -> Result<JobProgress, AppError> {
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::MalformedResponse("progress response has no status".into()))?;
    let status = JobStatus::parse(status)
        .ok_or_else(|| AppError::MalformedResponse(format!("unknown job status {:?}", status)))?;

    Ok(JobProgress {
        status,
        completed_rows: count_field(body, &["completed_rows", "completedRows"], "current"),
        total_rows: count_field(body, &["total_rows", "totalRows"], "total"),
        error: string_field(body, &["error_message", "error"]),
    })
}

/// Extracts the job identifier from a submission response.
///
/// Accepted shapes: `{ "job_id": ... }` and `{ "job": { "job_id": ... } }`.
pub fn extract_job_id(body: &Value) -> Option<String> {
    body.get("job")
        .and_then(|job| job.get("job_id"))
        .or_else(|| body.get("job_id"))
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

/// Looks up a row count under the given top-level keys, falling back to the
/// nested `progress` object.
fn count_field(body: &Value, top_level: &[&str], nested: &str) -> Option<u64> {
    for key in top_level {
        if let Some(n) = body.get(*key).and_then(Value::as_u64) {
            return Some(n);
        }
    }
    body.get("progress")
        .and_then(|p| p.get(nested))
        .and_then(Value::as_u64)
}

/// Returns the first non-empty string found under the given keys.
fn string_field(body: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| body.get(*key).and_then(Value::as_str))
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

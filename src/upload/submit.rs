//! Submission: upload a tabular file and seed the registry with the new job.

use std::path::Path;

use tracing::{info, warn};

use crate::api::BatchApiClient;
use crate::error::AppError;
use crate::registry::{JobRecord, JobRegistry};
use crate::upload::mapping::ColumnMapping;
use crate::upload::tabular::{count_data_rows, detect_kind};

/// Submits a file for batch analysis and inserts the resulting job into the
/// registry with `queued` status and a client-side row estimate.
///
/// The estimate is reconciled by the first successful poll; it exists so the
/// UI can show a meaningful progress denominator immediately.
///
/// # Errors
///
/// - `AppError::UnsupportedFile` / `AppError::Parse` before any network call
/// - `AppError::Submission` / `AppError::MalformedResponse` from the upload
pub async fn submit_job(
    client: &BatchApiClient,
    registry: &JobRegistry,
    path: &Path,
    mapping: &ColumnMapping,
    user: Option<&str>,
    email: Option<&str>,
) -> Result<JobRecord, AppError> {
    // Same gate the backend applies; fail fast without a network round trip.
    detect_kind(path)?;

    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    let estimated_rows = count_data_rows(path).await?;

    let job_id = client
        .submit_batch(path, &filename, mapping.to_json(), user, email)
        .await?;

    info!(
        "[SUBMIT] {} accepted as job {} (~{} rows)",
        filename,
        &job_id[..8.min(job_id.len())],
        estimated_rows
    );

    let record = JobRecord::new_queued(job_id, filename, estimated_rows);
    if !registry.add(record.clone()).await? {
        // The server reused an identifier this session already tracks;
        // first writer wins and the existing record stands.
        warn!("[SUBMIT] job {} was already tracked", record.job_id);
    }

    Ok(record)
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

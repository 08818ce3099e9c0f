//! Batch analysis API client.
//!
//! This module provides functionality to:
//! - Submit batch analysis jobs via streamed multipart upload
//! - Poll job progress
//! - Request best-effort cancellation
//! - Stream result CSVs to disk
//!
//! # Security
//!
//! - The API key is attached as a header and never logged
//! - Only HTTP method, path, and status codes are logged
//! - Job identifiers are redacted to a short prefix in log lines

use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use reqwest::multipart;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::info;
use url::Url;

use crate::api::types::{extract_job_id, parse_progress, JobProgress};
use crate::config::ClientConfig;
use crate::error::AppError;

// ─────────────────────────────────────────────────────────────────────────────
// Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Header carrying the API key on every request.
const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the user identifier when one is configured.
const USER_ID_HEADER: &str = "x-user-id";

/// Request timeout for uploads and downloads.
const REQUEST_TIMEOUT_SECS: u64 = 300;

// ─────────────────────────────────────────────────────────────────────────────
// Wire Types
// ─────────────────────────────────────────────────────────────────────────────

/// Error response format used by the analysis service.
#[derive(Debug, serde::Deserialize)]
struct ApiErrorBody {
    detail: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// BatchApiClient
// ─────────────────────────────────────────────────────────────────────────────

/// Client for the batch analysis endpoints.
///
/// Cheap to clone; the underlying HTTP client is shared.
#[derive(Clone)]
pub struct BatchApiClient {
    /// Shared HTTP client.
    client: Arc<Client>,
    /// Base service URL (e.g. "https://api.example.com").
    base_url: Url,
    /// API key for authentication.
    api_key: String,
    /// User identifier, attached when known.
    user_id: Option<String>,
}

impl BatchApiClient {
    /// Creates a new client.
    pub fn new(
        client: Arc<Client>,
        base_url: Url,
        api_key: String,
        user_id: Option<String>,
    ) -> Self {
        Self {
            client,
            base_url,
            api_key,
            user_id,
        }
    }

    /// Builds a client from configuration, with a long timeout suitable for
    /// uploads and result downloads.
    pub fn from_config(config: &ClientConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self::new(
            Arc::new(client),
            config.base_url.clone(),
            config.api_key.clone(),
            config.user_id.clone(),
        ))
    }

    /// Submits a tabular file for batch analysis.
    ///
    /// The file is streamed from disk; `mapping_json` is the JSON-encoded
    /// column mapping (omitted when empty, letting the backend auto-detect
    /// coordinate columns).
    ///
    /// # Returns
    ///
    /// The server-assigned job identifier.
    ///
    /// # Errors
    ///
    /// - `AppError::Submission` - the service rejected the upload
    /// - `AppError::MalformedResponse` - 2xx response without a job identifier
    /// - `AppError::ConnectionFailed` - network error
    pub async fn submit_batch(
        &self,
        path: &Path,
        filename: &str,
        mapping_json: Option<String>,
        user: Option<&str>,
        email: Option<&str>,
    ) -> Result<String, AppError> {
        let url = self.build_url("/analyze/batch")?;

        let file = File::open(path)
            .await
            .map_err(|e| AppError::Internal(format!("Failed to open upload file: {}", e)))?;
        let file_size = file
            .metadata()
            .await
            .map(|m| m.len())
            .unwrap_or_default();

        let part = multipart::Part::stream(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .file_name(filename.to_string())
            .mime_str(mime_for(filename))
            .map_err(|e| AppError::Internal(format!("Failed to build upload part: {}", e)))?;

        let mut form = multipart::Form::new().part("file", part);
        if let Some(mapping) = mapping_json {
            form = form.text("column_mapping", mapping);
        }
        if let Some(user) = user {
            form = form.text("user", user.to_string());
        }
        if let Some(email) = email {
            form = form.text("email", email.to_string());
        }

        info!("[BATCH-API] POST /analyze/batch ({} bytes)", file_size);

        let response = self
            .apply_headers(self.client.post(url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Batch submission failed: {}", e)))?;

        let status = response.status();
        info!("[BATCH-API] POST /analyze/batch -> {}", status.as_u16());

        if !status.is_success() {
            let detail = response_detail(response).await;
            return Err(AppError::Submission(detail.unwrap_or_else(|| {
                format!(
                    "HTTP {} - {}",
                    status.as_u16(),
                    status.canonical_reason().unwrap_or("Unknown error")
                )
            })));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            AppError::MalformedResponse(format!("Failed to parse submission response: {}", e))
        })?;

        extract_job_id(&body).ok_or_else(|| {
            AppError::MalformedResponse("submission response lacked a job identifier".into())
        })
    }

    /// Fetches the current progress of a job.
    ///
    /// # Errors
    ///
    /// - `AppError::JobGone` - 404/410; the job was deleted or expired
    /// - `AppError::Server` - 5xx from the service
    /// - `AppError::ConnectionFailed` - network error
    /// - `AppError::MalformedResponse` - unparseable body or unknown status
    pub async fn job_progress(&self, job_id: &str) -> Result<JobProgress, AppError> {
        let url = self.build_url(&format!("/batch/progress/{}", job_id))?;

        info!("[BATCH-API] GET /batch/progress/{}", redact_id(job_id));

        let response = self
            .apply_headers(self.client.get(url))
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Progress check failed: {}", e)))?;

        let status = response.status();
        info!(
            "[BATCH-API] GET /batch/progress/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if status == reqwest::StatusCode::NOT_FOUND || status == reqwest::StatusCode::GONE {
            return Err(AppError::JobGone {
                job_id: job_id.to_string(),
            });
        }
        if status.is_server_error() {
            return Err(AppError::Server(format!(
                "HTTP {} - {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or("Unknown error")
            )));
        }
        if !status.is_success() {
            let detail = response_detail(response).await;
            return Err(AppError::Api(detail.unwrap_or_else(|| {
                format!("HTTP {} during progress check", status.as_u16())
            })));
        }

        let body: serde_json::Value = response.json().await.map_err(|e| {
            AppError::MalformedResponse(format!("Failed to parse progress response: {}", e))
        })?;

        parse_progress(&body)
    }

    /// Requests cancellation of a job (best-effort).
    ///
    /// The response body carries no information the client needs; the job's
    /// actual fate is whatever the service records.
    pub async fn cancel_job(&self, job_id: &str) -> Result<(), AppError> {
        let url = self.build_url(&format!("/batch/cancel/{}", job_id))?;

        info!("[BATCH-API] GET /batch/cancel/{}", redact_id(job_id));

        let response = self
            .apply_headers(self.client.get(url))
            .send()
            .await
            .map_err(|e| AppError::Cancel(format!("Cancellation request failed: {}", e)))?;

        let status = response.status();
        info!(
            "[BATCH-API] GET /batch/cancel/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if !status.is_success() {
            let detail = response_detail(response).await;
            return Err(AppError::Cancel(detail.unwrap_or_else(|| {
                format!("HTTP {} during cancellation", status.as_u16())
            })));
        }

        Ok(())
    }

    /// Streams the result CSV of a completed job to disk.
    ///
    /// Uses atomic write pattern: writes to a temp file in the target
    /// directory, then renames on success.
    ///
    /// # Returns
    ///
    /// The number of bytes written.
    ///
    /// # Errors
    ///
    /// - `AppError::NotReady` - the job has not completed
    /// - `AppError::Download` - the result is missing or the stream failed
    /// - `AppError::ConnectionFailed` - network error
    pub async fn download_result(
        &self,
        job_id: &str,
        output_path: &Path,
    ) -> Result<u64, AppError> {
        let url = self.build_url(&format!("/batch/download/{}", job_id))?;

        info!("[BATCH-API] GET /batch/download/{}", redact_id(job_id));

        let response = self
            .apply_headers(self.client.get(url))
            .send()
            .await
            .map_err(|e| AppError::ConnectionFailed(format!("Result download failed: {}", e)))?;

        let status = response.status();
        info!(
            "[BATCH-API] GET /batch/download/{} -> {}",
            redact_id(job_id),
            status.as_u16()
        );

        if status == reqwest::StatusCode::BAD_REQUEST {
            let detail = response_detail(response).await;
            return Err(AppError::NotReady(
                detail.unwrap_or_else(|| "Job result is not ready".into()),
            ));
        }
        if !status.is_success() {
            let detail = response_detail(response).await;
            return Err(AppError::Download(detail.unwrap_or_else(|| {
                format!("HTTP {} during download", status.as_u16())
            })));
        }

        // Ensure parent directory exists
        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                AppError::Internal(format!("Failed to create output directory: {}", e))
            })?;
        }

        // Temp file in the same directory for atomic rename
        let parent_dir = output_path.parent().unwrap_or_else(|| Path::new("."));
        let temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| AppError::Internal(format!("Failed to create temp file: {}", e)))?;

        let std_file = temp_file
            .reopen()
            .map_err(|e| AppError::Internal(format!("Failed to reopen temp file: {}", e)))?;
        let mut async_file = File::from_std(std_file);

        let mut stream = response.bytes_stream();
        let mut total_bytes = 0u64;

        while let Some(chunk_result) = stream.next().await {
            let chunk = chunk_result.map_err(|e| {
                AppError::Download(format!("Error reading result stream: {}", e))
            })?;
            async_file
                .write_all(&chunk)
                .await
                .map_err(|e| AppError::Internal(format!("Error writing to file: {}", e)))?;
            total_bytes += chunk.len() as u64;
        }

        async_file
            .flush()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to flush output file: {}", e)))?;
        async_file
            .sync_all()
            .await
            .map_err(|e| AppError::Internal(format!("Failed to sync output file: {}", e)))?;

        temp_file
            .persist(output_path)
            .map_err(|e| AppError::Internal(format!("Failed to persist temp file: {}", e)))?;

        info!(
            "[BATCH-API] download complete for job {}: {} bytes",
            redact_id(job_id),
            total_bytes
        );

        Ok(total_bytes)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Private Helpers
    // ─────────────────────────────────────────────────────────────────────────

    /// Attaches the API key and, when known, the user id to a request.
    /// A missing user id never blocks the call; the backend enforces auth.
    fn apply_headers(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header(API_KEY_HEADER, &self.api_key);
        match &self.user_id {
            Some(user_id) => builder.header(USER_ID_HEADER, user_id),
            None => builder,
        }
    }

    /// Joins a path onto the base URL.
    fn build_url(&self, path: &str) -> Result<Url, AppError> {
        self.base_url
            .join(path)
            .map_err(|e| AppError::Internal(format!("Failed to build URL for {}: {}", path, e)))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helper Functions
// ─────────────────────────────────────────────────────────────────────────────

/// Extracts the `detail` message from an error response body, if present.
async fn response_detail(response: reqwest::Response) -> Option<String> {
    let body = response.text().await.ok()?;
    serde_json::from_str::<ApiErrorBody>(&body)
        .ok()
        .map(|e| e.detail)
}

/// Picks the content type for an upload by file extension.
fn mime_for(filename: &str) -> &'static str {
    let lower = filename.to_ascii_lowercase();
    if lower.ends_with(".xlsx") {
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
    } else if lower.ends_with(".xls") {
        "application/vnd.ms-excel"
    } else {
        "text/csv"
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

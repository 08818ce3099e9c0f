use serde::Serialize;
use thiserror::Error;

/// Patterns (lowercase) that indicate sensitive data not safe for UI display.
/// Used by `contains_sensitive()` for case-insensitive matching.
pub(crate) const SENSITIVE_PATTERNS: &[&str] = &[
    "x-api-key",
    "api_key",
    "apikey",
    "bearer ",
    "authorization:",
];

/// Returns true if the message contains any sensitive pattern (case-insensitive).
fn contains_sensitive(msg: &str) -> bool {
    let lower = msg.to_ascii_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitizes a message for UI display.
/// If sensitive content is detected, returns the fallback instead.
fn sanitize_message(msg: &str, fallback: &str) -> String {
    if contains_sensitive(msg) {
        fallback.into()
    } else {
        msg.to_string()
    }
}

/// User-friendly error presentation for the frontend.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── File / parsing ────────────────────────────────────────────────────────
    #[error("Unsupported file type: {0}")]
    UnsupportedFile(String),

    #[error("Invalid tabular file: {0}")]
    Parse(String),

    // ── Submission ────────────────────────────────────────────────────────────
    #[error("Submission rejected: {0}")]
    Submission(String),

    #[error("Malformed server response: {0}")]
    MalformedResponse(String),

    // ── Job API ───────────────────────────────────────────────────────────────
    #[error("Job {job_id} not found")]
    JobGone { job_id: String },

    #[error("Analysis service error: {0}")]
    Server(String),

    #[error("API error: {0}")]
    Api(String),

    // ── Network ───────────────────────────────────────────────────────────────
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // ── Job actions ───────────────────────────────────────────────────────────
    #[error("Cancel failed: {0}")]
    Cancel(String),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Result not ready: {0}")]
    NotReady(String),

    // ── Local state ───────────────────────────────────────────────────────────
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Converts the error into a user-friendly presentation suitable for UI display.
    /// Never leaks the API key or auth headers.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            // ── File / parsing ────────────────────────────────────────────────
            AppError::UnsupportedFile(name) => ErrorPresentation {
                title: "Unsupported File".into(),
                message: format!(
                    "{} is not a supported upload. Only CSV and Excel files are accepted.",
                    name
                ),
                action: Some("Choose a .csv, .xls or .xlsx file".into()),
            },

            AppError::Parse(msg) => ErrorPresentation {
                title: "Invalid File".into(),
                message: format!("The file could not be read: {}", msg),
                action: Some("Fix the file and try again".into()),
            },

            // ── Submission ────────────────────────────────────────────────────
            AppError::Submission(msg) => ErrorPresentation {
                title: "Upload Rejected".into(),
                message: sanitize_message(msg, "The analysis service rejected the upload."),
                action: Some("Review the file and retry".into()),
            },

            AppError::MalformedResponse(_) => ErrorPresentation {
                title: "Unexpected Response".into(),
                message: "The analysis service returned a response this client could not understand."
                    .into(),
                action: Some("Retry the upload".into()),
            },

            // ── Job API ───────────────────────────────────────────────────────
            AppError::JobGone { job_id: _ } => ErrorPresentation {
                title: "Job Not Found".into(),
                message:
                    "The job no longer exists on the server. It may have been cancelled or deleted."
                        .into(),
                action: Some("Remove the job from the list".into()),
            },

            AppError::Server(msg) => ErrorPresentation {
                title: "Service Error".into(),
                message: sanitize_message(msg, "The analysis service reported an error."),
                action: Some("Try again later".into()),
            },

            AppError::Api(msg) => ErrorPresentation {
                title: "Request Failed".into(),
                message: sanitize_message(msg, "The analysis service rejected the request."),
                action: None,
            },

            // ── Network ───────────────────────────────────────────────────────
            AppError::ConnectionFailed(_) => ErrorPresentation {
                title: "Connection Failed".into(),
                message:
                    "Could not reach the analysis service. Please check your internet connection."
                        .into(),
                action: Some("Check network and retry".into()),
            },

            // ── Job actions ───────────────────────────────────────────────────
            AppError::Cancel(msg) => ErrorPresentation {
                title: "Cancel Failed".into(),
                message: sanitize_message(msg, "The job could not be cancelled."),
                action: Some("Try cancelling again".into()),
            },

            AppError::Download(msg) => ErrorPresentation {
                title: "Download Failed".into(),
                message: sanitize_message(msg, "The results could not be downloaded."),
                action: Some("Try the download again".into()),
            },

            AppError::NotReady(msg) => ErrorPresentation {
                title: "Results Not Ready".into(),
                message: sanitize_message(msg, "The job has not finished yet."),
                action: Some("Wait for the job to complete".into()),
            },

            // ── Local state ───────────────────────────────────────────────────
            AppError::Storage(_) => ErrorPresentation {
                title: "Local Storage Error".into(),
                message: "The tracked job list could not be read or written.".into(),
                action: Some("Try again".into()),
            },

            AppError::Config(msg) => ErrorPresentation {
                title: "Configuration Error".into(),
                message: sanitize_message(msg, "The client is not configured correctly."),
                action: Some("Check the environment settings".into()),
            },

            // ── Generic ───────────────────────────────────────────────────────
            AppError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}

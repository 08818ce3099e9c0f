//! Client configuration loaded from the environment.
//!
//! All settings come from `ACREBATCH_*` environment variables (a local `.env`
//! file is honored when present). The API URL and key are required; user
//! identity is optional because the backend is the enforcement point for
//! authentication.

use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::AppError;

/// Default polling interval between job status requests.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Default poll-attempt budget (~20 minutes at the default interval).
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 120;

/// Default directory for the local job database.
const DEFAULT_DATA_DIR: &str = ".acrebatch";

/// Runtime configuration for the batch client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the analysis service (e.g. "https://api.example.com").
    pub base_url: Url,
    /// API key sent as `x-api-key` on every request.
    pub api_key: String,
    /// User identifier sent as `x-user-id` when available.
    pub user_id: Option<String>,
    /// Email forwarded with submissions for completion notifications.
    pub email: Option<String>,
    /// Directory holding the local job database.
    pub data_dir: PathBuf,
    /// Interval between status polls for one job.
    pub poll_interval: Duration,
    /// Maximum number of status polls before the poller gives up.
    pub max_poll_attempts: u32,
}

impl ClientConfig {
    /// Loads configuration from the environment.
    ///
    /// # Errors
    ///
    /// `AppError::Config` when a required variable is missing or malformed.
    pub fn from_env() -> Result<Self, AppError> {
        let base_url = required("ACREBATCH_API_URL")?;
        let base_url = Url::parse(&base_url)
            .map_err(|e| AppError::Config(format!("ACREBATCH_API_URL is not a valid URL: {}", e)))?;

        let api_key = required("ACREBATCH_API_KEY")?;

        let poll_interval = match optional("ACREBATCH_POLL_SECS") {
            Some(raw) => {
                let secs: u64 = raw.parse().map_err(|_| {
                    AppError::Config(format!("ACREBATCH_POLL_SECS must be an integer, got {:?}", raw))
                })?;
                Duration::from_secs(secs.max(1))
            }
            None => DEFAULT_POLL_INTERVAL,
        };

        Ok(Self {
            base_url,
            api_key,
            user_id: optional("ACREBATCH_USER_ID"),
            email: optional("ACREBATCH_EMAIL"),
            data_dir: optional("ACREBATCH_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            poll_interval,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        })
    }

    /// Path of the SQLite file holding tracked jobs.
    pub fn jobs_db_path(&self) -> PathBuf {
        self.data_dir.join("jobs.db")
    }
}

fn required(key: &str) -> Result<String, AppError> {
    optional(key).ok_or_else(|| AppError::Config(format!("{} is not set", key)))
}

fn optional(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jobs_db_path_is_under_data_dir() {
        let config = ClientConfig {
            base_url: Url::parse("https://api.example.com").unwrap(),
            api_key: "k".into(),
            user_id: None,
            email: None,
            data_dir: PathBuf::from("/tmp/acrebatch-test"),
            poll_interval: DEFAULT_POLL_INTERVAL,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        };

        assert_eq!(
            config.jobs_db_path(),
            PathBuf::from("/tmp/acrebatch-test/jobs.db")
        );
    }
}

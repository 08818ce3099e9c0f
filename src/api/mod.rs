//! HTTP client for the batch analysis API.
//!
//! The remote service owns all job state; this module submits uploads, reads
//! progress, requests cancellation, and streams result downloads. Response
//! shapes vary between deployments (snake_case, camelCase, or a nested
//! `progress` object), so all parsing goes through one normalization layer in
//! [`types`].

pub mod client;
pub mod types;

pub use client::BatchApiClient;
pub use types::{JobProgress, JobStatus};

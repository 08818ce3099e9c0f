//! Upload/submission flow: turn a user-selected tabular file into a
//! server-side analysis job.
//!
//! The client parses only the header row (to drive column mapping) and
//! estimates the row count; the backend re-parses the full file itself.

pub mod mapping;
pub mod submit;
pub mod tabular;

pub use mapping::{ColumnMapping, RequiredField, REQUIRED_FIELDS};
pub use submit::submit_job;
pub use tabular::{count_data_rows, parse_headers, SPREADSHEET_SUFFIXES};

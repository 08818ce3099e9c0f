//! Header parsing and row counting for upload candidates.
//!
//! Only the first row is interpreted client-side; the row count is a
//! best-effort estimate that the first successful poll reconciles against
//! server truth.

use std::io::Cursor;
use std::path::Path;

use calamine::Reader;

use crate::error::AppError;

/// File suffixes the upload flow accepts; also used to scope job listings to
/// spreadsheet-derived jobs.
pub const SPREADSHEET_SUFFIXES: &[&str] = &[".csv", ".xls", ".xlsx"];

/// UTF-8 BOM bytes.
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// Recognized tabular formats, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularKind {
    Csv,
    Excel,
}

/// Classifies a path by extension.
///
/// # Errors
///
/// `AppError::UnsupportedFile` for anything that is not CSV or Excel,
/// mirroring the backend's own upload gate.
pub fn detect_kind(path: &Path) -> Result<TabularKind, AppError> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();

    if name.ends_with(".csv") {
        Ok(TabularKind::Csv)
    } else if name.ends_with(".xls") || name.ends_with(".xlsx") {
        Ok(TabularKind::Excel)
    } else {
        Err(AppError::UnsupportedFile(
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        ))
    }
}

/// Reads the ordered column names from the first row of a CSV/XLSX file.
///
/// # Errors
///
/// `AppError::Parse` when the file is empty, not valid UTF-8 (CSV), or has no
/// header row. `AppError::UnsupportedFile` for unrecognized extensions.
pub async fn parse_headers(path: &Path) -> Result<Vec<String>, AppError> {
    match detect_kind(path)? {
        TabularKind::Csv => parse_csv_headers(path).await,
        TabularKind::Excel => {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || excel_headers(&path))
                .await
                .map_err(|e| AppError::Internal(format!("Header parse task failed: {e}")))?
        }
    }
}

/// Best-effort count of data rows in the file.
///
/// For CSV this counts newline-delimited non-empty rows and subtracts the
/// header, so a trailing blank line does not inflate the count and a
/// header-only file yields 0.
pub async fn count_data_rows(path: &Path) -> Result<u64, AppError> {
    match detect_kind(path)? {
        TabularKind::Csv => {
            let data = read_file(path).await?;
            Ok(count_csv_rows(&data))
        }
        TabularKind::Excel => {
            let path = path.to_path_buf();
            tokio::task::spawn_blocking(move || excel_row_count(&path))
                .await
                .map_err(|e| AppError::Internal(format!("Row count task failed: {e}")))?
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CSV
// ─────────────────────────────────────────────────────────────────────────────

async fn parse_csv_headers(path: &Path) -> Result<Vec<String>, AppError> {
    let data = read_file(path).await?;

    if data.is_empty() {
        return Err(AppError::Parse("file is empty".into()));
    }

    // Strip a UTF-8 BOM so the first header name comes out clean.
    let data = data.strip_prefix(UTF8_BOM).unwrap_or(&data);

    if std::str::from_utf8(data).is_err() {
        return Err(AppError::Parse("file is not valid UTF-8".into()));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(data));

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| AppError::Parse(format!("could not read header row: {e}")))?
        .iter()
        .map(String::from)
        .collect();

    if headers.is_empty() || headers.iter().all(|h| h.trim().is_empty()) {
        return Err(AppError::Parse("file has no header row".into()));
    }

    Ok(headers)
}

/// Newline-delimited row count minus the header row.
fn count_csv_rows(data: &[u8]) -> u64 {
    let non_empty_lines = data
        .split(|b| *b == b'\n')
        .filter(|line| line.iter().any(|b| !b.is_ascii_whitespace()))
        .count() as u64;

    non_empty_lines.saturating_sub(1)
}

async fn read_file(path: &Path) -> Result<Vec<u8>, AppError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| AppError::Parse(format!("could not read file: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Excel
// ─────────────────────────────────────────────────────────────────────────────

fn excel_headers(path: &Path) -> Result<Vec<String>, AppError> {
    let range = first_sheet(path)?;
    let mut rows = range.rows();

    let header = rows
        .next()
        .ok_or_else(|| AppError::Parse("file has no header row".into()))?;

    let headers: Vec<String> = header
        .iter()
        .map(|cell| cell.to_string().trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(AppError::Parse("file has no header row".into()));
    }

    Ok(headers)
}

fn excel_row_count(path: &Path) -> Result<u64, AppError> {
    let range = first_sheet(path)?;

    // Skip the header row; ignore rows where every cell is empty so padding
    // at the bottom of a sheet does not inflate the estimate.
    let count = range
        .rows()
        .skip(1)
        .filter(|row| row.iter().any(|cell| !cell.to_string().trim().is_empty()))
        .count() as u64;

    Ok(count)
}

fn first_sheet(path: &Path) -> Result<calamine::Range<calamine::Data>, AppError> {
    let mut workbook = calamine::open_workbook_auto(path)
        .map_err(|e| AppError::Parse(format!("could not open workbook: {e}")))?;

    workbook
        .worksheet_range_at(0)
        .ok_or_else(|| AppError::Parse("workbook has no sheets".into()))?
        .map_err(|e| AppError::Parse(format!("could not read sheet: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

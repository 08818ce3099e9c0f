//! SQLite persistence for the job registry.
//!
//! The database file is owned exclusively by the registry; no other part of
//! the client reads or writes it. Schema evolution is gated on
//! `PRAGMA user_version` so future versions can migrate persisted jobs.

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Duration;

use rusqlite::Connection;

use crate::api::types::JobStatus;
use crate::error::AppError;
use crate::registry::record::JobRecord;

/// Current schema version. Increment when adding new migrations.
const SCHEMA_VERSION: i32 = 1;

/// V1 schema: the tracked-jobs table.
const V1_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS batch_jobs (
    job_id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL,
    total_rows INTEGER NOT NULL DEFAULT 0,
    completed_rows INTEGER NOT NULL DEFAULT 0,
    filename TEXT NOT NULL,
    created_at TEXT NOT NULL,
    error_message TEXT
);

CREATE INDEX IF NOT EXISTS idx_batch_jobs_status ON batch_jobs(status);
"#;

// ─────────────────────────────────────────────────────────────────────────────
// RegistryStore Trait
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence seam for the registry.
///
/// Decouples the registry from SQLite so tests can observe persistence
/// behavior without a real database where that is more convenient.
pub trait RegistryStore: Send + Sync {
    /// Inserts or replaces the persisted row for a record.
    fn upsert<'a>(
        &'a self,
        record: &'a JobRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;

    /// Deletes the persisted row for a job, if any.
    fn remove<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>>;

    /// Loads all persisted records that are still in flight, dropping
    /// terminal rows. A reload must not resurrect dead polling sessions.
    fn load_active(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<JobRecord>, AppError>> + Send + '_>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed [`RegistryStore`].
#[derive(Debug)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at the given path and runs
    /// migrations. Parent directories are created as required.
    pub async fn open(db_path: PathBuf) -> Result<Self, AppError> {
        let path = db_path.clone();

        tokio::task::spawn_blocking(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    AppError::Storage(format!("Failed to create database directory: {e}"))
                })?;
            }

            let mut conn = Connection::open(&path)
                .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;

            configure_connection(&conn)?;
            run_migrations(&mut conn)?;

            Ok::<_, AppError>(())
        })
        .await
        .map_err(|e| AppError::Internal(format!("Database init task failed: {e}")))??;

        Ok(Self { db_path })
    }
}

impl RegistryStore for SqliteStore {
    fn upsert<'a>(
        &'a self,
        record: &'a JobRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        let db_path = self.db_path.clone();
        let record = record.clone();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path)
                    .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;

                configure_connection(&conn)?;

                conn.execute(
                    r#"
                    INSERT INTO batch_jobs (job_id, status, total_rows, completed_rows, filename, created_at, error_message)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                    ON CONFLICT(job_id) DO UPDATE SET
                        status = excluded.status,
                        total_rows = excluded.total_rows,
                        completed_rows = excluded.completed_rows,
                        filename = excluded.filename,
                        error_message = excluded.error_message
                    "#,
                    rusqlite::params![
                        record.job_id,
                        record.status.as_str(),
                        record.total_rows as i64,
                        record.completed_rows as i64,
                        record.filename,
                        record.created_at,
                        record.error,
                    ],
                )
                .map_err(|e| AppError::Storage(format!("Failed to upsert job: {e}")))?;

                Ok::<_, AppError>(())
            })
            .await
            .map_err(|e| AppError::Internal(format!("Upsert job task failed: {e}")))?
        })
    }

    fn remove<'a>(
        &'a self,
        job_id: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<(), AppError>> + Send + 'a>> {
        let db_path = self.db_path.clone();
        let job_id = job_id.to_string();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path)
                    .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;

                configure_connection(&conn)?;

                conn.execute("DELETE FROM batch_jobs WHERE job_id = ?1", [&job_id])
                    .map_err(|e| AppError::Storage(format!("Failed to delete job: {e}")))?;

                Ok::<_, AppError>(())
            })
            .await
            .map_err(|e| AppError::Internal(format!("Delete job task failed: {e}")))?
        })
    }

    fn load_active(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<JobRecord>, AppError>> + Send + '_>> {
        let db_path = self.db_path.clone();

        Box::pin(async move {
            tokio::task::spawn_blocking(move || {
                let conn = Connection::open(&db_path)
                    .map_err(|e| AppError::Storage(format!("Failed to open database: {e}")))?;

                configure_connection(&conn)?;

                let terminal_states = [
                    JobStatus::Completed.as_str(),
                    JobStatus::Failed.as_str(),
                    JobStatus::Cancelled.as_str(),
                ];

                // Terminal rows are dropped, not restored; clearing them here
                // keeps the file from accumulating dead jobs.
                conn.execute(
                    "DELETE FROM batch_jobs WHERE status IN (?1, ?2, ?3)",
                    rusqlite::params![
                        terminal_states[0],
                        terminal_states[1],
                        terminal_states[2]
                    ],
                )
                .map_err(|e| AppError::Storage(format!("Failed to prune terminal jobs: {e}")))?;

                let mut stmt = conn
                    .prepare(
                        r#"
                        SELECT job_id, status, total_rows, completed_rows, filename, created_at, error_message
                        FROM batch_jobs
                        ORDER BY created_at DESC
                        "#,
                    )
                    .map_err(|e| AppError::Storage(format!("Failed to prepare query: {e}")))?;

                let records = stmt
                    .query_map([], |row| {
                        let status_str: String = row.get(1)?;
                        Ok(JobRecord {
                            job_id: row.get(0)?,
                            // Unknown strings cannot appear here; the column is
                            // only ever written from JobStatus::as_str.
                            status: JobStatus::parse(&status_str).unwrap_or(JobStatus::Queued),
                            total_rows: row.get::<_, i64>(2)?.max(0) as u64,
                            completed_rows: row.get::<_, i64>(3)?.max(0) as u64,
                            filename: row.get(4)?,
                            created_at: row.get(5)?,
                            error: row.get(6)?,
                        })
                    })
                    .map_err(|e| AppError::Storage(format!("Failed to query jobs: {e}")))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| AppError::Storage(format!("Failed to collect jobs: {e}")))?;

                Ok::<_, AppError>(records)
            })
            .await
            .map_err(|e| AppError::Internal(format!("Load jobs task failed: {e}")))?
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Connection Helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Configures connection with busy timeout and WAL mode.
fn configure_connection(conn: &Connection) -> Result<(), AppError> {
    conn.busy_timeout(Duration::from_secs(10))
        .map_err(|e| AppError::Storage(format!("Failed to set busy timeout: {e}")))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(|e| AppError::Storage(format!("Failed to set WAL mode: {e}")))?;

    Ok(())
}

/// Runs database migrations using PRAGMA user_version.
fn run_migrations(conn: &mut Connection) -> Result<(), AppError> {
    let current_version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| AppError::Storage(format!("Failed to get schema version: {e}")))?;

    if current_version >= SCHEMA_VERSION {
        return Ok(());
    }

    let tx = conn
        .transaction()
        .map_err(|e| AppError::Storage(format!("Failed to start migration transaction: {e}")))?;

    if current_version < 1 {
        tx.execute_batch(V1_SCHEMA)
            .map_err(|e| AppError::Storage(format!("V1 migration failed: {e}")))?;
    }

    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .map_err(|e| AppError::Storage(format!("Failed to update schema version: {e}")))?;

    tx.commit()
        .map_err(|e| AppError::Storage(format!("Failed to commit migration: {e}")))?;

    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_db_path() -> (TempDir, PathBuf) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("jobs.db");
        (temp_dir, db_path)
    }

    fn record(job_id: &str, status: JobStatus) -> JobRecord {
        JobRecord {
            job_id: job_id.to_string(),
            status,
            total_rows: 10,
            completed_rows: 4,
            filename: "parcels.csv".to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            error: None,
        }
    }

    #[tokio::test]
    async fn open_creates_file_and_schema() {
        let (_temp_dir, db_path) = test_db_path();

        let _store = SqliteStore::open(db_path.clone())
            .await
            .expect("Failed to open store");

        assert!(db_path.exists(), "Database file should exist");

        let conn = Connection::open(&db_path).expect("Failed to open db");
        let version: i32 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .expect("Failed to get version");
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let (_temp_dir, db_path) = test_db_path();

        let _store1 = SqliteStore::open(db_path.clone())
            .await
            .expect("First open should succeed");
        let _store2 = SqliteStore::open(db_path)
            .await
            .expect("Second open should succeed");
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("dir").join("jobs.db");

        SqliteStore::open(db_path.clone())
            .await
            .expect("Should create nested directories");

        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn upsert_then_load_round_trips_active_jobs() {
        let (_temp_dir, db_path) = test_db_path();
        let store = SqliteStore::open(db_path).await.unwrap();

        let queued = record("q-1", JobStatus::Queued);
        let processing = record("p-1", JobStatus::Processing);
        store.upsert(&queued).await.unwrap();
        store.upsert(&processing).await.unwrap();

        let loaded = store.load_active().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().any(|r| *r == queued));
        assert!(loaded.iter().any(|r| *r == processing));
    }

    #[tokio::test]
    async fn load_drops_terminal_rows() {
        let (_temp_dir, db_path) = test_db_path();
        let store = SqliteStore::open(db_path.clone()).await.unwrap();

        store.upsert(&record("q-1", JobStatus::Queued)).await.unwrap();
        store
            .upsert(&record("c-1", JobStatus::Completed))
            .await
            .unwrap();
        store.upsert(&record("f-1", JobStatus::Failed)).await.unwrap();
        store
            .upsert(&record("x-1", JobStatus::Cancelled))
            .await
            .unwrap();

        let loaded = store.load_active().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].job_id, "q-1");

        // The prune is durable, not just a view filter.
        let conn = Connection::open(&db_path).unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM batch_jobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn upsert_replaces_existing_row() {
        let (_temp_dir, db_path) = test_db_path();
        let store = SqliteStore::open(db_path).await.unwrap();

        let mut job = record("j-1", JobStatus::Queued);
        store.upsert(&job).await.unwrap();

        job.status = JobStatus::Processing;
        job.completed_rows = 9;
        store.upsert(&job).await.unwrap();

        let loaded = store.load_active().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, JobStatus::Processing);
        assert_eq!(loaded[0].completed_rows, 9);
    }

    #[tokio::test]
    async fn remove_deletes_row_and_is_idempotent() {
        let (_temp_dir, db_path) = test_db_path();
        let store = SqliteStore::open(db_path).await.unwrap();

        store.upsert(&record("j-1", JobStatus::Queued)).await.unwrap();
        store.remove("j-1").await.unwrap();
        store.remove("j-1").await.unwrap();

        let loaded = store.load_active().await.unwrap();
        assert!(loaded.is_empty());
    }
}

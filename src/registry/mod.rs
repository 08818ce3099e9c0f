//! Persisted registry of batch jobs tracked by this client.
//!
//! The registry is the single source of truth for "what jobs does this
//! session know about". It holds records in memory for fast reads and writes
//! every mutation through to its store, so a restart restores in-flight jobs
//! (and only those; terminal jobs are deliberately not resurrected).

pub mod record;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

pub use record::{JobRecord, JobUpdate};
pub use store::{RegistryStore, SqliteStore};

use crate::error::AppError;

/// In-memory job collection with write-through persistence.
///
/// All mutations go through [`add`](Self::add), [`update`](Self::update) and
/// [`remove`](Self::remove); pollers and the UI must never replace a record
/// wholesale, or one writer would clobber fields merged by another between
/// ticks.
pub struct JobRegistry {
    jobs: Mutex<HashMap<String, JobRecord>>,
    store: Arc<dyn RegistryStore>,
}

impl JobRegistry {
    /// Hydrates the registry from its store. Terminal records are dropped by
    /// the store; everything restored here is still in flight.
    pub async fn load(store: Arc<dyn RegistryStore>) -> Result<Self, AppError> {
        let records = store.load_active().await?;
        let jobs = records
            .into_iter()
            .map(|r| (r.job_id.clone(), r))
            .collect();

        Ok(Self {
            jobs: Mutex::new(jobs),
            store,
        })
    }

    /// Inserts a new record. First writer wins: if the job id is already
    /// present the call is a no-op and returns `false`.
    pub async fn add(&self, record: JobRecord) -> Result<bool, AppError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.contains_key(&record.job_id) {
            return Ok(false);
        }

        self.persist(&record).await?;
        jobs.insert(record.job_id.clone(), record);
        Ok(true)
    }

    /// Merges fields into an existing record and returns the updated
    /// snapshot. Unknown job ids are a no-op returning `None`; an update must
    /// never create a phantom record.
    pub async fn update(
        &self,
        job_id: &str,
        update: JobUpdate,
    ) -> Result<Option<JobRecord>, AppError> {
        let mut jobs = self.jobs.lock().await;
        let Some(record) = jobs.get_mut(job_id) else {
            return Ok(None);
        };

        if record.apply(&update) {
            let snapshot = record.clone();
            self.persist(&snapshot).await?;
            return Ok(Some(snapshot));
        }

        Ok(Some(record.clone()))
    }

    /// Deletes a record. Returns whether it existed. The owning poller does
    /// not learn about this implicitly; teardown is triggered from the same
    /// call site (see the tracker).
    pub async fn remove(&self, job_id: &str) -> Result<bool, AppError> {
        let mut jobs = self.jobs.lock().await;
        if jobs.remove(job_id).is_none() {
            return Ok(false);
        }

        self.store.remove(job_id).await?;
        Ok(true)
    }

    /// Returns the current record for a job, if known.
    pub async fn get(&self, job_id: &str) -> Option<JobRecord> {
        self.jobs.lock().await.get(job_id).cloned()
    }

    /// All records, newest first.
    pub async fn list_all(&self) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<JobRecord> = jobs.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Records whose filename ends with one of the given suffixes, newest
    /// first. Used to scope the job list to spreadsheet-derived jobs.
    pub async fn list_by_filename_suffix(&self, suffixes: &[&str]) -> Vec<JobRecord> {
        let jobs = self.jobs.lock().await;
        let mut records: Vec<JobRecord> = jobs
            .values()
            .filter(|r| {
                let name = r.filename.to_ascii_lowercase();
                suffixes.iter().any(|s| name.ends_with(&s.to_ascii_lowercase()))
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records
    }

    /// Job ids of records that are still in flight.
    pub async fn active_job_ids(&self) -> Vec<String> {
        self.jobs
            .lock()
            .await
            .values()
            .filter(|r| !r.is_terminal())
            .map(|r| r.job_id.clone())
            .collect()
    }

    /// Write-through: in-flight records are upserted; a record that just
    /// reached a terminal state is deleted from the store instead, so a
    /// reload restores only jobs that might still be running.
    async fn persist(&self, record: &JobRecord) -> Result<(), AppError> {
        if record.is_terminal() {
            self.store.remove(&record.job_id).await
        } else {
            self.store.upsert(record).await
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::JobStatus;
    use tempfile::TempDir;

    async fn registry_with_store() -> (TempDir, Arc<SqliteStore>, JobRegistry) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            SqliteStore::open(temp_dir.path().join("jobs.db"))
                .await
                .unwrap(),
        );
        let registry = JobRegistry::load(store.clone()).await.unwrap();
        (temp_dir, store, registry)
    }

    fn queued(job_id: &str, filename: &str) -> JobRecord {
        JobRecord::new_queued(job_id.into(), filename.into(), 10)
    }

    #[tokio::test]
    async fn add_is_idempotent_first_writer_wins() {
        let (_tmp, _store, registry) = registry_with_store().await;

        let first = queued("J1", "first.csv");
        let mut second = queued("J1", "second.csv");
        second.total_rows = 99;

        assert!(registry.add(first.clone()).await.unwrap());
        assert!(!registry.add(second).await.unwrap());

        let stored = registry.get("J1").await.unwrap();
        assert_eq!(stored.filename, "first.csv");
        assert_eq!(stored.total_rows, 10);
        assert_eq!(registry.list_all().await.len(), 1);
    }

    #[tokio::test]
    async fn update_unknown_job_is_noop() {
        let (_tmp, _store, registry) = registry_with_store().await;

        let result = registry
            .update("ghost", JobUpdate::status(JobStatus::Processing))
            .await
            .unwrap();

        assert!(result.is_none());
        assert!(registry.get("ghost").await.is_none(), "no phantom record");
    }

    #[tokio::test]
    async fn update_merges_and_returns_snapshot() {
        let (_tmp, _store, registry) = registry_with_store().await;
        registry.add(queued("J1", "parcels.csv")).await.unwrap();

        let updated = registry
            .update(
                "J1",
                JobUpdate {
                    status: Some(JobStatus::Processing),
                    completed_rows: Some(4),
                    total_rows: Some(12),
                    ..JobUpdate::default()
                },
            )
            .await
            .unwrap()
            .unwrap();

        assert_eq!(updated.status, JobStatus::Processing);
        assert_eq!(updated.completed_rows, 4);
        assert_eq!(updated.total_rows, 12);
        // The filename set at submission survives partial updates.
        assert_eq!(updated.filename, "parcels.csv");
    }

    #[tokio::test]
    async fn remove_reports_existence() {
        let (_tmp, _store, registry) = registry_with_store().await;
        registry.add(queued("J1", "parcels.csv")).await.unwrap();

        assert!(registry.remove("J1").await.unwrap());
        assert!(!registry.remove("J1").await.unwrap());
        assert!(registry.get("J1").await.is_none());
    }

    #[tokio::test]
    async fn reload_restores_only_non_terminal_records() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("jobs.db");

        {
            let store = Arc::new(SqliteStore::open(db_path.clone()).await.unwrap());
            let registry = JobRegistry::load(store).await.unwrap();

            registry.add(queued("alive-1", "a.csv")).await.unwrap();
            registry.add(queued("alive-2", "b.csv")).await.unwrap();
            registry.add(queued("done", "c.csv")).await.unwrap();
            registry.add(queued("dead", "d.csv")).await.unwrap();

            registry
                .update("alive-2", JobUpdate::status(JobStatus::Processing))
                .await
                .unwrap();
            registry
                .update("done", JobUpdate::status(JobStatus::Completed))
                .await
                .unwrap();
            registry
                .update("dead", JobUpdate::status_with_error(JobStatus::Failed, "boom"))
                .await
                .unwrap();
        }

        // New session against the same file.
        let store = Arc::new(SqliteStore::open(db_path).await.unwrap());
        let registry = JobRegistry::load(store).await.unwrap();

        let restored = registry.list_all().await;
        let mut ids: Vec<&str> = restored.iter().map(|r| r.job_id.as_str()).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec!["alive-1", "alive-2"]);

        // Terminal records were dropped by design, not merely hidden.
        assert!(registry.get("done").await.is_none());
        assert!(registry.get("dead").await.is_none());
    }

    #[tokio::test]
    async fn terminal_records_stay_visible_in_session() {
        // A completed job remains on screen until removed; only the
        // persisted copy is gone.
        let (_tmp, store, registry) = registry_with_store().await;
        registry.add(queued("J1", "parcels.csv")).await.unwrap();
        registry
            .update("J1", JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();

        assert_eq!(
            registry.get("J1").await.unwrap().status,
            JobStatus::Completed
        );
        assert!(store.load_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_by_filename_suffix_filters_and_sorts() {
        let (_tmp, _store, registry) = registry_with_store().await;

        let mut older = queued("J1", "ranch.csv");
        older.created_at = "2026-08-01T00:00:00+00:00".into();
        let mut newer = queued("J2", "FARMS.XLSX");
        newer.created_at = "2026-08-02T00:00:00+00:00".into();
        let other = queued("J3", "notes.txt");

        registry.add(older).await.unwrap();
        registry.add(newer).await.unwrap();
        registry.add(other).await.unwrap();

        let spreadsheets = registry
            .list_by_filename_suffix(&[".csv", ".xls", ".xlsx"])
            .await;

        let ids: Vec<&str> = spreadsheets.iter().map(|r| r.job_id.as_str()).collect();
        assert_eq!(ids, vec!["J2", "J1"], "newest first, .txt excluded");
    }

    #[tokio::test]
    async fn active_job_ids_excludes_terminal() {
        let (_tmp, _store, registry) = registry_with_store().await;
        registry.add(queued("J1", "a.csv")).await.unwrap();
        registry.add(queued("J2", "b.csv")).await.unwrap();
        registry
            .update("J2", JobUpdate::status(JobStatus::Cancelled))
            .await
            .unwrap();

        assert_eq!(registry.active_job_ids().await, vec!["J1".to_string()]);
    }
}

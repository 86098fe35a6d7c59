//! JSON snapshot job store.
//!
//! The whole state is kept in memory and written to disk after every change:
//! first to a temporary file next to the target, then renamed over it, so a
//! crash leaves either the old or the new snapshot.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{memory::MemoryStore, JobStore, Precondition, StoreError};
use crate::model::{JobId, JobRecord, OwnerId};

#[derive(Serialize, Deserialize)]
struct Snapshot {
    jobs: Vec<JobRecord>,
}

/// File-backed job store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    inner: MemoryStore,
    /// Serializes writers so snapshots land in commit order.
    write_lock: Mutex<()>,
}

impl FileStore {
    /// Open a store, loading the snapshot if it exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Snapshot>(&bytes)?.jobs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), jobs = records.len(), "Opened job store");

        Ok(Self {
            path,
            inner: MemoryStore::with_records(records),
            write_lock: Mutex::new(()),
        })
    }

    /// Path of the snapshot file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self) -> Result<(), StoreError> {
        let mut jobs = self.inner.snapshot().await;
        jobs.sort_by_key(|r| r.job.created_at);
        let bytes = serde_json::to_vec_pretty(&Snapshot { jobs })?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = bytes.len(), "Snapshot written");
        Ok(())
    }
}

#[async_trait]
impl JobStore for FileStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.inner.insert(record).await?;
        self.persist().await
    }

    async fn get(&self, id: JobId) -> Result<JobRecord, StoreError> {
        self.inner.get(id).await
    }

    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<JobRecord>, StoreError> {
        self.inner.find_by_intent(intent_id).await
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list_by_owner(owner).await
    }

    async fn list_in_flight(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.inner.list_in_flight().await
    }

    async fn compare_and_swap(
        &self,
        expected: Precondition,
        record: JobRecord,
    ) -> Result<JobRecord, StoreError> {
        let _guard = self.write_lock.lock().await;
        let committed = self.inner.compare_and_swap(expected, record).await?;
        self.persist().await?;
        Ok(committed)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            Some(dir) => tokio::fs::metadata(dir).await.map(|_| ()).map_err(Into::into),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::JobStatus;
    use crate::store::tests::{exercise_store, sample_record};

    #[tokio::test]
    async fn test_file_store_contract() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path().join("jobs.json")).await.unwrap();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn test_state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("jobs.json");

        let record = sample_record("alice");
        let id = record.job.id;
        {
            let store = FileStore::open(&path).await.unwrap();
            store.insert(record.clone()).await.unwrap();
            let mut next = record.clone();
            next.job.status = JobStatus::PendingPayment;
            store
                .compare_and_swap(Precondition::of(&record), next)
                .await
                .unwrap();
        }

        let reopened = FileStore::open(&path).await.unwrap();
        let loaded = reopened.get(id).await.unwrap();
        assert_eq!(loaded.job.status, JobStatus::PendingPayment);
        assert_eq!(loaded.job.version, 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.json");
        std::fs::write(&path, b"{not json").unwrap();

        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}

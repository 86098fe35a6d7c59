//! Durable job state.
//!
//! Every write is a compare-and-swap on the record's `(version, status)` so
//! concurrent handlers cannot silently overwrite each other.

mod file;
mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{JobId, JobRecord, JobStatus, OwnerId};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The stored record no longer matches the expected version or status.
    #[error("job {job_id} was modified concurrently")]
    Conflict { job_id: JobId },

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What the caller read before deciding on a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precondition {
    pub version: u64,
    pub status: JobStatus,
}

impl Precondition {
    /// Precondition matching the record as read.
    #[must_use]
    pub fn of(record: &JobRecord) -> Self {
        Self {
            version: record.job.version,
            status: record.job.status,
        }
    }
}

/// Persistent store of job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new record.
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError>;

    /// Fetch a record.
    async fn get(&self, id: JobId) -> Result<JobRecord, StoreError>;

    /// Find the record owning a payment intent (current or superseded order).
    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// All records of an owner, newest first.
    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<JobRecord>, StoreError>;

    /// Records with outstanding work for reconciliation.
    async fn list_in_flight(&self) -> Result<Vec<JobRecord>, StoreError>;

    /// Replace a record if it still matches `expected`.
    ///
    /// The stored version is bumped; the committed record is returned.
    async fn compare_and_swap(
        &self,
        expected: Precondition,
        record: JobRecord,
    ) -> Result<JobRecord, StoreError>;

    /// Whether the backing storage is usable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Check a precondition against the stored record and prepare the next version.
fn prepare_swap(
    current: &JobRecord,
    expected: Precondition,
    mut next: JobRecord,
) -> Result<JobRecord, StoreError> {
    if Precondition::of(current) != expected {
        return Err(StoreError::Conflict {
            job_id: current.job.id,
        });
    }
    next.job.version = current.job.version + 1;
    Ok(next)
}

fn newest_first(records: &mut [JobRecord]) {
    records.sort_by(|a, b| b.job.created_at.cmp(&a.job.created_at));
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::model::{Costs, TrainingConfig, TrainingJob};
    use chrono::Utc;

    pub(crate) fn sample_record(owner: &str) -> JobRecord {
        let config = TrainingConfig {
            project_name: "portrait".to_string(),
            model_type: "character".to_string(),
            base_model: "stabilityai/stable-diffusion-xl-base-1.0".to_string(),
            image_set: "uploads/set-1".to_string(),
            image_count: 12,
            steps: 2000,
            learning_rate: 0.0001,
            train_text_encoder: false,
            trigger_token: "sks".to_string(),
            repeat: 5,
            gpu_preferences: vec!["NVIDIA_L4".to_string()],
        };
        JobRecord::new(TrainingJob::draft(
            owner.into(),
            config,
            Costs::zero(),
            Utc::now(),
        ))
    }

    pub(crate) async fn exercise_store(store: &dyn JobStore) {
        let record = sample_record("alice");
        let id = record.job.id;
        store.insert(record.clone()).await.unwrap();
        assert!(matches!(
            store.insert(record.clone()).await,
            Err(StoreError::AlreadyExists(_))
        ));

        let mut next = record.clone();
        next.job.status = JobStatus::PendingPayment;
        let committed = store
            .compare_and_swap(Precondition::of(&record), next.clone())
            .await
            .unwrap();
        assert_eq!(committed.job.version, 1);

        // The first read is now stale.
        let err = store
            .compare_and_swap(Precondition::of(&record), next)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { job_id } if job_id == id));

        let stored = store.get(id).await.unwrap();
        assert_eq!(stored.job.status, JobStatus::PendingPayment);
        assert_eq!(store.list_by_owner(&"alice".into()).await.unwrap().len(), 1);
        assert!(store.list_by_owner(&"bob".into()).await.unwrap().is_empty());
        assert!(store.list_in_flight().await.unwrap().is_empty());
        assert!(matches!(
            store.get(JobId::new()).await,
            Err(StoreError::NotFound(_))
        ));
    }
}

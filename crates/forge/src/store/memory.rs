//! In-memory job store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{newest_first, prepare_swap, JobStore, Precondition, StoreError};
use crate::model::{JobId, JobRecord, OwnerId};

/// Job store held in process memory. State is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a store from existing records.
    #[must_use]
    pub fn with_records(records: impl IntoIterator<Item = JobRecord>) -> Self {
        Self {
            records: RwLock::new(records.into_iter().map(|r| (r.job.id, r)).collect()),
        }
    }

    /// Copy of every record.
    pub async fn snapshot(&self) -> Vec<JobRecord> {
        self.records.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.job.id) {
            return Err(StoreError::AlreadyExists(record.job.id));
        }
        records.insert(record.job.id, record);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<JobRecord, StoreError> {
        self.records
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn find_by_intent(&self, intent_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .find(|r| r.has_intent(intent_id))
            .cloned())
    }

    async fn list_by_owner(&self, owner: &OwnerId) -> Result<Vec<JobRecord>, StoreError> {
        let mut list: Vec<JobRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| &r.job.owner == owner)
            .cloned()
            .collect();
        newest_first(&mut list);
        Ok(list)
    }

    async fn list_in_flight(&self) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.is_in_flight())
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        expected: Precondition,
        record: JobRecord,
    ) -> Result<JobRecord, StoreError> {
        let mut records = self.records.write().await;
        let id = record.job.id;
        let current = records.get(&id).ok_or(StoreError::NotFound(id))?;
        let next = prepare_swap(current, expected, record)?;
        records.insert(id, next.clone());
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::exercise_store;

    #[tokio::test]
    async fn test_memory_store_contract() {
        exercise_store(&MemoryStore::new()).await;
    }
}

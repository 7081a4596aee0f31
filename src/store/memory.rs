//! In-process store, for tests and for running without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::model::JobKey;
use crate::store::traits::{
    BatchRecord, BatchStore, JobSnapshot, OwnerResult, ResultStore, SnapshotStore,
};

#[derive(Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<JobKey, JobSnapshot>>,
    results: RwLock<HashMap<JobKey, OwnerResult>>,
    batches: RwLock<HashMap<Uuid, BatchRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of owners with a persisted result.
    pub async fn result_count(&self) -> usize {
        self.results.read().await.len()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn put_snapshot(&self, snapshot: &JobSnapshot) -> Result<(), DatabaseError> {
        let mut snapshots = self.snapshots.write().await;
        let mut next = snapshot.clone();
        if let Some(existing) = snapshots.get(&snapshot.key) {
            if existing.job_id == snapshot.job_id {
                next.reconciled |= existing.reconciled;
            }
        }
        snapshots.insert(snapshot.key.clone(), next);
        Ok(())
    }

    async fn get_snapshot(&self, key: &JobKey) -> Result<Option<JobSnapshot>, DatabaseError> {
        Ok(self.snapshots.read().await.get(key).cloned())
    }

    async fn delete_snapshot(&self, key: &JobKey) -> Result<(), DatabaseError> {
        self.snapshots.write().await.remove(key);
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<JobSnapshot>, DatabaseError> {
        let mut all: Vec<JobSnapshot> = self.snapshots.read().await.values().cloned().collect();
        all.sort_by_key(|s| s.updated_at);
        Ok(all)
    }

    async fn mark_reconciled(&self, key: &JobKey, job_id: Uuid) -> Result<bool, DatabaseError> {
        match self.snapshots.write().await.get_mut(key) {
            Some(snapshot) if snapshot.job_id == job_id => {
                snapshot.reconciled = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ResultStore for MemoryStore {
    async fn persist_result(
        &self,
        owner: &JobKey,
        job_id: Uuid,
        result: &str,
    ) -> Result<(), DatabaseError> {
        self.results.write().await.insert(
            owner.clone(),
            OwnerResult {
                job_id,
                result: result.to_string(),
            },
        );
        Ok(())
    }

    async fn fetch_result(&self, owner: &JobKey) -> Result<Option<OwnerResult>, DatabaseError> {
        Ok(self.results.read().await.get(owner).cloned())
    }
}

#[async_trait]
impl BatchStore for MemoryStore {
    async fn put_batch(&self, batch: &BatchRecord) -> Result<(), DatabaseError> {
        self.batches.write().await.insert(batch.id, batch.clone());
        Ok(())
    }

    async fn delete_batch(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.batches.write().await.remove(&id);
        Ok(())
    }

    async fn list_batches(&self) -> Result<Vec<BatchRecord>, DatabaseError> {
        let mut all: Vec<BatchRecord> = self.batches.read().await.values().cloned().collect();
        all.sort_by_key(|b| b.created_at);
        Ok(all)
    }
}

//! Storage traits for job snapshots and reconciled results.
//!
//! The local [`SnapshotStore`] and [`BatchStore`] survive restarts; the
//! [`ResultStore`] is the authoritative record of what each owner ended up
//! with. One backend may implement all of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::DatabaseError;
use crate::jobs::classifier::ClassifiedError;
use crate::jobs::model::{JobKey, JobKind, JobRecord, JobStatus};

/// The persisted subset of a [`JobRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct JobSnapshot {
    pub key: JobKey,
    pub job_id: Uuid,
    pub kind: JobKind,
    pub status: JobStatus,
    pub external_id: Option<String>,
    pub secondary_id: Option<String>,
    pub result: Option<String>,
    pub error: Option<ClassifiedError>,
    pub attempts: u32,
    pub progress: Option<u8>,
    /// Result has been written to the [`ResultStore`].
    pub reconciled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    pub fn from_record(record: &JobRecord) -> Self {
        Self {
            key: record.key.clone(),
            job_id: record.job_id,
            kind: record.kind,
            status: record.status,
            external_id: record.external_id.clone(),
            secondary_id: record.secondary_id.clone(),
            result: record.result.clone(),
            error: record.error.clone(),
            attempts: record.attempts,
            progress: record.progress,
            reconciled: false,
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    /// Rebuild a record. Transition history is not persisted.
    pub fn into_record(self) -> JobRecord {
        JobRecord {
            job_id: self.job_id,
            key: self.key,
            kind: self.kind,
            status: self.status,
            external_id: self.external_id,
            secondary_id: self.secondary_id,
            attempts: self.attempts,
            progress: self.progress,
            result: self.result,
            error: self.error,
            created_at: self.created_at,
            last_polled_at: None,
            updated_at: self.updated_at,
            transitions: Vec::new(),
        }
    }
}

/// An owner's recorded result and the job that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerResult {
    pub job_id: Uuid,
    pub result: String,
}

/// Local durable storage of the latest snapshot per key.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot for `snapshot.key`.
    ///
    /// The `reconciled` flag of an existing row for the same job id is kept.
    async fn put_snapshot(&self, snapshot: &JobSnapshot) -> Result<(), DatabaseError>;

    async fn get_snapshot(&self, key: &JobKey) -> Result<Option<JobSnapshot>, DatabaseError>;

    async fn delete_snapshot(&self, key: &JobKey) -> Result<(), DatabaseError>;

    async fn list_snapshots(&self) -> Result<Vec<JobSnapshot>, DatabaseError>;

    /// Flag the snapshot as reconciled, only if it still belongs to `job_id`.
    /// Returns whether a row was updated.
    async fn mark_reconciled(&self, key: &JobKey, job_id: Uuid) -> Result<bool, DatabaseError>;
}

/// Authoritative per-owner result storage.
#[async_trait]
pub trait ResultStore: Send + Sync {
    /// Record `result`, produced by job `job_id`, as the owner's output.
    async fn persist_result(
        &self,
        owner: &JobKey,
        job_id: Uuid,
        result: &str,
    ) -> Result<(), DatabaseError>;

    /// Result previously recorded for `owner`, if the store can tell.
    async fn fetch_result(&self, _owner: &JobKey) -> Result<Option<OwnerResult>, DatabaseError> {
        Ok(None)
    }
}

/// Metadata of an open batch session. Slot state lives in the snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRecord {
    pub id: Uuid,
    pub kind: JobKind,
    pub config: BatchConfig,
    pub created_at: DateTime<Utc>,
}

/// Local durable storage of open batch sessions.
#[async_trait]
pub trait BatchStore: Send + Sync {
    async fn put_batch(&self, batch: &BatchRecord) -> Result<(), DatabaseError>;

    async fn delete_batch(&self, id: Uuid) -> Result<(), DatabaseError>;

    /// Every open session, oldest first.
    async fn list_batches(&self) -> Result<Vec<BatchRecord>, DatabaseError>;
}

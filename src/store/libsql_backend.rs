//! libSQL backend for job snapshots, batch sessions and owner results.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::BatchConfig;
use crate::error::DatabaseError;
use crate::jobs::classifier::ClassifiedError;
use crate::jobs::model::{JobKey, JobKind, JobStatus};
use crate::store::migrations;
use crate::store::traits::{
    BatchRecord, BatchStore, JobSnapshot, OwnerResult, ResultStore, SnapshotStore,
};

/// Snapshot and owner-result storage over one reused libSQL connection.
pub struct LibSqlBackend {
    // Kept for the lifetime of the connection.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) the database file at `path`, creating parent
    /// directories as needed, and migrate it.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Cannot create {}: {e}", parent.display()))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Cannot open {}: {e}", path.display())))?;
        let backend = Self::connect(db).await?;
        info!(path = %path.display(), "Snapshot database ready");
        Ok(backend)
    }

    /// A throwaway in-memory database.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Cannot open in-memory database: {e}")))?;
        Self::connect(db).await
    }

    async fn connect(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Cannot connect: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            _db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

/// Timestamps are written as RFC 3339.
fn parse_timestamp(column: &str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Serialization(format!("{column} {value:?}: {e}")))
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_integer(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

fn row_to_snapshot(row: &libsql::Row) -> Result<JobSnapshot, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("read snapshot row: {e}"));

    let key: String = row.get(0).map_err(read)?;
    let job_id_str: String = row.get(1).map_err(read)?;
    let kind_str: String = row.get(2).map_err(read)?;
    let status_str: String = row.get(3).map_err(read)?;
    let error_json: Option<String> = row.get(7).ok();
    let attempts: i64 = row.get(8).map_err(read)?;
    let progress: Option<i64> = row.get(9).ok();
    let reconciled: i64 = row.get(10).map_err(read)?;
    let created_str: String = row.get(11).map_err(read)?;
    let updated_str: String = row.get(12).map_err(read)?;

    let job_id = Uuid::parse_str(&job_id_str)
        .map_err(|e| DatabaseError::Serialization(format!("job_id {job_id_str:?}: {e}")))?;
    let kind: JobKind = kind_str.parse().map_err(DatabaseError::Serialization)?;
    let status: JobStatus = status_str.parse().map_err(DatabaseError::Serialization)?;
    let error = match error_json {
        Some(json) => Some(
            serde_json::from_str::<ClassifiedError>(&json)
                .map_err(|e| DatabaseError::Serialization(format!("error column: {e}")))?,
        ),
        None => None,
    };

    Ok(JobSnapshot {
        key: JobKey::new(key),
        job_id,
        kind,
        status,
        external_id: row.get(4).ok(),
        secondary_id: row.get(5).ok(),
        result: row.get(6).ok(),
        error,
        attempts: u32::try_from(attempts).unwrap_or(0),
        progress: progress.and_then(|p| u8::try_from(p).ok()),
        reconciled: reconciled != 0,
        created_at: parse_timestamp("created_at", &created_str)?,
        updated_at: parse_timestamp("updated_at", &updated_str)?,
    })
}

const SNAPSHOT_COLUMNS: &str = "key, job_id, kind, status, external_id, secondary_id, result, error, attempts, progress, reconciled, created_at, updated_at";

#[async_trait]
impl SnapshotStore for LibSqlBackend {
    async fn put_snapshot(&self, snapshot: &JobSnapshot) -> Result<(), DatabaseError> {
        let error_json = match &snapshot.error {
            Some(err) => Some(
                serde_json::to_string(err)
                    .map_err(|e| DatabaseError::Serialization(format!("error column: {e}")))?,
            ),
            None => None,
        };

        self.conn()
            .execute(
                "INSERT INTO job_snapshots (key, job_id, kind, status, external_id, secondary_id, result, error, attempts, progress, reconciled, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                 ON CONFLICT(key) DO UPDATE SET
                    job_id = excluded.job_id,
                    kind = excluded.kind,
                    status = excluded.status,
                    external_id = excluded.external_id,
                    secondary_id = excluded.secondary_id,
                    result = excluded.result,
                    error = excluded.error,
                    attempts = excluded.attempts,
                    progress = excluded.progress,
                    reconciled = CASE WHEN job_snapshots.job_id = excluded.job_id
                        THEN MAX(job_snapshots.reconciled, excluded.reconciled)
                        ELSE excluded.reconciled END,
                    created_at = excluded.created_at,
                    updated_at = excluded.updated_at",
                params![
                    snapshot.key.as_str(),
                    snapshot.job_id.to_string(),
                    snapshot.kind.as_str(),
                    snapshot.status.as_str(),
                    opt_text(snapshot.external_id.as_deref()),
                    opt_text(snapshot.secondary_id.as_deref()),
                    opt_text(snapshot.result.as_deref()),
                    opt_text(error_json.as_deref()),
                    i64::from(snapshot.attempts),
                    opt_integer(snapshot.progress.map(i64::from)),
                    i64::from(snapshot.reconciled),
                    snapshot.created_at.to_rfc3339(),
                    snapshot.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_snapshot: {e}")))?;

        debug!(key = %snapshot.key, status = %snapshot.status, "Snapshot written");
        Ok(())
    }

    async fn get_snapshot(&self, key: &JobKey) -> Result<Option<JobSnapshot>, DatabaseError> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM job_snapshots WHERE key = ?1");
        let mut rows = self
            .conn()
            .query(&sql, params![key.as_str()])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_snapshot: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_snapshot: {e}")))?
        {
            Some(row) => Ok(Some(row_to_snapshot(&row)?)),
            None => Ok(None),
        }
    }

    async fn delete_snapshot(&self, key: &JobKey) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM job_snapshots WHERE key = ?1",
                params![key.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_snapshot: {e}")))?;
        Ok(())
    }

    async fn list_snapshots(&self) -> Result<Vec<JobSnapshot>, DatabaseError> {
        let sql = format!("SELECT {SNAPSHOT_COLUMNS} FROM job_snapshots ORDER BY updated_at");
        let mut rows = self
            .conn()
            .query(&sql, ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_snapshots: {e}")))?;

        let mut snapshots = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_snapshots: {e}")))?
        {
            match row_to_snapshot(&row) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(error = %e, "Skipping unreadable snapshot row"),
            }
        }
        Ok(snapshots)
    }

    async fn mark_reconciled(&self, key: &JobKey, job_id: Uuid) -> Result<bool, DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE job_snapshots SET reconciled = 1 WHERE key = ?1 AND job_id = ?2",
                params![key.as_str(), job_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_reconciled: {e}")))?;
        Ok(affected > 0)
    }
}

#[async_trait]
impl ResultStore for LibSqlBackend {
    async fn persist_result(
        &self,
        owner: &JobKey,
        job_id: Uuid,
        result: &str,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO owner_results (owner, job_id, result, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(owner) DO UPDATE SET
                    job_id = excluded.job_id,
                    result = excluded.result,
                    updated_at = excluded.updated_at",
                params![
                    owner.as_str(),
                    job_id.to_string(),
                    result,
                    Utc::now().to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_result: {e}")))?;

        debug!(owner = %owner, job_id = %job_id, "Result persisted");
        Ok(())
    }

    /// Rows written before producers were recorded are not returned.
    async fn fetch_result(&self, owner: &JobKey) -> Result<Option<OwnerResult>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT job_id, result FROM owner_results WHERE owner = ?1 AND job_id IS NOT NULL",
                params![owner.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_result: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_result: {e}")))?
        else {
            return Ok(None);
        };

        let read = |e: libsql::Error| DatabaseError::Query(format!("fetch_result: {e}"));
        let job_id_str: String = row.get(0).map_err(read)?;
        let job_id = Uuid::parse_str(&job_id_str)
            .map_err(|e| DatabaseError::Serialization(format!("job_id {job_id_str:?}: {e}")))?;
        Ok(Some(OwnerResult {
            job_id,
            result: row.get(1).map_err(read)?,
        }))
    }
}

fn row_to_batch(row: &libsql::Row) -> Result<BatchRecord, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("read batch row: {e}"));

    let id_str: String = row.get(0).map_err(read)?;
    let kind_str: String = row.get(1).map_err(read)?;
    let total_slots: i64 = row.get(2).map_err(read)?;
    let concurrency_limit: i64 = row.get(3).map_err(read)?;
    let created_str: String = row.get(4).map_err(read)?;

    let count = |column: &str, n: i64| {
        usize::try_from(n)
            .map_err(|e| DatabaseError::Serialization(format!("{column} {n}: {e}")))
    };

    Ok(BatchRecord {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("batch id {id_str:?}: {e}")))?,
        kind: kind_str.parse().map_err(DatabaseError::Serialization)?,
        config: BatchConfig {
            total_slots: count("total_slots", total_slots)?,
            concurrency_limit: count("concurrency_limit", concurrency_limit)?,
        },
        created_at: parse_timestamp("created_at", &created_str)?,
    })
}

#[async_trait]
impl BatchStore for LibSqlBackend {
    async fn put_batch(&self, batch: &BatchRecord) -> Result<(), DatabaseError> {
        let count = |n: usize| i64::try_from(n).unwrap_or(i64::MAX);
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO batch_sessions (id, kind, total_slots, concurrency_limit, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    batch.id.to_string(),
                    batch.kind.as_str(),
                    count(batch.config.total_slots),
                    count(batch.config.concurrency_limit),
                    batch.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put_batch: {e}")))?;
        debug!(session_id = %batch.id, "Batch session written");
        Ok(())
    }

    async fn delete_batch(&self, id: Uuid) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM batch_sessions WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_batch: {e}")))?;
        Ok(())
    }

    async fn list_batches(&self) -> Result<Vec<BatchRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, kind, total_slots, concurrency_limit, created_at FROM batch_sessions ORDER BY created_at",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_batches: {e}")))?;

        let mut batches = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_batches: {e}")))?
        {
            match row_to_batch(&row) {
                Ok(batch) => batches.push(batch),
                Err(e) => warn!(error = %e, "Skipping unreadable batch row"),
            }
        }
        Ok(batches)
    }
}

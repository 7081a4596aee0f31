//! PersistenceBridge: durable snapshots of job state and reconciliation of
//! succeeded results into the authoritative store.
//!
//! Snapshot writes go through a single background writer so they land in
//! the order the transitions happened, without the registry awaiting I/O.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ReconcileConfig;
use crate::error::DatabaseError;
use crate::jobs::model::{JobKey, JobRecord, JobStatus};
use crate::store::traits::{JobSnapshot, ResultStore, SnapshotStore};

enum WriteCommand {
    Put(JobSnapshot),
    Clear(JobKey),
    MarkReconciled { key: JobKey, job_id: Uuid },
    Flush(oneshot::Sender<()>),
}

/// A job brought back from a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum Restored {
    /// Terminal. Kept read-only; never polled again.
    Settled {
        record: JobRecord,
        /// Succeeded but the result never reached the authoritative store.
        needs_reconcile: bool,
    },
    /// Accepted upstream and not yet settled. Polling resumes from the
    /// snapshot's handles with a fresh attempt budget.
    Resume(JobRecord),
}

impl Restored {
    pub fn record(&self) -> &JobRecord {
        match self {
            Self::Settled { record, .. } | Self::Resume(record) => record,
        }
    }
}

struct BridgeInner {
    snapshots: Arc<dyn SnapshotStore>,
    results: Arc<dyn ResultStore>,
    reconcile: ReconcileConfig,
    writer: mpsc::UnboundedSender<WriteCommand>,
}

/// Snapshot / restore / reconcile over a [`SnapshotStore`] and a
/// [`ResultStore`]. Cheap to clone.
#[derive(Clone)]
pub struct PersistenceBridge {
    inner: Arc<BridgeInner>,
}

impl PersistenceBridge {
    /// Create the bridge and spawn its writer task. Must be called inside a
    /// tokio runtime.
    pub fn new(
        snapshots: Arc<dyn SnapshotStore>,
        results: Arc<dyn ResultStore>,
        reconcile: ReconcileConfig,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(Arc::clone(&snapshots), rx));

        Self {
            inner: Arc::new(BridgeInner {
                snapshots,
                results,
                reconcile,
                writer: tx,
            }),
        }
    }

    fn send(&self, command: WriteCommand) {
        if self.inner.writer.send(command).is_err() {
            warn!("Snapshot writer is gone, dropping write");
        }
    }

    /// Queue an overwrite of the snapshot for `record.key`.
    pub fn snapshot(&self, record: &JobRecord) {
        self.send(WriteCommand::Put(JobSnapshot::from_record(record)));
    }

    /// Queue removal of the snapshot for `key`.
    pub fn clear(&self, key: &JobKey) {
        self.send(WriteCommand::Clear(key.clone()));
    }

    /// Wait until every write queued so far has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(WriteCommand::Flush(tx));
        let _ = rx.await;
    }

    /// Load and judge the snapshot for `key`.
    pub async fn restore(&self, key: &JobKey) -> Result<Option<Restored>, DatabaseError> {
        self.flush().await;
        match self.inner.snapshots.get_snapshot(key).await? {
            Some(snapshot) => Ok(self.judge(snapshot).await),
            None => Ok(None),
        }
    }

    /// Load and judge every stored snapshot.
    pub async fn restore_all(&self) -> Result<Vec<Restored>, DatabaseError> {
        self.flush().await;
        let mut restored = Vec::new();
        for snapshot in self.inner.snapshots.list_snapshots().await? {
            if let Some(job) = self.judge(snapshot).await {
                restored.push(job);
            }
        }
        Ok(restored)
    }

    /// Decide what a snapshot turns into. A terminal state, local or remote,
    /// always wins over resuming a poll. A remote result only counts when it
    /// was produced by the snapshot's own job.
    async fn judge(&self, snapshot: JobSnapshot) -> Option<Restored> {
        let key = snapshot.key.clone();
        let reconciled = snapshot.reconciled;
        let mut record = snapshot.into_record();

        if record.status.is_terminal() {
            if let Err(reason) = record.check_invariants() {
                warn!(key = %key, reason = %reason, "Discarding inconsistent snapshot");
                self.clear(&key);
                return None;
            }
            let needs_reconcile = record.status == JobStatus::Succeeded && !reconciled;
            debug!(key = %key, status = %record.status, "Restored settled job");
            return Some(Restored::Settled {
                record,
                needs_reconcile,
            });
        }

        if record.external_id.is_none() {
            warn!(
                key = %key,
                status = %record.status,
                "Job was lost before upstream accepted it, dropping snapshot"
            );
            self.clear(&key);
            return None;
        }

        // Snapshots are only taken at transitions, so a live snapshot with a
        // handle was written on entering polling.
        record.status = JobStatus::Polling;
        record.attempts = 0;

        match self.inner.results.fetch_result(&key).await {
            Ok(Some(owned)) if owned.job_id != record.job_id => {
                debug!(
                    key = %key,
                    job_id = %record.job_id,
                    producer = %owned.job_id,
                    "Owner result belongs to an earlier job"
                );
            }
            Ok(Some(owned)) => {
                if record.succeed(owned.result).is_ok() {
                    info!(key = %key, job_id = %record.job_id, "Authoritative store already has a result");
                    self.snapshot(&record);
                    self.send(WriteCommand::MarkReconciled {
                        key: key.clone(),
                        job_id: record.job_id,
                    });
                    return Some(Restored::Settled {
                        record,
                        needs_reconcile: false,
                    });
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(key = %key, error = %e, "Could not consult authoritative store, resuming poll");
            }
        }

        info!(
            key = %key,
            job_id = %record.job_id,
            external_id = record.external_id.as_deref().unwrap_or_default(),
            "Resuming poll for restored job"
        );
        Some(Restored::Resume(record))
    }

    /// Write a succeeded result to the authoritative store, keyed by owner
    /// and tagged with the producing job.
    ///
    /// Retries with linear backoff. Returns whether the write landed; a
    /// failure is logged and never touches the record.
    pub async fn reconcile(&self, record: &JobRecord) -> bool {
        let result = match (record.status, record.result.as_deref()) {
            (JobStatus::Succeeded, Some(result)) => result,
            _ => {
                debug!(key = %record.key, status = %record.status, "Nothing to reconcile");
                return false;
            }
        };

        let config = self.inner.reconcile;
        let max_attempts = config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self
                .inner
                .results
                .persist_result(&record.key, record.job_id, result)
                .await
            {
                Ok(()) => {
                    self.send(WriteCommand::MarkReconciled {
                        key: record.key.clone(),
                        job_id: record.job_id,
                    });
                    info!(key = %record.key, job_id = %record.job_id, attempt, "Result reconciled");
                    return true;
                }
                Err(e) => {
                    warn!(
                        key = %record.key,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Failed to persist result"
                    );
                    if attempt < max_attempts {
                        tokio::time::sleep(config.backoff * attempt).await;
                    }
                }
            }
        }

        error!(
            key = %record.key,
            job_id = %record.job_id,
            "Giving up on persisting result; it stays visible but is not durable remotely"
        );
        false
    }
}

async fn run_writer(
    snapshots: Arc<dyn SnapshotStore>,
    mut rx: mpsc::UnboundedReceiver<WriteCommand>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            WriteCommand::Put(snapshot) => {
                if let Err(e) = snapshots.put_snapshot(&snapshot).await {
                    error!(key = %snapshot.key, error = %e, "Failed to write snapshot");
                }
            }
            WriteCommand::Clear(key) => {
                if let Err(e) = snapshots.delete_snapshot(&key).await {
                    error!(key = %key, error = %e, "Failed to clear snapshot");
                }
            }
            WriteCommand::MarkReconciled { key, job_id } => {
                if let Err(e) = snapshots.mark_reconciled(&key, job_id).await {
                    error!(key = %key, error = %e, "Failed to mark snapshot reconciled");
                }
            }
            WriteCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("Snapshot writer stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::backend::JobHandles;
    use crate::jobs::model::JobKind;
    use crate::store::MemoryStore;

    fn bridge(store: &Arc<MemoryStore>) -> PersistenceBridge {
        PersistenceBridge::new(store.clone(), store.clone(), ReconcileConfig::default())
    }

    fn polling(key: &str) -> JobRecord {
        let mut record = JobRecord::new(JobKey::new(key), JobKind::Grid);
        record.begin_submission().unwrap();
        record
            .begin_polling(JobHandles::new("ext-7").with_secondary("task-7"))
            .unwrap();
        record.record_attempt(Some(50));
        record
    }

    #[tokio::test]
    async fn polling_snapshot_resumes_with_same_handles() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(&store);
        let record = polling("slot-1");
        bridge.snapshot(&record);

        let resumed = match bridge.restore(&record.key).await.unwrap().unwrap() {
            Restored::Resume(resumed) => resumed,
            other => panic!("expected resume, got {other:?}"),
        };
        assert_eq!(resumed.job_id, record.job_id);
        assert_eq!(resumed.handles(), record.handles());
        assert_eq!(resumed.attempts, 0);
        assert_eq!(resumed.status, JobStatus::Polling);
    }

    #[tokio::test]
    async fn succeeded_snapshot_is_trusted() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(&store);
        let mut record = polling("slot-2");
        record.succeed("https://cdn/2.png".into()).unwrap();
        bridge.snapshot(&record);

        match bridge.restore(&record.key).await.unwrap().unwrap() {
            Restored::Settled { record: settled, needs_reconcile } => {
                assert_eq!(settled.result.as_deref(), Some("https://cdn/2.png"));
                assert!(needs_reconcile);
            }
            other => panic!("expected settled, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn remote_result_wins_over_resuming() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(&store);
        let record = polling("slot-3");
        bridge.snapshot(&record);
        store
            .persist_result(&record.key, record.job_id, "https://cdn/remote.png")
            .await
            .unwrap();

        match bridge.restore(&record.key).await.unwrap().unwrap() {
            Restored::Settled { record: settled, needs_reconcile } => {
                assert_eq!(settled.status, JobStatus::Succeeded);
                assert_eq!(settled.result.as_deref(), Some("https://cdn/remote.png"));
                assert!(!needs_reconcile);
            }
            other => panic!("expected settled, got {other:?}"),
        }

        bridge.flush().await;
        let snapshot = store.get_snapshot(&record.key).await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Succeeded);
        assert!(snapshot.reconciled);
    }

    #[tokio::test]
    async fn earlier_jobs_result_does_not_settle_a_regeneration() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(&store);
        let mut earlier = polling("concept-1");
        earlier.succeed("https://cdn/old.png".into()).unwrap();
        store
            .persist_result(&earlier.key, earlier.job_id, "https://cdn/old.png")
            .await
            .unwrap();

        let regenerated = polling("concept-1");
        bridge.snapshot(&regenerated);

        match bridge.restore(&regenerated.key).await.unwrap().unwrap() {
            Restored::Resume(resumed) => {
                assert_eq!(resumed.job_id, regenerated.job_id);
                assert_eq!(resumed.status, JobStatus::Polling);
                assert!(resumed.result.is_none());
            }
            other => panic!("expected resume, got {other:?}"),
        }

        bridge.flush().await;
        let snapshot = store.get_snapshot(&regenerated.key).await.unwrap().unwrap();
        assert_eq!(snapshot.status, JobStatus::Polling);
        assert!(!snapshot.reconciled);
    }

    #[tokio::test]
    async fn submitting_snapshot_is_dropped() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(&store);
        let mut record = JobRecord::new(JobKey::new("slot-4"), JobKind::Image);
        record.begin_submission().unwrap();
        bridge.snapshot(&record);

        assert!(bridge.restore(&record.key).await.unwrap().is_none());
        bridge.flush().await;
        assert!(store.get_snapshot(&record.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_apply_in_order() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(&store);
        let mut record = polling("slot-5");
        bridge.snapshot(&record);
        record.cancel("owner deleted").unwrap();
        bridge.snapshot(&record);
        bridge.clear(&record.key);
        bridge.flush().await;

        assert!(store.get_snapshot(&record.key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reconcile_marks_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let bridge = bridge(&store);
        let mut record = polling("concept-1");
        record.succeed("https://cdn/c1.png".into()).unwrap();
        bridge.snapshot(&record);

        assert!(bridge.reconcile(&record).await);
        bridge.flush().await;

        let stored = store.fetch_result(&record.key).await.unwrap().unwrap();
        assert_eq!(stored.result, "https://cdn/c1.png");
        assert_eq!(stored.job_id, record.job_id);
        assert!(store.get_snapshot(&record.key).await.unwrap().unwrap().reconciled);
    }

    #[tokio::test]
    async fn reconcile_ignores_unfinished_jobs() {
        let store = Arc::new(MemoryStore::new());
        assert!(!bridge(&store).reconcile(&polling("x")).await);
        assert_eq!(store.result_count().await, 0);
    }

    struct FlakyResults {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ResultStore for FlakyResults {
        async fn persist_result(
            &self,
            _owner: &JobKey,
            _job_id: Uuid,
            _result: &str,
        ) -> Result<(), DatabaseError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(DatabaseError::Remote("503".into()));
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_retries_then_gives_up() {
        let snapshots = Arc::new(MemoryStore::new());
        let results = Arc::new(FlakyResults {
            failures_left: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        });
        let config = ReconcileConfig {
            max_attempts: 3,
            backoff: Duration::from_secs(1),
        };
        let bridge = PersistenceBridge::new(snapshots.clone(), results.clone(), config);

        let mut record = polling("concept-2");
        record.succeed("r".into()).unwrap();
        assert!(!bridge.reconcile(&record).await);
        assert_eq!(results.calls.load(Ordering::SeqCst), 3);
        assert_eq!(record.status, JobStatus::Succeeded);
    }

    #[tokio::test(start_paused = true)]
    async fn reconcile_recovers_after_transient_failure() {
        let snapshots = Arc::new(MemoryStore::new());
        let results = Arc::new(FlakyResults {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        });
        let bridge = PersistenceBridge::new(snapshots, results.clone(), ReconcileConfig::default());

        let mut record = polling("concept-3");
        record.succeed("r".into()).unwrap();
        assert!(bridge.reconcile(&record).await);
        assert_eq!(results.calls.load(Ordering::SeqCst), 2);
    }
}

//! End-to-end orchestration tests.
//!
//! Restart tests run two registries one after the other against the same
//! libSQL file, the way the server does across a process restart.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;

use gen_orchestrator::backend::{GenerationBackend, JobHandles, StatusReport};
use gen_orchestrator::config::{BatchConfig, OrchestratorConfig, PollPolicies, PollPolicy};
use gen_orchestrator::error::CollaboratorError;
use gen_orchestrator::jobs::{
    BatchSessions, ErrorKind, GenerationRequest, JobKey, JobKind, JobRecord, JobRegistry,
    JobStatus, PersistenceBridge,
};
use gen_orchestrator::store::{LibSqlBackend, MemoryStore, ResultStore, SnapshotStore};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream double: ids are handed out in submit order (`ext-0`, `ext-1`, …)
/// and every job stays pending until it is marked finished.
#[derive(Default)]
struct ScriptedBackend {
    submits: AtomicUsize,
    checks: AtomicUsize,
    submit_errors: Mutex<VecDeque<CollaboratorError>>,
    finished: Mutex<HashSet<String>>,
    finish_all: AtomicBool,
}

impl ScriptedBackend {
    fn finishing(ids: &[&str]) -> Self {
        let backend = Self::default();
        backend
            .finished
            .lock()
            .unwrap()
            .extend(ids.iter().map(|id| id.to_string()));
        backend
    }

    fn fail_next_submit(&self, error: CollaboratorError) {
        self.submit_errors.lock().unwrap().push_back(error);
    }

    fn finish_everything(&self) {
        self.finish_all.store(true, Ordering::SeqCst);
    }

    fn submits(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }

    fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

fn result_for(external_id: &str) -> String {
    format!("https://cdn.test/{external_id}.png")
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    async fn submit(
        &self,
        _kind: JobKind,
        _request: &GenerationRequest,
    ) -> Result<JobHandles, CollaboratorError> {
        let n = self.submits.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.submit_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        Ok(JobHandles::new(format!("ext-{n}")).with_secondary(format!("task-{n}")))
    }

    async fn check_status(&self, handles: &JobHandles) -> Result<StatusReport, CollaboratorError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let done = self.finish_all.load(Ordering::SeqCst)
            || self.finished.lock().unwrap().contains(&handles.external_id);
        if done {
            Ok(StatusReport::succeeded(result_for(&handles.external_id)))
        } else {
            Ok(StatusReport::pending(Some(50)))
        }
    }
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig::with_polling(PollPolicies::uniform(PollPolicy::new(
        Duration::from_millis(10),
        1_000,
    )))
}

/// One "process": a registry persisting to the libSQL file at `path`.
async fn boot(path: &std::path::Path) -> (JobRegistry, Arc<LibSqlBackend>) {
    let db = Arc::new(LibSqlBackend::new_local(path).await.unwrap());
    let config = fast_config();
    let bridge = PersistenceBridge::new(
        Arc::clone(&db) as Arc<dyn SnapshotStore>,
        Arc::clone(&db) as Arc<dyn ResultStore>,
        config.reconcile,
    );
    (JobRegistry::with_persistence(&config, bridge), db)
}

async fn wait_for_status(registry: &JobRegistry, key: &JobKey, status: JobStatus) -> JobRecord {
    loop {
        if let Some(record) = registry.get(key) {
            if record.status == status {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn image_request() -> GenerationRequest {
    GenerationRequest::with_prompt("a lighthouse at dusk")
}

// ── Restart ──────────────────────────────────────────────────────────

#[tokio::test]
async fn polling_job_resumes_after_restart_without_resubmitting() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let key = JobKey::new("concept-1");

        // First run: submit and poll, then stop mid-flight.
        {
            let backend = Arc::new(ScriptedBackend::default());
            let (registry, _db) = boot(&path).await;
            let record = registry
                .start(key.clone(), JobKind::Image, image_request(), backend.clone())
                .await
                .unwrap();
            assert_eq!(record.status, JobStatus::Polling);
            assert_eq!(record.external_id.as_deref(), Some("ext-0"));

            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(backend.checks() >= 1);
            registry.shutdown().await;
        }

        // Second run: upstream has finished in the meantime.
        let backend = Arc::new(ScriptedBackend::finishing(&["ext-0"]));
        let (registry, db) = boot(&path).await;
        assert_eq!(registry.restore_all(backend.clone()).await.unwrap(), 1);

        let restored = registry.get(&key).unwrap();
        assert_eq!(restored.external_id.as_deref(), Some("ext-0"));
        assert_eq!(restored.secondary_id.as_deref(), Some("task-0"));

        let done = wait_for_status(&registry, &key, JobStatus::Succeeded).await;
        assert_eq!(done.result, Some(result_for("ext-0")));
        assert_eq!(backend.submits(), 0);
        assert!(backend.checks() >= 1);

        // The success is written to the owner's result and flagged.
        loop {
            let snapshot = db.get_snapshot(&key).await.unwrap().unwrap();
            if snapshot.reconciled {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let stored = db.fetch_result(&key).await.unwrap().unwrap();
        assert_eq!(stored.result, result_for("ext-0"));
        assert_eq!(stored.job_id, done.job_id);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn succeeded_snapshot_is_trusted_after_restart() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let key = JobKey::new("concept-2");

        {
            let backend = Arc::new(ScriptedBackend::finishing(&["ext-0"]));
            let (registry, _db) = boot(&path).await;
            registry
                .start(key.clone(), JobKind::Image, image_request(), backend)
                .await
                .unwrap();
            wait_for_status(&registry, &key, JobStatus::Succeeded).await;
            registry.shutdown().await;
        }

        let backend = Arc::new(ScriptedBackend::default());
        let (registry, _db) = boot(&path).await;
        assert_eq!(registry.restore_all(backend.clone()).await.unwrap(), 1);

        let record = registry.get(&key).unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.result, Some(result_for("ext-0")));
        assert!(!registry.has_poller(&key));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.checks(), 0);
        assert_eq!(backend.submits(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn remote_result_wins_over_polling_snapshot() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let key = JobKey::new("concept-3");

        {
            let backend = Arc::new(ScriptedBackend::default());
            let (registry, db) = boot(&path).await;
            let record = registry
                .start(key.clone(), JobKind::Image, image_request(), backend)
                .await
                .unwrap();
            registry.shutdown().await;

            // The job's result reached the store while this process was down.
            db.persist_result(&key, record.job_id, "https://cdn.test/elsewhere.png")
                .await
                .unwrap();
        }

        let backend = Arc::new(ScriptedBackend::default());
        let (registry, _db) = boot(&path).await;
        registry.restore_all(backend.clone()).await.unwrap();

        let record = registry.get(&key).unwrap();
        assert_eq!(record.status, JobStatus::Succeeded);
        assert_eq!(record.result.as_deref(), Some("https://cdn.test/elsewhere.png"));
        assert!(!registry.has_poller(&key));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.checks(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn regeneration_in_flight_survives_restart() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let key = JobKey::new("concept-5");

        let regenerated = {
            let backend = Arc::new(ScriptedBackend::finishing(&["ext-0"]));
            let (registry, db) = boot(&path).await;
            registry
                .start(key.clone(), JobKind::Image, image_request(), backend.clone())
                .await
                .unwrap();
            wait_for_status(&registry, &key, JobStatus::Succeeded).await;
            while db.fetch_result(&key).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }

            let regenerated = registry
                .start(key.clone(), JobKind::Image, image_request(), backend)
                .await
                .unwrap();
            assert_eq!(regenerated.external_id.as_deref(), Some("ext-1"));
            registry.shutdown().await;
            regenerated
        };

        let backend = Arc::new(ScriptedBackend::default());
        let (registry, _db) = boot(&path).await;
        assert_eq!(registry.restore_all(backend.clone()).await.unwrap(), 1);

        let restored = registry.get(&key).unwrap();
        assert_eq!(restored.job_id, regenerated.job_id);
        assert_eq!(restored.status, JobStatus::Polling);
        assert!(restored.result.is_none());
        assert!(registry.has_poller(&key));

        backend.finish_everything();
        let done = wait_for_status(&registry, &key, JobStatus::Succeeded).await;
        assert_eq!(done.result, Some(result_for("ext-1")));
        assert_eq!(backend.submits(), 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn deleted_owner_is_not_resurrected() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let key = JobKey::new("concept-4");

        {
            let backend = Arc::new(ScriptedBackend::default());
            let (registry, _db) = boot(&path).await;
            registry
                .start(key.clone(), JobKind::Image, image_request(), backend)
                .await
                .unwrap();
            assert!(registry.delete_owner(&key).is_some());
            registry.shutdown().await;
        }

        let backend = Arc::new(ScriptedBackend::default());
        let (registry, db) = boot(&path).await;
        assert_eq!(registry.restore_all(backend).await.unwrap(), 0);
        assert!(registry.get(&key).is_none());
        assert!(db.get_snapshot(&key).await.unwrap().is_none());
    })
    .await
    .expect("test timed out");
}

// ── Properties ───────────────────────────────────────────────────────

#[tokio::test]
async fn resource_exhausted_submission_never_polls() {
    let backend = Arc::new(ScriptedBackend::default());
    backend.fail_next_submit(CollaboratorError::Http {
        status: 402,
        message: "insufficient credits".into(),
    });

    let store = Arc::new(MemoryStore::new());
    let config = fast_config();
    let bridge = PersistenceBridge::new(store.clone(), store.clone(), config.reconcile);
    let registry = JobRegistry::with_persistence(&config, bridge);

    let key = JobKey::new("concept-5");
    let record = registry
        .start(key.clone(), JobKind::Image, image_request(), backend.clone())
        .await
        .unwrap();

    assert_eq!(record.status, JobStatus::Failed);
    let error = record.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::ResourceExhausted);
    assert!(error.requires_top_up());
    assert!(!registry.has_poller(&key));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.checks(), 0);
    assert_eq!(registry.get(&key).unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn restarts_on_one_key_never_overlap_pollers() {
    let backend = Arc::new(ScriptedBackend::default());
    let registry = JobRegistry::new(&fast_config());
    let key = JobKey::new("concept-6");

    for round in 0..6 {
        registry
            .start(key.clone(), JobKind::Image, image_request(), backend.clone())
            .await
            .unwrap();
        assert_eq!(registry.active_pollers(), 1);
        if round % 2 == 1 {
            registry.cancel(&key);
            assert_eq!(registry.active_pollers(), 0);
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(registry.active_pollers() <= 1);
    }

    let record = registry.get(&key).unwrap();
    assert_eq!(record.status, JobStatus::Canceled);
    assert_eq!(record.external_id.as_deref(), Some("ext-5"));

    // Nothing polls a canceled job.
    let checks = backend.checks();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(backend.checks(), checks);
}

#[tokio::test(start_paused = true)]
async fn timeout_lands_on_the_last_attempt() {
    let backend = Arc::new(ScriptedBackend::default());
    let config = OrchestratorConfig::with_polling(PollPolicies::uniform(PollPolicy::new(
        Duration::from_secs(3),
        5,
    )));
    let registry = JobRegistry::new(&config);
    let key = JobKey::new("concept-7");

    registry
        .start(key.clone(), JobKind::Image, image_request(), backend.clone())
        .await
        .unwrap();

    let record = wait_for_status(&registry, &key, JobStatus::TimedOut).await;
    assert_eq!(record.attempts, 5);
    assert_eq!(backend.checks(), 5);
    assert_eq!(record.error.as_ref().unwrap().kind, ErrorKind::Timeout);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(backend.checks(), 5);
}

#[tokio::test]
async fn batch_admits_up_to_the_cap_then_offers_carousel() {
    timeout(TEST_TIMEOUT, async {
        let backend = Arc::new(ScriptedBackend::default());
        let registry = JobRegistry::new(&fast_config());
        let sessions = BatchSessions::new(registry.clone(), fast_config().batch);
        let session = sessions.create(JobKind::Image).await;

        let first = session
            .request_more(5, backend.clone(), |_| image_request())
            .await
            .unwrap();
        assert_eq!(first, vec![1, 2, 3]);
        assert_eq!(session.occupancy().live, 3);

        let second = session
            .request_more(5, backend.clone(), |_| image_request())
            .await
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(backend.submits(), 3);

        // Nothing is chosen before a slot succeeds.
        assert!(session.offer_carousel(1).is_err());

        backend.finish_everything();
        loop {
            if session.occupancy().succeeded == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(session.occupancy().live, 0);

        let chosen = session.offer_carousel(1).unwrap();
        let carousel = session.create_carousel(1, backend.clone()).await.unwrap();
        assert_eq!(carousel.kind, JobKind::Carousel);
        assert_eq!(carousel.key, JobKey::carousel(session.id()));

        let carousel = wait_for_status(&registry, &carousel.key, JobStatus::Succeeded).await;
        assert!(carousel.result.is_some());
        assert_eq!(chosen.status, JobStatus::Succeeded);

        // Slots never refill on their own.
        assert_eq!(session.occupancy().used, 3);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn batch_session_survives_restart() {
    timeout(TEST_TIMEOUT, async {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.db");
        let caps = BatchConfig {
            total_slots: 4,
            concurrency_limit: 2,
        };

        let session_id = {
            let backend = Arc::new(ScriptedBackend::default());
            let (registry, db) = boot(&path).await;
            let sessions = BatchSessions::with_store(registry.clone(), caps, db);
            let session = sessions.create(JobKind::Image).await;
            let admitted = session
                .request_more(5, backend.clone(), |_| image_request())
                .await
                .unwrap();
            assert_eq!(admitted, vec![1, 2]);
            registry.shutdown().await;
            session.id()
        };

        let backend = Arc::new(ScriptedBackend::default());
        let (registry, db) = boot(&path).await;
        assert_eq!(registry.restore_all(backend.clone()).await.unwrap(), 2);
        let sessions = BatchSessions::with_store(registry.clone(), BatchConfig::default(), db);
        assert_eq!(sessions.restore_all().await.unwrap(), 1);

        let session = sessions.get(session_id).await.unwrap();
        assert_eq!(session.total_slots(), 4);
        assert_eq!(session.concurrency_limit(), 2);
        assert_eq!(session.occupancy().live, 2);

        // The restored slots still hold the concurrency cap.
        let blocked = session
            .request_more(5, backend.clone(), |_| image_request())
            .await
            .unwrap();
        assert!(blocked.is_empty());
        assert_eq!(backend.submits(), 0);

        backend.finish_everything();
        while session.occupancy().succeeded < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let more = session
            .request_more(5, backend.clone(), |_| image_request())
            .await
            .unwrap();
        assert_eq!(more, vec![3, 4]);
        assert_eq!(backend.submits(), 2);
        assert!(session.offer_carousel(1).is_ok());
    })
    .await
    .expect("test timed out");
}

//! JobRegistry: the single map from job key to record and poller.
//!
//! All mutation of a record goes through the registry. The map is guarded
//! by one lock that is never held across an await. Every transition is
//! snapshotted, broadcast and queued for listeners while that lock is held,
//! so observers see a record's transitions in order.
//!
//! Queued listener calls run after the lock is released, one at a time and
//! in publish order. A listener may call back into the registry; the events
//! it causes are delivered after it returns.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{GenerationBackend, JobHandles, StatusReport};
use crate::config::{OrchestratorConfig, PollPolicies, PollPolicy};
use crate::error::{CollaboratorError, DatabaseError, JobError};
use crate::jobs::classifier::classify_submission;
use crate::jobs::model::{GenerationRequest, JobEvent, JobKey, JobKind, JobRecord, JobStatus};
use crate::jobs::persistence::{PersistenceBridge, Restored};
use crate::jobs::poller::{self, PollStep, PollerHandle, evaluate_poll};

/// Callback invoked on every event for one key.
pub type Listener = Arc<dyn Fn(&JobEvent) + Send + Sync>;

/// Identifies a registered listener so it can be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct JobEntry {
    record: JobRecord,
    poller: Option<PollerHandle>,
}

#[derive(Default)]
struct RegistryState {
    jobs: HashMap<JobKey, JobEntry>,
    listeners: HashMap<JobKey, Vec<(ListenerId, Listener)>>,
    next_listener: u64,
}

type Listeners = HashMap<JobKey, Vec<(ListenerId, Listener)>>;

struct RegistryInner {
    state: Mutex<RegistryState>,
    /// Listener calls queued under `state`, run once it is released.
    outbox: Mutex<VecDeque<(Listener, JobEvent)>>,
    delivering: AtomicBool,
    events: broadcast::Sender<JobEvent>,
    polling: PollPolicies,
    bridge: Option<PersistenceBridge>,
}

/// The locked registry state. Dropping it releases the lock, then runs the
/// listener calls queued meanwhile.
struct StateGuard<'a> {
    // Fields drop in order: the lock goes before delivery starts.
    state: MutexGuard<'a, RegistryState>,
    _deliver: Deliver<'a>,
}

impl Deref for StateGuard<'_> {
    type Target = RegistryState;

    fn deref(&self) -> &RegistryState {
        &self.state
    }
}

impl DerefMut for StateGuard<'_> {
    fn deref_mut(&mut self) -> &mut RegistryState {
        &mut self.state
    }
}

struct Deliver<'a>(&'a RegistryInner);

impl Drop for Deliver<'_> {
    fn drop(&mut self) {
        self.0.deliver();
    }
}

/// Clears the delivering flag, even if a listener panics.
struct Delivering<'a>(&'a AtomicBool);

impl Drop for Delivering<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RegistryInner {
    fn publish(&self, listeners: &Listeners, event: JobEvent) {
        if let Some(registered) = listeners.get(event.key()) {
            let mut outbox = self.outbox();
            for (_, listener) in registered {
                outbox.push_back((Arc::clone(listener), event.clone()));
            }
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn outbox(&self) -> MutexGuard<'_, VecDeque<(Listener, JobEvent)>> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drain the outbox. One thread delivers at a time; a caller that finds
    /// delivery in progress leaves its entries to that thread.
    fn deliver(&self) {
        loop {
            if self
                .delivering
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return;
            }
            let flag = Delivering(&self.delivering);
            loop {
                let next = self.outbox().pop_front();
                let Some((listener, event)) = next else {
                    break;
                };
                listener(&event);
            }
            drop(flag);

            // Entries queued between the last pop and clearing the flag.
            if self.outbox().is_empty() {
                return;
            }
        }
    }

    /// Apply `change`; if the status moved, snapshot and publish it.
    fn transition<F>(
        &self,
        listeners: &Listeners,
        record: &mut JobRecord,
        change: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobError>,
    {
        let from = record.status;
        change(record)?;
        if record.status != from {
            self.announce(listeners, record, from);
        }
        Ok(())
    }

    fn announce(&self, listeners: &Listeners, record: &JobRecord, from: JobStatus) {
        debug!(
            key = %record.key,
            job_id = %record.job_id,
            from = %from,
            to = %record.status,
            "Job transition"
        );
        if let Some(bridge) = &self.bridge {
            bridge.snapshot(record);
        }
        self.publish(
            listeners,
            JobEvent::Transition {
                key: record.key.clone(),
                job_id: record.job_id,
                from,
                to: record.status,
                record: Box::new(record.clone()),
            },
        );
    }
}

/// Where an in-flight `start` stands after trying to move forward.
enum Step {
    Applied(JobRecord),
    /// The job was canceled meanwhile; nothing was changed.
    Halted(JobRecord),
}

impl Step {
    fn into_record(self) -> JobRecord {
        match self {
            Self::Applied(record) | Self::Halted(record) => record,
        }
    }
}

/// Authoritative key → job map. Cheap to clone.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

impl JobRegistry {
    /// A registry without persistence.
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self::build(config, None)
    }

    /// A registry that snapshots every transition through `bridge`.
    pub fn with_persistence(config: &OrchestratorConfig, bridge: PersistenceBridge) -> Self {
        Self::build(config, Some(bridge))
    }

    fn build(config: &OrchestratorConfig, bridge: Option<PersistenceBridge>) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity());
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                outbox: Mutex::new(VecDeque::new()),
                delivering: AtomicBool::new(false),
                events,
                polling: config.polling,
                bridge,
            }),
        }
    }

    fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            state: self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            _deliver: Deliver(&self.inner),
        }
    }

    pub fn policies(&self) -> &PollPolicies {
        &self.inner.polling
    }

    pub fn bridge(&self) -> Option<&PersistenceBridge> {
        self.inner.bridge.as_ref()
    }

    /// Every event for every key.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Register `listener` for events on `key`, across successive jobs.
    ///
    /// Listeners run outside the registry lock, in event order. They may
    /// call back into the registry.
    pub fn on_change<F>(&self, key: &JobKey, listener: F) -> ListenerId
    where
        F: Fn(&JobEvent) + Send + Sync + 'static,
    {
        let mut state = self.lock();
        state.next_listener += 1;
        let id = ListenerId(state.next_listener);
        state
            .listeners
            .entry(key.clone())
            .or_default()
            .push((id, Arc::new(listener)));
        id
    }

    pub fn remove_listener(&self, key: &JobKey, id: ListenerId) -> bool {
        let mut state = self.lock();
        let Some(registered) = state.listeners.get_mut(key) else {
            return false;
        };
        let before = registered.len();
        registered.retain(|(existing, _)| *existing != id);
        let removed = registered.len() != before;
        if registered.is_empty() {
            state.listeners.remove(key);
        }
        removed
    }

    pub fn get(&self, key: &JobKey) -> Option<JobRecord> {
        self.lock().jobs.get(key).map(|entry| entry.record.clone())
    }

    /// Records for `keys`, in order.
    pub fn get_many(&self, keys: &[JobKey]) -> Vec<Option<JobRecord>> {
        let state = self.lock();
        keys.iter()
            .map(|key| state.jobs.get(key).map(|entry| entry.record.clone()))
            .collect()
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .lock()
            .jobs
            .values()
            .map(|entry| entry.record.clone())
            .collect();
        records.sort_by_key(|r| r.created_at);
        records
    }

    /// Whether a poller is currently attached to `key`.
    pub fn has_poller(&self, key: &JobKey) -> bool {
        self.lock()
            .jobs
            .get(key)
            .and_then(|entry| entry.poller.as_ref())
            .is_some_and(|poller| !poller.is_finished())
    }

    /// Number of attached, still-running pollers.
    pub fn active_pollers(&self) -> usize {
        self.lock()
            .jobs
            .values()
            .filter_map(|entry| entry.poller.as_ref())
            .filter(|poller| !poller.is_finished())
            .count()
    }

    /// Start a job for `key`, superseding any live one.
    ///
    /// Validation failures return an error and create nothing. Submission
    /// failures return the record in `failed`. If the job is canceled while
    /// analyzing or submitting, the canceled record is returned; if it is
    /// superseded, [`JobError::Superseded`]. A job halted during analysis is
    /// never submitted.
    pub async fn start(
        &self,
        key: JobKey,
        kind: JobKind,
        request: GenerationRequest,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<JobRecord, JobError> {
        if let Err(reason) = request.validate(kind) {
            debug!(key = %key, kind = %kind, reason = %reason, "Rejected invalid request");
            return Err(JobError::Validation { key, reason });
        }

        let job_id = self.begin(&key, kind)?;

        let mut request = request;
        if backend.requires_analysis(kind) {
            if let Step::Halted(record) = self.advance(&key, job_id, JobRecord::begin_analysis)? {
                return Ok(record);
            }
            request = match backend.analyze(kind, request).await {
                Ok(refined) => refined,
                Err(raw) => return self.fail_submission(&key, job_id, &raw),
            };
            // Canceled or superseded while analyzing: nothing goes upstream.
            if let Step::Halted(record) = self.advance(&key, job_id, |_| Ok(()))? {
                info!(key = %key, job_id = %job_id, "Job halted during analysis, not submitting");
                return Ok(record);
            }
        }

        match backend.submit(kind, &request).await {
            Ok(handles) => self.attach(&key, job_id, handles, backend),
            Err(raw) => self.fail_submission(&key, job_id, &raw),
        }
    }

    /// Tear down whatever holds `key` and insert a fresh `submitting` record.
    fn begin(&self, key: &JobKey, kind: JobKind) -> Result<Uuid, JobError> {
        let mut state = self.lock();
        let RegistryState { jobs, listeners, .. } = &mut *state;

        if let Some(previous) = jobs.get_mut(key) {
            if let Some(poller) = previous.poller.take() {
                poller.cancel();
            }
            if previous.record.status.is_live() {
                info!(key = %key, job_id = %previous.record.job_id, "Superseding live job");
                self.inner.transition(listeners, &mut previous.record, |r| {
                    r.cancel("superseded by a new job")
                })?;
            }
        }

        let mut record = JobRecord::new(key.clone(), kind);
        self.inner
            .transition(listeners, &mut record, JobRecord::begin_submission)?;
        let job_id = record.job_id;
        info!(key = %key, job_id = %job_id, kind = %kind, "Job started");

        jobs.insert(
            key.clone(),
            JobEntry {
                record,
                poller: None,
            },
        );
        Ok(job_id)
    }

    fn advance<F>(&self, key: &JobKey, job_id: Uuid, change: F) -> Result<Step, JobError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), JobError>,
    {
        let mut state = self.lock();
        let RegistryState { jobs, listeners, .. } = &mut *state;

        let entry = match jobs.get_mut(key) {
            Some(entry) if entry.record.job_id == job_id => entry,
            _ => {
                return Err(JobError::Superseded {
                    key: key.clone(),
                    id: job_id,
                });
            }
        };
        if !entry.record.status.is_live() {
            return Ok(Step::Halted(entry.record.clone()));
        }

        self.inner.transition(listeners, &mut entry.record, change)?;
        Ok(Step::Applied(entry.record.clone()))
    }

    fn fail_submission(
        &self,
        key: &JobKey,
        job_id: Uuid,
        raw: &CollaboratorError,
    ) -> Result<JobRecord, JobError> {
        let classified = classify_submission(raw);
        warn!(
            key = %key,
            job_id = %job_id,
            kind = %classified.kind,
            error = %classified.message,
            "Submission failed"
        );
        Ok(self
            .advance(key, job_id, |r| r.fail(classified))?
            .into_record())
    }

    /// Upstream accepted the job: move to `polling` and attach the poller,
    /// unless the job was canceled or superseded while submitting.
    fn attach(
        &self,
        key: &JobKey,
        job_id: Uuid,
        handles: JobHandles,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<JobRecord, JobError> {
        let mut state = self.lock();
        let RegistryState { jobs, listeners, .. } = &mut *state;

        let entry = match jobs.get_mut(key) {
            Some(entry) if entry.record.job_id == job_id => entry,
            _ => {
                info!(
                    key = %key,
                    job_id = %job_id,
                    external_id = %handles.external_id,
                    "Discarding submission for superseded job"
                );
                return Err(JobError::Superseded {
                    key: key.clone(),
                    id: job_id,
                });
            }
        };
        if !entry.record.status.is_live() {
            info!(
                key = %key,
                job_id = %job_id,
                external_id = %handles.external_id,
                "Discarding submission for canceled job"
            );
            return Ok(entry.record.clone());
        }

        self.inner.transition(listeners, &mut entry.record, |r| {
            r.begin_polling(handles.clone())
        })?;

        let policy = self.inner.polling.for_kind(entry.record.kind);
        entry.poller = Some(self.spawn_poller(key.clone(), job_id, handles, backend, policy));
        Ok(entry.record.clone())
    }

    fn spawn_poller(
        &self,
        key: JobKey,
        job_id: Uuid,
        handles: JobHandles,
        backend: Arc<dyn GenerationBackend>,
        policy: PollPolicy,
    ) -> PollerHandle {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        poller::attach(job_id, handles, backend, policy, move |outcome| {
            match registry.upgrade() {
                Some(inner) => JobRegistry { inner }.apply_poll(&key, job_id, outcome, &policy),
                None => PollStep::Stop,
            }
        })
    }

    /// Fold one status check into the current record for `key`.
    fn apply_poll(
        &self,
        key: &JobKey,
        job_id: Uuid,
        outcome: Result<StatusReport, CollaboratorError>,
        policy: &PollPolicy,
    ) -> PollStep {
        let succeeded = {
            let mut state = self.lock();
            let RegistryState { jobs, listeners, .. } = &mut *state;

            let Some(entry) = jobs
                .get_mut(key)
                .filter(|entry| entry.record.job_id == job_id)
            else {
                return PollStep::Stop;
            };
            if entry.record.status != JobStatus::Polling {
                return PollStep::Stop;
            }

            let step = evaluate_poll(&mut entry.record, outcome, policy);
            if entry.record.status == JobStatus::Polling {
                self.inner.publish(
                    listeners,
                    JobEvent::Progress {
                        key: key.clone(),
                        job_id,
                        attempts: entry.record.attempts,
                        progress: entry.record.progress,
                    },
                );
                return step;
            }

            self.inner
                .announce(listeners, &entry.record, JobStatus::Polling);
            entry.poller = None;
            (entry.record.status == JobStatus::Succeeded).then(|| entry.record.clone())
        };

        if let Some(record) = succeeded {
            self.spawn_reconcile(record);
        }
        PollStep::Stop
    }

    fn spawn_reconcile(&self, record: JobRecord) {
        if let Some(bridge) = self.inner.bridge.clone() {
            tokio::spawn(async move {
                bridge.reconcile(&record).await;
            });
        }
    }

    /// Cancel the live job for `key`, if any. Idempotent.
    pub fn cancel(&self, key: &JobKey) -> Option<JobRecord> {
        let mut state = self.lock();
        let RegistryState { jobs, listeners, .. } = &mut *state;

        let entry = jobs.get_mut(key)?;
        if let Some(poller) = entry.poller.take() {
            poller.cancel();
        }
        if entry.record.status.is_live() {
            match self
                .inner
                .transition(listeners, &mut entry.record, |r| r.cancel("canceled by caller"))
            {
                Ok(()) => info!(key = %key, job_id = %entry.record.job_id, "Job canceled"),
                Err(e) => warn!(key = %key, error = %e, "Cancel rejected"),
            }
        }
        Some(entry.record.clone())
    }

    /// The owner entity is gone: cancel, forget the record and its
    /// listeners, and clear its snapshot so it is not restored.
    pub fn delete_owner(&self, key: &JobKey) -> Option<JobRecord> {
        let mut state = self.lock();
        let RegistryState { jobs, listeners, .. } = &mut *state;

        let removed = jobs.remove(key).map(|mut entry| {
            if let Some(poller) = entry.poller.take() {
                poller.cancel();
            }
            if entry.record.status.is_live() {
                if let Err(e) = self
                    .inner
                    .transition(listeners, &mut entry.record, |r| r.cancel("owner deleted"))
                {
                    warn!(key = %key, error = %e, "Cancel on delete rejected");
                }
            }
            entry.record
        });
        listeners.remove(key);

        // Queued behind any snapshot written above.
        if let Some(bridge) = &self.inner.bridge {
            bridge.clear(key);
        }
        info!(key = %key, had_job = removed.is_some(), "Owner deleted");
        removed
    }

    /// Bring back the snapshot for `key`. A key that already has a record
    /// is left as is.
    pub async fn restore(
        &self,
        key: &JobKey,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<Option<JobRecord>, DatabaseError> {
        let Some(bridge) = self.inner.bridge.clone() else {
            return Ok(None);
        };
        if let Some(existing) = self.get(key) {
            return Ok(Some(existing));
        }

        Ok(bridge
            .restore(key)
            .await?
            .map(|restored| self.install(restored, &backend)))
    }

    /// Restore every stored snapshot. Returns how many jobs were brought back.
    pub async fn restore_all(
        &self,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<usize, DatabaseError> {
        let Some(bridge) = self.inner.bridge.clone() else {
            return Ok(0);
        };

        let restored = bridge.restore_all().await?;
        let count = restored.len();
        for job in restored {
            self.install(job, &backend);
        }

        info!(jobs = count, polling = self.active_pollers(), "Restored jobs from snapshots");
        Ok(count)
    }

    fn install(&self, restored: Restored, backend: &Arc<dyn GenerationBackend>) -> JobRecord {
        let mut to_reconcile = None;
        let record = {
            let mut state = self.lock();
            let key = restored.record().key.clone();
            if let Some(existing) = state.jobs.get(&key) {
                debug!(key = %key, "Key already tracked, skipping restore");
                return existing.record.clone();
            }

            let (record, poller) = match restored {
                Restored::Settled {
                    record,
                    needs_reconcile,
                } => {
                    if needs_reconcile {
                        to_reconcile = Some(record.clone());
                    }
                    (record, None)
                }
                Restored::Resume(record) => {
                    let poller = record.handles().map(|handles| {
                        let policy = self.inner.polling.for_kind(record.kind);
                        self.spawn_poller(
                            key.clone(),
                            record.job_id,
                            handles,
                            Arc::clone(backend),
                            policy,
                        )
                    });
                    (record, poller)
                }
            };

            state.jobs.insert(
                key,
                JobEntry {
                    record: record.clone(),
                    poller,
                },
            );
            record
        };

        if let Some(record) = to_reconcile {
            self.spawn_reconcile(record);
        }
        record
    }

    /// Stop every poller without touching records, so polling jobs resume
    /// on the next restore, then wait for pending snapshot writes.
    pub async fn shutdown(&self) {
        let stopped = {
            let mut state = self.lock();
            let mut stopped = 0usize;
            for entry in state.jobs.values_mut() {
                if let Some(poller) = entry.poller.take() {
                    poller.cancel();
                    stopped += 1;
                }
            }
            stopped
        };
        info!(pollers = stopped, "Registry shut down");

        if let Some(bridge) = &self.inner.bridge {
            bridge.flush().await;
        }
    }
}

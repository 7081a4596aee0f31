//! Batch sessions: bounded fan-out of sibling jobs.
//!
//! A session owns `total_slots` job keys. Occupancy is never stored: it is
//! read from the registry each time, so the session and the registry cannot
//! disagree about what is in flight. Admission only happens on an explicit
//! [`BatchSession::request_more`]; a slot settling frees capacity but does
//! not start anything.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::GenerationBackend;
use crate::config::BatchConfig;
use crate::error::{DatabaseError, JobError};
use crate::jobs::model::{GenerationRequest, JobEvent, JobKey, JobKind, JobRecord, JobStatus};
use crate::jobs::registry::{JobRegistry, ListenerId};
use crate::store::traits::{BatchRecord, BatchStore};

const BATCH_EVENT_CAPACITY: usize = 64;

/// Batch-level notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BatchEvent {
    SlotTerminal {
        session_id: Uuid,
        slot: usize,
        status: JobStatus,
    },
}

/// Slot counts derived from the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Occupancy {
    /// Submitting, analyzing or polling.
    pub live: usize,
    /// Anything but idle.
    pub used: usize,
    pub succeeded: usize,
}

/// One slot as seen by a caller.
#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub slot: usize,
    pub key: JobKey,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<JobRecord>,
}

/// Forwards slot settlements from registry listeners.
#[derive(Clone)]
struct SlotNotifier {
    session_id: Uuid,
    events: broadcast::Sender<BatchEvent>,
}

impl SlotNotifier {
    fn on_slot_terminal(&self, slot: usize, status: JobStatus) {
        debug!(session_id = %self.session_id, slot, status = %status, "Slot settled");
        let _ = self.events.send(BatchEvent::SlotTerminal {
            session_id: self.session_id,
            slot,
            status,
        });
    }
}

pub struct BatchSession {
    id: Uuid,
    kind: JobKind,
    total_slots: usize,
    concurrency_limit: usize,
    registry: JobRegistry,
    keys: Vec<JobKey>,
    listeners: Vec<(JobKey, ListenerId)>,
    /// Serializes admission so two `request_more` calls cannot both see
    /// the same free capacity.
    admission: Mutex<()>,
    events: broadcast::Sender<BatchEvent>,
}

impl BatchSession {
    pub fn new(kind: JobKind, config: BatchConfig, registry: JobRegistry) -> Self {
        Self::with_id(Uuid::new_v4(), kind, config, registry)
    }

    pub fn with_id(id: Uuid, kind: JobKind, config: BatchConfig, registry: JobRegistry) -> Self {
        let (events, _) = broadcast::channel(BATCH_EVENT_CAPACITY);
        let notifier = SlotNotifier {
            session_id: id,
            events: events.clone(),
        };

        let keys: Vec<JobKey> = (1..=config.total_slots)
            .map(|slot| JobKey::slot(id, slot))
            .collect();
        let listeners = keys
            .iter()
            .enumerate()
            .map(|(i, key)| {
                let notifier = notifier.clone();
                let slot = i + 1;
                let listener = registry.on_change(key, move |event: &JobEvent| {
                    if let Some(status) = event.terminal_status() {
                        notifier.on_slot_terminal(slot, status);
                    }
                });
                (key.clone(), listener)
            })
            .collect();

        Self {
            id,
            kind,
            total_slots: config.total_slots,
            concurrency_limit: config.concurrency_limit,
            registry,
            keys,
            listeners,
            admission: Mutex::new(()),
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn total_slots(&self) -> usize {
        self.total_slots
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BatchEvent> {
        self.events.subscribe()
    }

    /// Key of 1-based `slot`.
    pub fn slot_key(&self, slot: usize) -> Result<&JobKey, JobError> {
        slot.checked_sub(1)
            .and_then(|i| self.keys.get(i))
            .ok_or(JobError::SlotOutOfRange {
                slot,
                total: self.total_slots,
            })
    }

    pub fn slots(&self) -> Vec<SlotView> {
        self.registry
            .get_many(&self.keys)
            .into_iter()
            .zip(&self.keys)
            .enumerate()
            .map(|(i, (record, key))| SlotView {
                slot: i + 1,
                key: key.clone(),
                status: record.as_ref().map_or(JobStatus::Idle, |r| r.status),
                record,
            })
            .collect()
    }

    pub fn occupancy(&self) -> Occupancy {
        self.slots()
            .iter()
            .fold(Occupancy::default(), |mut acc, view| {
                if view.status.is_live() {
                    acc.live += 1;
                }
                if view.status != JobStatus::Idle {
                    acc.used += 1;
                }
                if view.status == JobStatus::Succeeded {
                    acc.succeeded += 1;
                }
                acc
            })
    }

    /// Start up to `requested` more slots. Returns the slots admitted.
    ///
    /// Admission is `min(requested, limit − live, total − used)`; the
    /// lowest idle slots are filled first. Every admitted slot's request is
    /// validated before any is started.
    pub async fn request_more<F>(
        &self,
        requested: usize,
        backend: Arc<dyn GenerationBackend>,
        request_for_slot: F,
    ) -> Result<Vec<usize>, JobError>
    where
        F: Fn(usize) -> GenerationRequest,
    {
        let _admission = self.admission.lock().await;

        let occupancy = self.occupancy();
        let room = self
            .concurrency_limit
            .saturating_sub(occupancy.live)
            .min(self.total_slots.saturating_sub(occupancy.used));
        let admitted = requested.min(room);

        let slots: Vec<usize> = self
            .slots()
            .into_iter()
            .filter(|view| view.status == JobStatus::Idle)
            .map(|view| view.slot)
            .take(admitted)
            .collect();

        let mut planned = Vec::with_capacity(slots.len());
        for slot in slots {
            let key = self.slot_key(slot)?.clone();
            let request = request_for_slot(slot);
            request
                .validate(self.kind)
                .map_err(|reason| JobError::Validation {
                    key: key.clone(),
                    reason,
                })?;
            planned.push((slot, key, request));
        }

        info!(
            session_id = %self.id,
            requested,
            admitted = planned.len(),
            live = occupancy.live,
            used = occupancy.used,
            "Batch admission"
        );

        let starts = planned.into_iter().map(|(slot, key, request)| {
            let backend = Arc::clone(&backend);
            async move {
                (
                    slot,
                    self.registry.start(key, self.kind, request, backend).await,
                )
            }
        });

        let mut started = Vec::new();
        for (slot, outcome) in join_all(starts).await {
            match outcome {
                Ok(record) => {
                    debug!(session_id = %self.id, slot, status = %record.status, "Slot started");
                    started.push(slot);
                }
                Err(e) => warn!(session_id = %self.id, slot, error = %e, "Slot failed to start"),
            }
        }
        Ok(started)
    }

    /// The record of `slot`, if a carousel may be built from it.
    pub fn offer_carousel(&self, slot: usize) -> Result<JobRecord, JobError> {
        let key = self.slot_key(slot)?;
        match self.registry.get(key) {
            Some(record) if record.status == JobStatus::Succeeded => Ok(record),
            other => Err(JobError::CarouselUnavailable {
                slot,
                status: other.map_or(JobStatus::Idle, |r| r.status),
            }),
        }
    }

    /// Start the carousel job for this session from the succeeded slots,
    /// `slot` first.
    pub async fn create_carousel(
        &self,
        slot: usize,
        backend: Arc<dyn GenerationBackend>,
    ) -> Result<JobRecord, JobError> {
        let chosen = self.offer_carousel(slot)?;

        let mut images: Vec<String> = chosen.result.into_iter().collect();
        images.extend(
            self.slots()
                .into_iter()
                .filter(|view| view.slot != slot)
                .filter_map(|view| view.record)
                .filter(|record| record.status == JobStatus::Succeeded)
                .filter_map(|record| record.result),
        );

        info!(session_id = %self.id, slot, images = images.len(), "Creating carousel");
        self.registry
            .start(
                JobKey::carousel(self.id),
                JobKind::Carousel,
                GenerationRequest::with_images(images),
                backend,
            )
            .await
    }

    pub fn carousel(&self) -> Option<JobRecord> {
        self.registry.get(&JobKey::carousel(self.id))
    }

    /// Cancel every live slot and the carousel.
    pub fn cancel_all(&self) {
        for key in &self.keys {
            self.registry.cancel(key);
        }
        self.registry.cancel(&JobKey::carousel(self.id));
    }
}

impl Drop for BatchSession {
    fn drop(&mut self) {
        for (key, listener) in &self.listeners {
            self.registry.remove_listener(key, *listener);
        }
    }
}

/// Directory of open batch sessions.
///
/// With a [`BatchStore`], session metadata is written on create and removed
/// on close, so [`BatchSessions::restore_all`] can rebuild the directory
/// after a restart. Slot state comes back with the job snapshots.
pub struct BatchSessions {
    registry: JobRegistry,
    config: BatchConfig,
    store: Option<Arc<dyn BatchStore>>,
    sessions: RwLock<HashMap<Uuid, Arc<BatchSession>>>,
}

impl BatchSessions {
    pub fn new(registry: JobRegistry, config: BatchConfig) -> Self {
        Self::build(registry, config, None)
    }

    pub fn with_store(registry: JobRegistry, config: BatchConfig, store: Arc<dyn BatchStore>) -> Self {
        Self::build(registry, config, Some(store))
    }

    fn build(registry: JobRegistry, config: BatchConfig, store: Option<Arc<dyn BatchStore>>) -> Self {
        Self {
            registry,
            config,
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, kind: JobKind) -> Arc<BatchSession> {
        let session = Arc::new(BatchSession::new(kind, self.config, self.registry.clone()));
        if let Some(store) = &self.store {
            let record = BatchRecord {
                id: session.id(),
                kind,
                config: self.config,
                created_at: Utc::now(),
            };
            if let Err(e) = store.put_batch(&record).await {
                warn!(session_id = %session.id(), error = %e, "Failed to persist batch session");
            }
        }

        self.sessions
            .write()
            .await
            .insert(session.id(), Arc::clone(&session));
        info!(
            session_id = %session.id(),
            kind = %kind,
            total_slots = self.config.total_slots,
            concurrency_limit = self.config.concurrency_limit,
            "Batch session created"
        );
        session
    }

    pub async fn get(&self, id: Uuid) -> Result<Arc<BatchSession>, JobError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(JobError::BatchNotFound { id })
    }

    /// Close a session, canceling whatever it still has in flight.
    pub async fn close(&self, id: Uuid) -> Result<(), JobError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(JobError::BatchNotFound { id })?;
        session.cancel_all();
        if let Some(store) = &self.store {
            if let Err(e) = store.delete_batch(id).await {
                warn!(session_id = %id, error = %e, "Failed to delete batch session");
            }
        }
        info!(session_id = %id, "Batch session closed");
        Ok(())
    }

    /// Rebuild sessions after a restart. Call after the registry has
    /// restored its jobs.
    ///
    /// Stored sessions come back with their own caps. Slot jobs whose
    /// session was never stored are regrouped under the default caps, with
    /// the kind taken from the slot records. Returns how many sessions were
    /// rebuilt.
    pub async fn restore_all(&self) -> Result<usize, DatabaseError> {
        let mut plans: Vec<BatchRecord> = match &self.store {
            Some(store) => store.list_batches().await?,
            None => Vec::new(),
        };

        for record in self.registry.list() {
            let Some((id, _)) = record.key.batch_slot() else {
                continue;
            };
            if plans.iter().all(|plan| plan.id != id) {
                debug!(session_id = %id, key = %record.key, "Regrouping unstored batch session");
                plans.push(BatchRecord {
                    id,
                    kind: record.kind,
                    config: self.config,
                    created_at: record.created_at,
                });
            }
        }

        let mut sessions = self.sessions.write().await;
        let mut restored = 0;
        for plan in plans {
            if sessions.contains_key(&plan.id) {
                continue;
            }
            let session = Arc::new(BatchSession::with_id(
                plan.id,
                plan.kind,
                plan.config,
                self.registry.clone(),
            ));
            let occupancy = session.occupancy();
            info!(
                session_id = %plan.id,
                kind = %plan.kind,
                live = occupancy.live,
                used = occupancy.used,
                "Batch session restored"
            );
            sessions.insert(plan.id, session);
            restored += 1;
        }
        Ok(restored)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }
}

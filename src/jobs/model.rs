//! Job data model: keys, kinds, the status state machine, and job records.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::JobHandles;
use crate::error::JobError;
use crate::jobs::classifier::ClassifiedError;

/// Cap on the per-record transition history.
const MAX_TRANSITIONS: usize = 50;

/// Stable identifier of the entity a job is generated for (a concept, an
/// image, a batch slot). At most one live job exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn new(owner: impl Into<String>) -> Self {
        Self(owner.into())
    }

    /// Key for slot `index` (1-based) of a batch session.
    pub fn slot(session_id: Uuid, index: usize) -> Self {
        Self(format!("batch:{session_id}:{index}"))
    }

    /// Session id and slot index, if this is a batch slot key.
    pub fn batch_slot(&self) -> Option<(Uuid, usize)> {
        let (session, index) = self.0.strip_prefix("batch:")?.rsplit_once(':')?;
        Some((Uuid::parse_str(session).ok()?, index.parse().ok()?))
    }

    /// Key for the carousel assembled from a batch session.
    pub fn carousel(session_id: Uuid) -> Self {
        Self(format!("carousel:{session_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobKey {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// What is being generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Image,
    Video,
    Grid,
    Carousel,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Video => "video",
            Self::Grid => "grid",
            Self::Carousel => "carousel",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => Ok(Self::Image),
            "video" => Ok(Self::Video),
            "grid" => Ok(Self::Grid),
            "carousel" => Ok(Self::Carousel),
            other => Err(format!("unknown job kind '{other}'")),
        }
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// No generation requested yet.
    Idle,
    /// Submit call in flight.
    Submitting,
    /// Pre-processing before the generation call (e.g. motion description).
    Analyzing,
    /// Accepted upstream; being status-checked.
    Polling,
    Succeeded,
    Failed,
    /// Attempt ceiling reached without a terminal upstream status.
    TimedOut,
    Canceled,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            (Idle, Submitting) | (Idle, Canceled) |
            (Submitting, Analyzing) | (Submitting, Polling) |
            (Submitting, Failed) | (Submitting, Canceled) |
            (Analyzing, Polling) | (Analyzing, Failed) | (Analyzing, Canceled) |
            (Polling, Succeeded) | (Polling, Failed) |
            (Polling, TimedOut) | (Polling, Canceled)
        )
    }

    /// Terminal states are final.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Failed | Self::TimedOut | Self::Canceled
        )
    }

    /// Live states are the ones that occupy a key (and a batch slot).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Submitting | Self::Analyzing | Self::Polling)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Submitting => "submitting",
            Self::Analyzing => "analyzing",
            Self::Polling => "polling",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "submitting" => Ok(Self::Submitting),
            "analyzing" => Ok(Self::Analyzing),
            "polling" => Ok(Self::Polling),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "canceled" => Ok(Self::Canceled),
            other => Err(format!("unknown job status '{other}'")),
        }
    }
}

/// A state transition event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// What the caller wants generated. The payload content is opaque to the
/// orchestrator apart from the inputs each kind requires.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Source or reference images (URLs or blob references).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    /// Provider-specific parameters, passed through untouched.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl GenerationRequest {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    pub fn with_images<I, S>(images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            images: images.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn and_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = Some(prompt.into());
        self
    }

    /// Check the inputs `kind` requires before anything is submitted.
    pub fn validate(&self, kind: JobKind) -> Result<(), String> {
        let has_prompt = self
            .prompt
            .as_deref()
            .is_some_and(|p| !p.trim().is_empty());
        let image_count = self.images.iter().filter(|i| !i.trim().is_empty()).count();

        match kind {
            JobKind::Image if !has_prompt => Err("image generation requires a prompt".into()),
            JobKind::Video if image_count == 0 => {
                Err("video generation requires a source image".into())
            }
            JobKind::Grid if image_count == 0 => {
                Err("grid generation requires a reference image".into())
            }
            JobKind::Carousel if image_count == 0 => {
                Err("carousel requires at least one generated image".into())
            }
            _ => Ok(()),
        }
    }
}

/// One tracked generation job.
///
/// Records handed out by the registry are copies; the registry's copy is the
/// only one that is ever mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Identity of this particular attempt at generating for `key`.
    pub job_id: Uuid,
    pub key: JobKey,
    pub kind: JobKind,
    pub status: JobStatus,
    pub external_id: Option<String>,
    pub secondary_id: Option<String>,
    /// Status checks performed.
    pub attempts: u32,
    /// Last progress (0–100) reported by a status check.
    pub progress: Option<u8>,
    pub result: Option<String>,
    pub error: Option<ClassifiedError>,
    pub created_at: DateTime<Utc>,
    pub last_polled_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<StateTransition>,
}

impl JobRecord {
    /// A fresh record in `idle`.
    pub fn new(key: JobKey, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            job_id: Uuid::new_v4(),
            key,
            kind,
            status: JobStatus::Idle,
            external_id: None,
            secondary_id: None,
            attempts: 0,
            progress: None,
            result: None,
            error: None,
            created_at: now,
            last_polled_at: None,
            updated_at: now,
            transitions: Vec::new(),
        }
    }

    pub fn handles(&self) -> Option<JobHandles> {
        self.external_id.as_ref().map(|id| JobHandles {
            external_id: id.clone(),
            secondary_id: self.secondary_id.clone(),
        })
    }

    fn transition_to(&mut self, target: JobStatus, reason: Option<String>) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.job_id,
                from: self.status,
                to: target,
            });
        }

        let now = Utc::now();
        self.transitions.push(StateTransition {
            from: self.status,
            to: target,
            at: now,
            reason,
        });
        if self.transitions.len() > MAX_TRANSITIONS {
            let drain_count = self.transitions.len() - MAX_TRANSITIONS;
            self.transitions.drain(..drain_count);
        }

        self.status = target;
        self.updated_at = now;
        Ok(())
    }

    pub fn begin_submission(&mut self) -> Result<(), JobError> {
        self.transition_to(JobStatus::Submitting, None)
    }

    pub fn begin_analysis(&mut self) -> Result<(), JobError> {
        self.transition_to(JobStatus::Analyzing, None)
    }

    /// Upstream accepted the job; record its handles.
    pub fn begin_polling(&mut self, handles: JobHandles) -> Result<(), JobError> {
        self.transition_to(JobStatus::Polling, None)?;
        self.external_id = Some(handles.external_id);
        self.secondary_id = handles.secondary_id;
        Ok(())
    }

    /// Count one status check; progress is applied before status is judged.
    pub fn record_attempt(&mut self, progress: Option<u8>) {
        let now = Utc::now();
        self.attempts = self.attempts.saturating_add(1);
        if let Some(p) = progress {
            self.progress = Some(p.min(100));
        }
        self.last_polled_at = Some(now);
        self.updated_at = now;
    }

    pub fn succeed(&mut self, result: String) -> Result<(), JobError> {
        self.transition_to(JobStatus::Succeeded, None)?;
        self.progress = Some(100);
        self.result = Some(result);
        Ok(())
    }

    pub fn fail(&mut self, error: ClassifiedError) -> Result<(), JobError> {
        self.transition_to(JobStatus::Failed, Some(error.message.clone()))?;
        self.error = Some(error);
        Ok(())
    }

    pub fn time_out(&mut self, error: ClassifiedError) -> Result<(), JobError> {
        self.transition_to(JobStatus::TimedOut, Some(error.message.clone()))?;
        self.error = Some(error);
        Ok(())
    }

    pub fn cancel(&mut self, reason: impl Into<String>) -> Result<(), JobError> {
        self.transition_to(JobStatus::Canceled, Some(reason.into()))
    }

    /// Check the result/error/handle invariants. Returns the first violation.
    pub fn check_invariants(&self) -> Result<(), String> {
        let succeeded = self.status == JobStatus::Succeeded;
        if succeeded != self.result.is_some() {
            return Err(format!(
                "result presence ({}) disagrees with status {}",
                self.result.is_some(),
                self.status
            ));
        }

        let errored = matches!(self.status, JobStatus::Failed | JobStatus::TimedOut);
        if errored != self.error.is_some() {
            return Err(format!(
                "error presence ({}) disagrees with status {}",
                self.error.is_some(),
                self.status
            ));
        }

        if matches!(self.status, JobStatus::Polling | JobStatus::Succeeded)
            && self.external_id.is_none()
        {
            return Err(format!("status {} without an external id", self.status));
        }

        Ok(())
    }
}

/// Change notifications published by the registry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A status transition. `record` is the state after the transition.
    Transition {
        key: JobKey,
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
        record: Box<JobRecord>,
    },
    /// A status check ran without changing status.
    Progress {
        key: JobKey,
        job_id: Uuid,
        attempts: u32,
        progress: Option<u8>,
    },
}

impl JobEvent {
    pub fn key(&self) -> &JobKey {
        match self {
            Self::Transition { key, .. } | Self::Progress { key, .. } => key,
        }
    }

    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Transition { job_id, .. } | Self::Progress { job_id, .. } => *job_id,
        }
    }

    /// The terminal status this event entered, if any.
    pub fn terminal_status(&self) -> Option<JobStatus> {
        match self {
            Self::Transition { to, .. } if to.is_terminal() => Some(*to),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::classifier::ClassifiedError;

    fn handles() -> JobHandles {
        JobHandles {
            external_id: "ext-1".into(),
            secondary_id: Some("task-9".into()),
        }
    }

    #[test]
    fn state_transitions_valid() {
        assert!(JobStatus::Idle.can_transition_to(JobStatus::Submitting));
        assert!(JobStatus::Submitting.can_transition_to(JobStatus::Analyzing));
        assert!(JobStatus::Submitting.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Analyzing.can_transition_to(JobStatus::Polling));
        assert!(JobStatus::Polling.can_transition_to(JobStatus::TimedOut));
        assert!(JobStatus::Polling.can_transition_to(JobStatus::Canceled));
    }

    #[test]
    fn terminal_states_are_final() {
        let all = [
            JobStatus::Idle,
            JobStatus::Submitting,
            JobStatus::Analyzing,
            JobStatus::Polling,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::TimedOut,
            JobStatus::Canceled,
        ];
        for from in all.iter().filter(|s| s.is_terminal()) {
            for to in all {
                assert!(!from.can_transition_to(to), "{from} -> {to} must be rejected");
            }
        }
        assert!(!JobStatus::Submitting.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Polling.can_transition_to(JobStatus::Submitting));
    }

    #[test]
    fn live_states() {
        assert!(JobStatus::Polling.is_live());
        assert!(JobStatus::Analyzing.is_live());
        assert!(!JobStatus::Idle.is_live());
        assert!(!JobStatus::Canceled.is_live());
    }

    #[test]
    fn happy_path_keeps_invariants() {
        let mut record = JobRecord::new(JobKey::new("concept-1"), JobKind::Image);
        record.check_invariants().unwrap();

        record.begin_submission().unwrap();
        record.check_invariants().unwrap();

        record.begin_polling(handles()).unwrap();
        assert_eq!(record.external_id.as_deref(), Some("ext-1"));
        record.check_invariants().unwrap();

        record.record_attempt(Some(40));
        assert_eq!(record.attempts, 1);
        assert_eq!(record.progress, Some(40));

        record.succeed("https://cdn/img.png".into()).unwrap();
        record.check_invariants().unwrap();
        assert_eq!(record.progress, Some(100));
        assert_eq!(record.transitions.len(), 3);
    }

    #[test]
    fn failure_sets_error_only() {
        let mut record = JobRecord::new(JobKey::new("img-1"), JobKind::Video);
        record.begin_submission().unwrap();
        record
            .fail(ClassifiedError::resource_exhausted("no credits"))
            .unwrap();
        assert!(record.result.is_none());
        assert!(record.error.is_some());
        record.check_invariants().unwrap();
        assert!(record.cancel("late").is_err());
    }

    #[test]
    fn progress_is_clamped() {
        let mut record = JobRecord::new(JobKey::new("img-1"), JobKind::Image);
        record.record_attempt(Some(250));
        assert_eq!(record.progress, Some(100));
        record.record_attempt(None);
        assert_eq!(record.progress, Some(100));
        assert_eq!(record.attempts, 2);
    }

    #[test]
    fn invariant_violation_detected() {
        let mut record = JobRecord::new(JobKey::new("img-1"), JobKind::Image);
        record.result = Some("oops".into());
        assert!(record.check_invariants().is_err());
    }

    #[test]
    fn validation_per_kind() {
        assert!(GenerationRequest::default().validate(JobKind::Image).is_err());
        assert!(GenerationRequest::with_prompt("  ").validate(JobKind::Image).is_err());
        assert!(GenerationRequest::with_prompt("a cat").validate(JobKind::Image).is_ok());
        assert!(GenerationRequest::with_prompt("pan").validate(JobKind::Video).is_err());
        assert!(GenerationRequest::with_images(["a.png"]).validate(JobKind::Video).is_ok());
        assert!(GenerationRequest::with_images([""]).validate(JobKind::Grid).is_err());
        assert!(GenerationRequest::with_images(["a.png"]).validate(JobKind::Carousel).is_ok());
    }

    #[test]
    fn slot_keys_are_distinct() {
        let session = Uuid::new_v4();
        assert_ne!(JobKey::slot(session, 1), JobKey::slot(session, 2));
        assert!(JobKey::slot(session, 3).as_str().ends_with(":3"));
    }

    #[test]
    fn slot_keys_parse_back() {
        let session = Uuid::new_v4();
        assert_eq!(JobKey::slot(session, 7).batch_slot(), Some((session, 7)));
        assert_eq!(JobKey::carousel(session).batch_slot(), None);
        assert_eq!(JobKey::new("batch:not-a-uuid:1").batch_slot(), None);
        assert_eq!(JobKey::new("concept-1").batch_slot(), None);
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&JobStatus::TimedOut).unwrap();
        assert_eq!(json, "\"timed_out\"");
        let parsed: JobStatus = json.trim_matches('"').parse().unwrap();
        assert_eq!(parsed, JobStatus::TimedOut);
    }
}

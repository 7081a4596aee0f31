//! Generation backend: the submit / status-check collaborator.
//!
//! The orchestrator never talks to a provider directly. Each call site hands
//! the registry a [`GenerationBackend`]; `http` holds the REST implementation.

pub mod http;

pub use http::HttpGenerationBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CollaboratorError;
use crate::jobs::model::{GenerationRequest, JobKind};

/// Handles returned by a successful submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobHandles {
    pub external_id: String,
    /// Some providers need a second id (e.g. a task id) to check status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_id: Option<String>,
}

impl JobHandles {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            secondary_id: None,
        }
    }

    pub fn with_secondary(mut self, secondary_id: impl Into<String>) -> Self {
        self.secondary_id = Some(secondary_id.into());
        self
    }
}

/// Upstream view of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Pending,
    Succeeded,
    Failed,
}

/// One status-check answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: RemoteStatus,
    #[serde(default)]
    pub progress: Option<u8>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusReport {
    pub fn pending(progress: Option<u8>) -> Self {
        Self {
            status: RemoteStatus::Pending,
            progress,
            result: None,
            error: None,
        }
    }

    pub fn succeeded(result: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Succeeded,
            progress: Some(100),
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: RemoteStatus::Failed,
            progress: None,
            result: None,
            error: Some(error.into()),
        }
    }
}

/// Remote generation service.
///
/// `check_status` may be called far more often than the job changes state.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Whether `kind` needs the analyzing stage before submission.
    fn requires_analysis(&self, _kind: JobKind) -> bool {
        false
    }

    /// Pre-processing stage (e.g. deriving a motion description for a
    /// video). Returns the request to actually submit.
    async fn analyze(
        &self,
        _kind: JobKind,
        request: GenerationRequest,
    ) -> Result<GenerationRequest, CollaboratorError> {
        Ok(request)
    }

    /// Start a remote job. Called once per `start`.
    async fn submit(
        &self,
        kind: JobKind,
        request: &GenerationRequest,
    ) -> Result<JobHandles, CollaboratorError>;

    /// Ask upstream where the job is.
    async fn check_status(&self, handles: &JobHandles) -> Result<StatusReport, CollaboratorError>;
}

//! Error types for the generation orchestrator.

use uuid::Uuid;

use crate::jobs::model::{JobKey, JobStatus};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote store error: {0}")]
    Remote(String),
}

/// Raw failures reported by the submit / status-check / persist collaborators.
///
/// These are never acted on directly: the classifier turns them into a
/// [`crate::jobs::classifier::ClassifiedError`] first.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CollaboratorError {
    #[error("Missing required input: {0}")]
    Validation(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Upstream returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Upstream reported failure: {0}")]
    UpstreamFailed(String),

    #[error("Insufficient resource: {0}")]
    InsufficientResource(String),

    #[error("Malformed upstream response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::Http {
                status: status.as_u16(),
                message: e.to_string(),
            };
        }
        if e.is_decode() {
            return Self::MalformedResponse(e.to_string());
        }
        Self::Transport(e.to_string())
    }
}

/// Job lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Validation failed for {key}: {reason}")]
    Validation { key: JobKey, reason: String },

    #[error("No job for {key}")]
    NotFound { key: JobKey },

    #[error("Job {id} in state {from} cannot transition to {to}")]
    InvalidTransition {
        id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} for {key} was superseded or cancelled before submission completed")]
    Superseded { key: JobKey, id: Uuid },

    #[error("Carousel unavailable: slot {slot} is {status}")]
    CarouselUnavailable { slot: usize, status: JobStatus },

    #[error("Slot {slot} out of range (session has {total} slots)")]
    SlotOutOfRange { slot: usize, total: usize },

    #[error("Batch session {id} not found")]
    BatchNotFound { id: Uuid },
}

/// Result type alias for the orchestrator.
pub type Result<T> = std::result::Result<T, Error>;

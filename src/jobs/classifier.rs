//! Error classification.
//!
//! Submission and poll failures arrive as raw [`CollaboratorError`]s. The
//! state machine and the API only ever act on the classified form.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::PollPolicy;
use crate::error::CollaboratorError;

/// Status code upstream uses to say the caller is out of credits.
pub const RESOURCE_EXHAUSTED_STATUS: u16 = 402;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing required input; never submitted.
    Validation,
    /// Caller lacks the quota/credits to proceed.
    ResourceExhausted,
    /// Network, timeout or upstream 5xx while polling. Retried.
    Transient,
    /// Upstream explicitly reported the job failed.
    UpstreamFailure,
    /// Local attempt ceiling exceeded.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::ResourceExhausted => "resource_exhausted",
            Self::Transient => "transient",
            Self::UpstreamFailure => "upstream_failure",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "validation" => Ok(Self::Validation),
            "resource_exhausted" => Ok(Self::ResourceExhausted),
            "transient" => Ok(Self::Transient),
            "upstream_failure" => Ok(Self::UpstreamFailure),
            "timeout" => Ok(Self::Timeout),
            other => Err(format!("unknown error kind '{other}'")),
        }
    }
}

/// A classified failure: what the rest of the system reacts to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: ErrorKind,
    pub message: String,
    pub transient: bool,
}

impl ClassifiedError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transient: kind == ErrorKind::Transient,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn upstream_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamFailure, message)
    }

    /// The attempt ceiling of `policy` was reached.
    pub fn timeout(policy: &PollPolicy) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "generation exceeded expected duration ({} checks over {:?})",
                policy.max_attempts,
                policy.timeout()
            ),
        )
    }

    /// Whether the caller should be offered a "top up" action instead of a
    /// generic retry.
    pub fn requires_top_up(&self) -> bool {
        self.kind == ErrorKind::ResourceExhausted
    }

    /// Text suitable for showing to an end user.
    pub fn user_message(&self) -> String {
        match self.kind {
            ErrorKind::ResourceExhausted => {
                "Not enough credits to generate. Top up to continue.".to_string()
            }
            ErrorKind::Timeout => "This is taking longer than expected.".to_string(),
            ErrorKind::Transient => "Still processing…".to_string(),
            ErrorKind::Validation | ErrorKind::UpstreamFailure => self.message.clone(),
        }
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Classify a raw collaborator failure.
pub fn classify(raw: &CollaboratorError) -> ClassifiedError {
    match raw {
        CollaboratorError::Validation(msg) => ClassifiedError::validation(msg.clone()),
        CollaboratorError::InsufficientResource(msg) => {
            ClassifiedError::resource_exhausted(msg.clone())
        }
        CollaboratorError::Transport(_)
        | CollaboratorError::Timeout(_)
        | CollaboratorError::MalformedResponse(_) => ClassifiedError::transient(raw.to_string()),
        CollaboratorError::Http { status, message } => classify_status(Some(*status), message),
        CollaboratorError::UpstreamFailed(msg) => ClassifiedError::upstream_failure(msg.clone()),
    }
}

/// Classify a failure from its message and HTTP status, if it had one.
///
/// No status means the request never got a response, which is transient.
pub fn classify_status(http_status: Option<u16>, message: &str) -> ClassifiedError {
    match http_status {
        Some(RESOURCE_EXHAUSTED_STATUS) => ClassifiedError::resource_exhausted(message),
        Some(408 | 425 | 429) => ClassifiedError::transient(message),
        Some(status) if status >= 500 => ClassifiedError::transient(message),
        Some(_) => ClassifiedError::upstream_failure(message),
        None => ClassifiedError::transient(message),
    }
}

/// Classify a failure of the submit (or analyze) call.
///
/// There is no poller yet to retry a transient submission failure, so it is
/// reported as a terminal upstream failure.
pub fn classify_submission(raw: &CollaboratorError) -> ClassifiedError {
    let classified = classify(raw);
    if classified.transient {
        ClassifiedError::upstream_failure(format!("submission failed: {}", classified.message))
    } else {
        classified
    }
}

//! Configuration types.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;
use crate::jobs::model::JobKind;

/// How often a job is status-checked and how many checks it gets.
///
/// There is no wall-clock deadline: the effective timeout is
/// `interval × max_attempts`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Effective timeout implied by the attempt ceiling.
    pub fn timeout(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

/// Per-kind polling policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicies {
    pub image: PollPolicy,
    pub video: PollPolicy,
    pub grid: PollPolicy,
    pub carousel: PollPolicy,
}

impl PollPolicies {
    pub fn for_kind(&self, kind: JobKind) -> PollPolicy {
        match kind {
            JobKind::Image => self.image,
            JobKind::Video => self.video,
            JobKind::Grid => self.grid,
            JobKind::Carousel => self.carousel,
        }
    }

    /// Same policy for every kind (mostly useful in tests).
    pub fn uniform(policy: PollPolicy) -> Self {
        Self {
            image: policy,
            video: policy,
            grid: policy,
            carousel: policy,
        }
    }
}

impl Default for PollPolicies {
    fn default() -> Self {
        // Image jobs finish in about a minute upstream; video and grid
        // batches take several.
        let long = PollPolicy::new(Duration::from_secs(5), 120);
        Self {
            image: PollPolicy::new(Duration::from_secs(3), 60),
            video: long,
            grid: long,
            carousel: long,
        }
    }
}

/// Batch session caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Fixed number of slots per session.
    pub total_slots: usize,
    /// Maximum slots that may be in flight at once.
    pub concurrency_limit: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            total_slots: 8,
            concurrency_limit: 3,
        }
    }
}

/// Retry policy for writing a succeeded result to the authoritative store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub max_attempts: u32,
    /// Delay before retry `n` is `backoff × n`.
    pub backoff: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub polling: PollPolicies,
    pub batch: BatchConfig,
    pub reconcile: ReconcileConfig,
    /// Broadcast channel capacity for job events.
    pub event_capacity: usize,
}

impl OrchestratorConfig {
    pub fn with_polling(polling: PollPolicies) -> Self {
        Self {
            polling,
            ..Self::default()
        }
    }

    pub(crate) fn event_capacity(&self) -> usize {
        if self.event_capacity == 0 {
            DEFAULT_EVENT_CAPACITY
        } else {
            self.event_capacity
        }
    }
}

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Process-level configuration for the server binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    pub backend_url: String,
    pub api_key: SecretString,
    /// Authoritative remote result store. Falls back to the local database.
    pub results_url: Option<String>,
    /// Directory for rolling log files. Logs go to stderr only when unset.
    pub log_dir: Option<PathBuf>,
    pub orchestrator: OrchestratorConfig,
}

impl ServerConfig {
    /// Read configuration from `GEN_ORCH_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let backend_url = lookup("GEN_ORCH_BACKEND_URL")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("GEN_ORCH_BACKEND_URL".into()))?;

        let api_key = lookup("GEN_ORCH_API_KEY")
            .filter(|s| !s.trim().is_empty())
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("GEN_ORCH_API_KEY".into()))?;

        let bind = match lookup("GEN_ORCH_BIND") {
            Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "GEN_ORCH_BIND".into(),
                message: format!("{raw:?}: {e}"),
            })?,
            None => SocketAddr::from(([0, 0, 0, 0], 8080)),
        };

        let db_path = lookup("GEN_ORCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./data/gen-orchestrator.db"));

        let results_url = lookup("GEN_ORCH_RESULTS_URL").filter(|s| !s.trim().is_empty());
        let log_dir = lookup("GEN_ORCH_LOG_DIR").map(PathBuf::from);

        let defaults = PollPolicies::default();
        let polling = PollPolicies {
            image: policy_from_lookup(&lookup, "IMAGE", defaults.image)?,
            video: policy_from_lookup(&lookup, "VIDEO", defaults.video)?,
            grid: policy_from_lookup(&lookup, "GRID", defaults.grid)?,
            carousel: policy_from_lookup(&lookup, "CAROUSEL", defaults.carousel)?,
        };

        let batch_defaults = BatchConfig::default();
        let batch = BatchConfig {
            total_slots: parse_var(&lookup, "GEN_ORCH_BATCH_SLOTS")?
                .unwrap_or(batch_defaults.total_slots),
            concurrency_limit: parse_var(&lookup, "GEN_ORCH_BATCH_CONCURRENCY")?
                .unwrap_or(batch_defaults.concurrency_limit),
        };

        Ok(Self {
            bind,
            db_path,
            backend_url,
            api_key,
            results_url,
            log_dir,
            orchestrator: OrchestratorConfig {
                polling,
                batch,
                ..OrchestratorConfig::default()
            },
        })
    }
}

fn policy_from_lookup<F>(
    lookup: &F,
    kind: &str,
    default: PollPolicy,
) -> Result<PollPolicy, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let interval = parse_var::<u64, _>(lookup, &format!("GEN_ORCH_{kind}_POLL_MS"))?
        .map(Duration::from_millis)
        .unwrap_or(default.interval);
    let max_attempts = parse_var(lookup, &format!("GEN_ORCH_{kind}_MAX_ATTEMPTS"))?
        .unwrap_or(default.max_attempts);

    if max_attempts == 0 {
        return Err(ConfigError::InvalidValue {
            key: format!("GEN_ORCH_{kind}_MAX_ATTEMPTS"),
            message: "must be at least 1".into(),
        });
    }

    Ok(PollPolicy::new(interval, max_attempts))
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        None => Ok(None),
    }
}

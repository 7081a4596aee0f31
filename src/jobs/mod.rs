//! Generation job orchestration: records, polling, the registry, batches,
//! and persistence.

pub mod batch;
pub mod classifier;
pub mod model;
pub mod persistence;
pub mod poller;
pub mod registry;

pub use batch::{BatchEvent, BatchSession, BatchSessions, Occupancy, SlotView};
pub use classifier::{ClassifiedError, ErrorKind, classify, classify_status, classify_submission};
pub use model::{
    GenerationRequest, JobEvent, JobKey, JobKind, JobRecord, JobStatus, StateTransition,
};
pub use persistence::{PersistenceBridge, Restored};
pub use poller::{PollStep, PollerHandle, evaluate_poll};
pub use registry::{JobRegistry, Listener, ListenerId};

//! Persistence layer: job snapshots and authoritative results.

pub mod http;
pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use http::HttpResultStore;
pub use libsql_backend::LibSqlBackend;
pub use memory::MemoryStore;
pub use traits::{
    BatchRecord, BatchStore, JobSnapshot, OwnerResult, ResultStore, SnapshotStore,
};

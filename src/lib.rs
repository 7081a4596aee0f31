//! Gen Orchestrator: long-running generation job tracking.

pub mod api;
pub mod backend;
pub mod config;
pub mod error;
pub mod jobs;
pub mod store;

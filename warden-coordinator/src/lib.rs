//! Warden Coordinator
//!
//! Ownership leases, node tracking and pipeline tracking on top of a shared
//! store. Every operation runs inside a project scope
//! (see [`warden_core::tenant::scope`]).

pub mod db;
pub mod error;
pub mod repository;
pub mod service;

pub use error::{CoordinationError, Result, StoreError};
pub use repository::{
    InMemoryPipelineRepository, PgPipelineRepository, PipelineRepository, TableSet, WriteFence,
};
pub use service::{Coordinator, LeaseManager, NodeTracker, PipelineTracker, RetryOutcome};

//! Scheduler layer for the worker
//!
//! Polls the shared store for claimable pipelines and drives each claimed
//! pipeline from its first unfinished step to a terminal status.

pub mod poller;

pub use poller::{PipelinePoller, RunOutcome};

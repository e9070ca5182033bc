//! Service layer
//!
//! Step execution for the worker. The executor is trait-based so the poller
//! can be driven by real extraction code or by test doubles.

mod execution;

pub use execution::{ProgressReporter, StepContext, StepExecutor, TracingStepExecutor};

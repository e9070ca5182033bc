//! Core domain types
//!
//! Structures and state machines for pipelines, their nodes and the ownership
//! lease. Transition rules live here as pure functions; the coordinator turns
//! their output into conditional store updates.

pub mod error;
pub mod lease;
pub mod node;
pub mod pipeline;

//! Data Transfer Objects
//!
//! Requests accepted by the coordinator and summaries rendered by the CLI.

pub mod node;
pub mod pipeline;

//! Warden Core
//!
//! Core types and abstractions shared by every Warden component.
//!
//! This crate contains:
//! - Domain types: pipelines, nodes, leases and their state machines
//! - DTOs: requests and summaries exchanged with the coordinator
//! - Pipeline definitions: the fixed, ordered step list of each pipeline kind
//! - Collaborators: the task-scoped tenant (project) and the clock
//!
//! Note: persistence lives in the coordinator, execution in the worker.

pub mod clock;
pub mod definition;
pub mod domain;
pub mod dto;
pub mod tenant;

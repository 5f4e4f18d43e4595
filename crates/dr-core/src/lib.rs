//! Core data model and shared services for the drover orchestrator.
//!
//! Everything that crosses a crate boundary lives here: the task model,
//! policy profiles, adapter descriptors, configuration, and the per-task
//! workspace lifecycle.

pub mod config;
pub mod events;
pub mod sanitize;
pub mod types;
pub mod workspace;

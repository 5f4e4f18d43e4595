//! The adapter layer: a uniform async facade over heterogeneous external
//! coding agents (CLI tools behind a PTY, HTTP model APIs, in-process
//! mocks), plus the registry and static routing table that pick an
//! adapter for each task phase.

pub mod adapter;
pub mod cli;
pub mod http;
pub mod mock;
pub mod registry;
mod wire;

pub use adapter::{
    AdapterError, AgentAdapter, Classification, PhaseOutcome, OutcomePayload, ReviewReport,
    TestReport, context_digest,
};
pub use registry::{AdapterRegistry, RegistryError};

//! Policy enforcement for the drover orchestrator: every shell command,
//! file write, network egress target, and adapter invocation passes
//! through [`guard::PolicyGuard`] before it is allowed to happen, and
//! every verdict is written to the audit log before it is returned.

pub mod guard;

pub use guard::{Decision, PolicyError, PolicyGuard, Result};

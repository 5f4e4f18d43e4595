//! Acceptance predicates: named pass/fail gates resolved from the task's
//! acceptance criteria and invoked through the sandbox like any other
//! external tool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use dr_core::types::PatchSet;
use dr_sandbox::{ExitReason, SandboxCtx, SandboxRunner};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PredicateError {
    #[error("unknown acceptance predicate: `{0}`")]
    Unknown(String),
    #[error("duplicate predicate name: `{0}`")]
    Duplicate(String),
}

// ---------------------------------------------------------------------------
// AcceptancePredicate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredicateResult {
    pub passed: bool,
    pub summary: String,
}

/// One named acceptance gate. Implementations see the workspace (through
/// the sandbox context) and the patch set under evaluation; they run
/// their tooling through the sandbox, never against the filesystem
/// directly.
#[async_trait]
pub trait AcceptancePredicate: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        runner: &SandboxRunner,
        ctx: &SandboxCtx,
        patch: Option<&PatchSet>,
    ) -> PredicateResult;
}

// ---------------------------------------------------------------------------
// PredicateRegistry
// ---------------------------------------------------------------------------

/// Registry of predicates, keyed by the names tasks reference in their
/// acceptance criteria. Loaded at startup, read-only afterwards.
pub struct PredicateRegistry {
    map: HashMap<String, Arc<dyn AcceptancePredicate>>,
}

impl PredicateRegistry {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        predicate: Arc<dyn AcceptancePredicate>,
    ) -> Result<(), PredicateError> {
        let name = predicate.name().to_string();
        if self.map.contains_key(&name) {
            return Err(PredicateError::Duplicate(name));
        }
        self.map.insert(name, predicate);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AcceptancePredicate>, PredicateError> {
        self.map
            .get(name)
            .cloned()
            .ok_or_else(|| PredicateError::Unknown(name.to_string()))
    }

    /// Resolve an ordered criteria list, failing on the first unknown name.
    pub fn resolve(
        &self,
        names: &[String],
    ) -> Result<Vec<Arc<dyn AcceptancePredicate>>, PredicateError> {
        names.iter().map(|n| self.get(n)).collect()
    }
}

impl Default for PredicateRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// ScriptPredicate — run a command, pass on exit 0
// ---------------------------------------------------------------------------

/// Runs a fixed command in the task workspace; the predicate passes when
/// the command exits 0 within its caps.
#[derive(Debug)]
pub struct ScriptPredicate {
    name: String,
    argv: Vec<String>,
    wait: Duration,
}

impl ScriptPredicate {
    pub fn new(name: impl Into<String>, argv: Vec<String>, wait: Duration) -> Self {
        Self {
            name: name.into(),
            argv,
            wait,
        }
    }
}

#[async_trait]
impl AcceptancePredicate for ScriptPredicate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(
        &self,
        runner: &SandboxRunner,
        ctx: &SandboxCtx,
        _patch: Option<&PatchSet>,
    ) -> PredicateResult {
        let mut handle = match runner.run(ctx, &self.argv, None).await {
            Ok(handle) => handle,
            Err(e) => {
                return PredicateResult {
                    passed: false,
                    summary: format!("{}: failed to start ({e})", self.name),
                }
            }
        };
        let outcome = match handle.wait(self.wait).await {
            Ok(outcome) => outcome,
            Err(e) => {
                handle.cancel(Duration::from_secs(1)).await;
                return PredicateResult {
                    passed: false,
                    summary: format!("{}: did not finish ({e})", self.name),
                };
            }
        };

        let passed = outcome.exit_reason == ExitReason::Normal && outcome.exit_code == Some(0);
        info!(
            predicate = %self.name,
            task_id = %ctx.task_id,
            passed,
            exit_code = ?outcome.exit_code,
            "acceptance predicate evaluated"
        );
        PredicateResult {
            passed,
            summary: format!(
                "{}: exit {:?} ({:?})",
                self.name, outcome.exit_code, outcome.exit_reason
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// FixedPredicate — scripted results for tests and demos
// ---------------------------------------------------------------------------

/// Returns a queued sequence of results, then repeats the last one.
#[derive(Debug)]
pub struct FixedPredicate {
    name: String,
    results: std::sync::Mutex<Vec<bool>>,
    last: std::sync::atomic::AtomicBool,
}

impl FixedPredicate {
    pub fn new(name: impl Into<String>, results: Vec<bool>) -> Self {
        let last = *results.last().unwrap_or(&true);
        Self {
            name: name.into(),
            results: std::sync::Mutex::new(results),
            last: std::sync::atomic::AtomicBool::new(last),
        }
    }

    pub fn passing(name: impl Into<String>) -> Self {
        Self::new(name, vec![true])
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self::new(name, vec![false])
    }
}

#[async_trait]
impl AcceptancePredicate for FixedPredicate {
    fn name(&self) -> &str {
        &self.name
    }

    async fn evaluate(
        &self,
        _runner: &SandboxRunner,
        _ctx: &SandboxCtx,
        _patch: Option<&PatchSet>,
    ) -> PredicateResult {
        let mut results = self.results.lock().expect("results poisoned");
        let passed = if results.is_empty() {
            self.last.load(std::sync::atomic::Ordering::Relaxed)
        } else {
            results.remove(0)
        };
        PredicateResult {
            passed,
            summary: format!(
                "{}: {}",
                self.name,
                if passed { "passed" } else { "failed" }
            ),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_resolves_in_order_and_rejects_unknown() {
        let mut registry = PredicateRegistry::new();
        registry
            .register(Arc::new(FixedPredicate::passing("unit_tests_pass")))
            .unwrap();
        registry
            .register(Arc::new(FixedPredicate::passing("lint_clean")))
            .unwrap();

        let resolved = registry
            .resolve(&["lint_clean".into(), "unit_tests_pass".into()])
            .unwrap();
        assert_eq!(resolved[0].name(), "lint_clean");
        assert_eq!(resolved[1].name(), "unit_tests_pass");

        let err = registry.resolve(&["nope".into()]).unwrap_err();
        assert!(matches!(err, PredicateError::Unknown(_)));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut registry = PredicateRegistry::new();
        registry
            .register(Arc::new(FixedPredicate::passing("p")))
            .unwrap();
        let err = registry
            .register(Arc::new(FixedPredicate::passing("p")))
            .unwrap_err();
        assert!(matches!(err, PredicateError::Duplicate(_)));
    }
}

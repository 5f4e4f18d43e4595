use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use regex::Regex;
use tracing::{debug, warn};

use dr_audit::AuditStore;
use dr_core::events::{AuditEntry, AuditKind};
use dr_core::types::{CostEstimate, PolicyProfile, Task};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The decision could not be made durable. The caller must not treat
    /// the gated action as decided.
    #[error("audit append failed: {0}")]
    Audit(#[from] dr_audit::AuditError),
}

pub type Result<T> = std::result::Result<T, PolicyError>;

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// Verdict of a policy gate. Deny is always the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny { reason: String },
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny {
            reason: reason.into(),
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Decision::Allow => None,
            Decision::Deny { reason } => Some(reason),
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyGuard
// ---------------------------------------------------------------------------

/// Synchronous decision point for commands, writes, egress, and budgets.
///
/// Command patterns are anchored regexes evaluated in order; the first
/// match allows and no match denies. Compiled patterns are cached per
/// profile name and version.
pub struct PolicyGuard {
    store: Arc<AuditStore>,
    safety_multiplier: f64,
    compiled: Mutex<HashMap<(String, u32), Arc<Vec<Option<Regex>>>>>,
}

impl PolicyGuard {
    pub fn new(store: Arc<AuditStore>, safety_multiplier: f64) -> Self {
        Self {
            store,
            safety_multiplier,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    // -----------------------------------------------------------------------
    // Command gate
    // -----------------------------------------------------------------------

    /// Authorize an argv vector against the profile's allow-patterns.
    ///
    /// The joined command string is only the matching surface; the vector
    /// itself is what was authorized and what the sandbox executes.
    pub fn check_command(
        &self,
        profile: &PolicyProfile,
        task_id: &str,
        argv: &[String],
    ) -> Result<Decision> {
        let decision = if argv.is_empty() {
            Decision::deny("empty command")
        } else {
            let joined = argv.join(" ");
            let patterns = self.compiled_patterns(profile);
            let matched = patterns.iter().enumerate().find_map(|(idx, re)| {
                re.as_ref()
                    .filter(|re| re.is_match(&joined))
                    .map(|_| idx)
            });
            match matched {
                Some(idx) => {
                    debug!(task_id, pattern = %profile.command_allow[idx], "command allowed");
                    Decision::Allow
                }
                None => Decision::deny(format!("no allow-pattern matches `{joined}`")),
            }
        };

        self.record(
            profile,
            task_id,
            "command",
            serde_json::json!({ "argv": argv }),
            &decision,
        )?;
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Write gate
    // -----------------------------------------------------------------------

    /// All paths must fall under one of the profile's write-scope prefixes
    /// after symlink resolution; a single stray path denies the whole set.
    pub fn check_write(
        &self,
        profile: &PolicyProfile,
        task_id: &str,
        paths: &[PathBuf],
    ) -> Result<Decision> {
        let mut outside = Vec::new();
        for path in paths {
            let resolved = resolve_lexically_existing(path);
            let in_scope = profile.write_scopes.iter().any(|scope| {
                let scope = resolve_lexically_existing(scope);
                resolved.starts_with(&scope)
            });
            if !in_scope {
                outside.push(resolved);
            }
        }

        let decision = if paths.is_empty() {
            Decision::deny("empty write set")
        } else if outside.is_empty() {
            Decision::Allow
        } else {
            Decision::deny(format!(
                "paths outside write scope: {}",
                outside
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        };

        self.record(
            profile,
            task_id,
            "write",
            serde_json::json!({
                "paths": paths,
                "outside": outside,
            }),
            &decision,
        )?;
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Egress gate
    // -----------------------------------------------------------------------

    /// Host must match an allow entry exactly, or be a subdomain of a
    /// `*.suffix` glob.
    pub fn check_egress(
        &self,
        profile: &PolicyProfile,
        task_id: &str,
        host: &str,
    ) -> Result<Decision> {
        let allowed = profile.egress_allow.iter().any(|pattern| {
            if let Some(suffix) = pattern.strip_prefix("*.") {
                host.ends_with(&format!(".{suffix}")) || host == suffix
            } else {
                host == pattern
            }
        });
        let decision = if allowed {
            Decision::Allow
        } else {
            Decision::deny(format!("egress to `{host}` not allowed"))
        };

        self.record(
            profile,
            task_id,
            "egress",
            serde_json::json!({ "host": host }),
            &decision,
        )?;
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Budget gate
    // -----------------------------------------------------------------------

    /// Deny when the projected call would push any budget dimension past
    /// its ceiling. The projection carries the adapter's own estimate; the
    /// configured safety multiplier is applied here. `consumes_iteration`
    /// is set by the caller for calls that open a coding iteration; other
    /// phases do not count against `max_iterations`.
    pub fn check_budget(
        &self,
        profile: &PolicyProfile,
        task: &Task,
        estimate: CostEstimate,
        consumes_iteration: bool,
    ) -> Result<Decision> {
        let projected = estimate.cost_usd * self.safety_multiplier;

        let decision = if projected > profile.per_call_cost_ceiling {
            Decision::deny(format!(
                "projected call cost ${projected:.4} exceeds per-call ceiling ${:.4}",
                profile.per_call_cost_ceiling
            ))
        } else if task.spent.cost_usd + projected > task.budgets.cost_usd {
            Decision::deny(format!(
                "projected cost ${:.4} exceeds budget ${:.4}",
                task.spent.cost_usd + projected,
                task.budgets.cost_usd
            ))
        } else if consumes_iteration && task.spent.iterations + 1 > task.budgets.max_iterations {
            Decision::deny(format!(
                "iteration {} exceeds budget {}",
                task.spent.iterations + 1,
                task.budgets.max_iterations
            ))
        } else {
            let elapsed = task.elapsed_secs(Utc::now());
            if elapsed + estimate.wall_time_secs > task.budgets.wall_time_secs {
                Decision::deny(format!(
                    "projected wall time {}s exceeds budget {}s",
                    elapsed + estimate.wall_time_secs,
                    task.budgets.wall_time_secs
                ))
            } else {
                Decision::Allow
            }
        };

        self.record(
            profile,
            &task.id,
            "budget",
            serde_json::json!({
                "projected_usd": projected,
                "estimate_wall_secs": estimate.wall_time_secs,
                "spent_usd": task.spent.cost_usd,
                "spent_iterations": task.spent.iterations,
            }),
            &decision,
        )?;
        Ok(decision)
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Append the decision to the audit log. The verdict is not returned to
    /// the caller until this has succeeded.
    fn record(
        &self,
        profile: &PolicyProfile,
        task_id: &str,
        gate: &str,
        detail: serde_json::Value,
        decision: &Decision,
    ) -> Result<()> {
        let entry = AuditEntry::new(task_id, AuditKind::PolicyDecision).with_payload(
            serde_json::json!({
                "gate": gate,
                "profile": profile.name,
                "profile_version": profile.version,
                "allow": decision.is_allow(),
                "reason": decision.reason(),
                "detail": detail,
            }),
        );
        self.store.append(entry)?;
        Ok(())
    }

    fn compiled_patterns(&self, profile: &PolicyProfile) -> Arc<Vec<Option<Regex>>> {
        let key = (profile.name.clone(), profile.version);
        let mut cache = self.compiled.lock().expect("pattern cache poisoned");
        cache
            .entry(key)
            .or_insert_with(|| {
                Arc::new(
                    profile
                        .command_allow
                        .iter()
                        .map(|p| match Regex::new(&format!("^(?:{p})$")) {
                            Ok(re) => Some(re),
                            Err(e) => {
                                // A malformed pattern never matches.
                                warn!(profile = %profile.name, pattern = %p, error = %e, "unparseable allow-pattern");
                                None
                            }
                        })
                        .collect(),
                )
            })
            .clone()
    }
}

/// Resolve symlinks for the longest existing ancestor, then re-append the
/// non-existing remainder lexically. Paths that do not exist yet still get
/// a stable absolute form this way.
fn resolve_lexically_existing(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut remainder: Vec<std::ffi::OsString> = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                remainder.push(name.to_os_string());
                existing = parent.to_path_buf();
            }
            _ => return path.to_path_buf(),
        }
    }
    let mut resolved = existing.canonicalize().unwrap_or(existing);
    for part in remainder.iter().rev() {
        resolved.push(part);
    }
    resolved
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use dr_core::events::AuditKind;
    use dr_core::types::{
        Budgets, RepoRef, SandboxTier, Spent, TaskMode, TaskStatus,
    };

    fn guard() -> (tempfile::TempDir, Arc<AuditStore>, PolicyGuard) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::open(tmp.path()).unwrap());
        let guard = PolicyGuard::new(store.clone(), 1.2);
        (tmp, store, guard)
    }

    fn profile(tmp: &Path) -> PolicyProfile {
        PolicyProfile {
            name: "test".into(),
            version: 1,
            command_allow: vec!["git (status|diff)".into(), "cargo test.*".into()],
            write_scopes: vec![tmp.to_path_buf()],
            egress_allow: vec!["api.example.com".into(), "*.internal.example.com".into()],
            per_call_cost_ceiling: 1.0,
            per_task_cost_ceiling: 25.0,
            sandbox_tier: SandboxTier::Medium,
        }
    }

    fn task(budgets: Budgets, spent: Spent) -> Task {
        Task {
            id: "t1".into(),
            goal: "fix".into(),
            repo: RepoRef {
                url: "https://example.com/r.git".into(),
                branch: "main".into(),
                commit_sha: "abc".into(),
            },
            mode: TaskMode::Bugfix,
            acceptance: vec![],
            profile: "test".into(),
            profile_version: 1,
            budgets,
            spent,
            deploy: false,
            priority: 0,
            status: TaskStatus::Running,
            created_at: Utc::now(),
            terminal_at: None,
            terminal_reason: None,
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn first_matching_pattern_allows() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        let decision = guard
            .check_command(&profile, "t1", &argv(&["git", "status"]))
            .unwrap();
        assert!(decision.is_allow());
    }

    #[test]
    fn unmatched_command_denies() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        let decision = guard
            .check_command(&profile, "t1", &argv(&["rm", "-rf", "/tmp/x"]))
            .unwrap();
        assert!(!decision.is_allow());
        assert!(decision.reason().unwrap().contains("no allow-pattern"));
    }

    #[test]
    fn patterns_are_anchored() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        // "git status" embedded in a longer command must not match.
        let decision = guard
            .check_command(&profile, "t1", &argv(&["sh", "-c", "git status"]))
            .unwrap();
        assert!(!decision.is_allow());
    }

    #[test]
    fn empty_argv_denies() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        let decision = guard.check_command(&profile, "t1", &[]).unwrap();
        assert!(!decision.is_allow());
    }

    #[test]
    fn empty_allow_list_denies_everything() {
        let (tmp, _store, guard) = guard();
        let mut profile = profile(tmp.path());
        profile.command_allow.clear();
        let decision = guard
            .check_command(&profile, "t1", &argv(&["git", "status"]))
            .unwrap();
        assert!(!decision.is_allow());
    }

    #[test]
    fn every_decision_is_audited_first() {
        let (tmp, store, guard) = guard();
        let profile = profile(tmp.path());
        guard
            .check_command(&profile, "t1", &argv(&["git", "status"]))
            .unwrap();
        guard
            .check_command(&profile, "t1", &argv(&["curl", "evil"]))
            .unwrap();

        let entries = store.scan("t1", 0).unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries
            .iter()
            .all(|e| e.kind == AuditKind::PolicyDecision));
        assert_eq!(entries[0].payload["allow"], serde_json::json!(true));
        assert_eq!(entries[1].payload["allow"], serde_json::json!(false));
    }

    #[test]
    fn write_scope_denies_on_single_stray_path() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        let inside = tmp.path().join("src/lib.rs");
        let decision = guard
            .check_write(&profile, "t1", &[inside.clone()])
            .unwrap();
        assert!(decision.is_allow());

        let decision = guard
            .check_write(&profile, "t1", &[inside, PathBuf::from("/etc/passwd")])
            .unwrap();
        assert!(!decision.is_allow());
        assert!(decision.reason().unwrap().contains("/etc/passwd"));
    }

    #[cfg(unix)]
    #[test]
    fn write_scope_resolves_symlinks() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());

        let outside = tempfile::tempdir().unwrap();
        let link = tmp.path().join("escape");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        // The path is lexically inside the scope but resolves outside it.
        let decision = guard
            .check_write(&profile, "t1", &[link.join("evil.txt")])
            .unwrap();
        assert!(!decision.is_allow());
    }

    #[test]
    fn egress_exact_and_suffix_glob() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        assert!(guard
            .check_egress(&profile, "t1", "api.example.com")
            .unwrap()
            .is_allow());
        assert!(guard
            .check_egress(&profile, "t1", "db.internal.example.com")
            .unwrap()
            .is_allow());
        assert!(!guard
            .check_egress(&profile, "t1", "evil.example.com")
            .unwrap()
            .is_allow());
        assert!(!guard
            .check_egress(&profile, "t1", "notinternal.example.com")
            .unwrap()
            .is_allow());
    }

    #[test]
    fn budget_denies_over_cost() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        let task = task(
            Budgets {
                max_iterations: 10,
                cost_usd: 0.01,
                wall_time_secs: 600,
            },
            Spent::default(),
        );
        // 0.02 * 1.2 > 0.01
        let decision = guard
            .check_budget(
                &profile,
                &task,
                CostEstimate {
                    cost_usd: 0.02,
                    wall_time_secs: 1,
                },
                false,
            )
            .unwrap();
        assert!(!decision.is_allow());
        assert!(decision.reason().unwrap().contains("budget"));
    }

    #[test]
    fn budget_denies_when_iterations_exhausted() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        let task = task(
            Budgets {
                max_iterations: 0,
                cost_usd: 10.0,
                wall_time_secs: 600,
            },
            Spent::default(),
        );
        let decision = guard
            .check_budget(
                &profile,
                &task,
                CostEstimate {
                    cost_usd: 0.001,
                    wall_time_secs: 1,
                },
                true,
            )
            .unwrap();
        assert!(!decision.is_allow());
        assert!(decision.reason().unwrap().contains("iteration"));
    }

    #[test]
    fn budget_allows_within_all_dimensions() {
        let (tmp, _store, guard) = guard();
        let profile = profile(tmp.path());
        let task = task(
            Budgets {
                max_iterations: 3,
                cost_usd: 0.50,
                wall_time_secs: 600,
            },
            Spent {
                iterations: 1,
                cost_usd: 0.10,
                wall_time_secs: 5,
            },
        );
        let decision = guard
            .check_budget(
                &profile,
                &task,
                CostEstimate {
                    cost_usd: 0.05,
                    wall_time_secs: 30,
                },
                true,
            )
            .unwrap();
        assert!(decision.is_allow());
    }

    #[test]
    fn per_call_ceiling_applies_before_task_budget() {
        let (tmp, _store, guard) = guard();
        let mut profile = profile(tmp.path());
        profile.per_call_cost_ceiling = 0.01;
        let task = task(
            Budgets {
                max_iterations: 3,
                cost_usd: 100.0,
                wall_time_secs: 600,
            },
            Spent::default(),
        );
        let decision = guard
            .check_budget(
                &profile,
                &task,
                CostEstimate {
                    cost_usd: 0.05,
                    wall_time_secs: 1,
                },
                false,
            )
            .unwrap();
        assert!(!decision.is_allow());
        assert!(decision.reason().unwrap().contains("per-call"));
    }
}

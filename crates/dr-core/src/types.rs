use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// TaskStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Suspended,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses are never left again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns `true` when a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: &TaskStatus) -> bool {
        matches!(
            (self, target),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Pending, TaskStatus::Cancelled)
                | (TaskStatus::Pending, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Suspended)
                | (TaskStatus::Running, TaskStatus::Succeeded)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Running, TaskStatus::Cancelled)
                | (TaskStatus::Suspended, TaskStatus::Running)
                | (TaskStatus::Suspended, TaskStatus::Failed)
                | (TaskStatus::Suspended, TaskStatus::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Suspended => "suspended",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskState
// ---------------------------------------------------------------------------

/// Fine-grained driver state, one per lifecycle stage. `TaskStatus` is the
/// coarse view exposed through the API; this is what the state machine
/// walks and what audit transitions record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Planning,
    Coding,
    Testing,
    Reviewing,
    CommitPending,
    Deploying,
    Succeeded,
    Failed,
    Cancelled,
    Suspended,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Coarse status visible through the API.
    pub fn status(&self) -> TaskStatus {
        match self {
            TaskState::Pending => TaskStatus::Pending,
            TaskState::Succeeded => TaskStatus::Succeeded,
            TaskState::Failed => TaskStatus::Failed,
            TaskState::Cancelled => TaskStatus::Cancelled,
            TaskState::Suspended => TaskStatus::Suspended,
            _ => TaskStatus::Running,
        }
    }

    /// The phase an adapter drives while the task sits in this state, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            TaskState::Planning => Some(Phase::Plan),
            TaskState::Coding => Some(Phase::Code),
            TaskState::Testing => Some(Phase::Test),
            TaskState::Reviewing => Some(Phase::Review),
            TaskState::CommitPending => Some(Phase::Commit),
            TaskState::Deploying => Some(Phase::Deploy),
            _ => None,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TaskState::Pending => "pending",
            TaskState::Planning => "planning",
            TaskState::Coding => "coding",
            TaskState::Testing => "testing",
            TaskState::Reviewing => "reviewing",
            TaskState::CommitPending => "commit_pending",
            TaskState::Deploying => "deploying",
            TaskState::Succeeded => "succeeded",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Suspended => "suspended",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskMode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskMode {
    Refactor,
    NewFeature,
    Bugfix,
    AppGeneration,
}

// ---------------------------------------------------------------------------
// Phase
// ---------------------------------------------------------------------------

/// One stage of the task lifecycle, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Plan,
    Code,
    Test,
    Review,
    Commit,
    Deploy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Plan => "plan",
            Phase::Code => "code",
            Phase::Test => "test",
            Phase::Review => "review",
            Phase::Commit => "commit",
            Phase::Deploy => "deploy",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// Budgets / Spent
// ---------------------------------------------------------------------------

/// Hard resource ceilings bound to a task at submission.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Budgets {
    pub max_iterations: u32,
    pub cost_usd: f64,
    pub wall_time_secs: u64,
}

/// Resources consumed so far. Invariant: `spent.* <= budgets.*` at every
/// observable moment.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Spent {
    pub iterations: u32,
    pub cost_usd: f64,
    pub wall_time_secs: u64,
}

// ---------------------------------------------------------------------------
// RepoRef
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoRef {
    pub url: String,
    pub branch: String,
    /// The commit the task is bound to, resolved at acceptance.
    pub commit_sha: String,
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub goal: String,
    pub repo: RepoRef,
    pub mode: TaskMode,
    /// Ordered predicate names resolved against the predicate registry.
    pub acceptance: Vec<String>,
    pub profile: String,
    /// Version of the policy profile in force at submission.
    pub profile_version: u32,
    pub budgets: Budgets,
    pub spent: Spent,
    pub deploy: bool,
    pub priority: i32,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
    /// Machine-readable reason recorded with the terminal transition.
    pub terminal_reason: Option<FailureReason>,
}

impl Task {
    pub fn remaining_cost_usd(&self) -> f64 {
        (self.budgets.cost_usd - self.spent.cost_usd).max(0.0)
    }

    pub fn remaining_iterations(&self) -> u32 {
        self.budgets.max_iterations.saturating_sub(self.spent.iterations)
    }

    pub fn elapsed_secs(&self, now: DateTime<Utc>) -> u64 {
        (now - self.created_at).num_seconds().max(0) as u64
    }
}

/// Machine-readable terminal reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExceeded,
    IterationBudgetExhausted,
    PolicyBlocked,
    AdapterPermanent,
    WallTimeExceeded,
    Cancelled,
    Internal,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FailureReason::BudgetExceeded => "budget_exceeded",
            FailureReason::IterationBudgetExhausted => "iteration_budget_exhausted",
            FailureReason::PolicyBlocked => "policy_blocked",
            FailureReason::AdapterPermanent => "adapter_permanent",
            FailureReason::WallTimeExceeded => "wall_time_exceeded",
            FailureReason::Cancelled => "cancelled",
            FailureReason::Internal => "internal",
        };
        write!(f, "{}", label)
    }
}

// ---------------------------------------------------------------------------
// TaskSpec — the submission object
// ---------------------------------------------------------------------------

/// What a caller hands to `Scheduler::submit`. Optional fields are resolved
/// during admission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    #[serde(default)]
    pub id: Option<String>,
    pub goal: String,
    pub repo_url: String,
    pub branch: String,
    #[serde(default)]
    pub commit_sha: Option<String>,
    pub mode: TaskMode,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub policy_profile: String,
    pub budgets: Budgets,
    #[serde(default)]
    pub deploy: bool,
    #[serde(default)]
    pub priority: i32,
}

// ---------------------------------------------------------------------------
// PhaseRun
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseRunOutcome {
    Ok,
    Retryable,
    Fatal,
    BudgetExceeded,
    PolicyBlocked,
    Timeout,
}

/// Content-addressed reference to an exported artifact blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub sha256: String,
    pub len: u64,
}

/// One attempt of one phase for one task. Written once when the attempt
/// ends; `(task_id, phase, attempt)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseRun {
    pub id: Uuid,
    pub task_id: String,
    pub phase: Phase,
    pub attempt: u32,
    pub adapter_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub outcome: PhaseRunOutcome,
    pub artifacts: BTreeMap<String, BlobRef>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
}

impl PhaseRun {
    pub fn begin(task_id: impl Into<String>, phase: Phase, attempt: u32, adapter_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            phase,
            attempt,
            adapter_id: adapter_id.into(),
            started_at: Utc::now(),
            ended_at: None,
            outcome: PhaseRunOutcome::Retryable,
            artifacts: BTreeMap::new(),
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// PatchSet
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEdit {
    pub path: PathBuf,
    pub change_type: ChangeType,
    pub diff: Vec<u8>,
}

/// An ordered set of file edits computed against `precondition_sha`.
/// Applied only when that sha still matches the workspace head and every
/// touched path passes the profile's write-scope gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSet {
    pub id: Uuid,
    pub phase_run_id: Uuid,
    pub precondition_sha: String,
    pub edits: Vec<FileEdit>,
}

impl PatchSet {
    pub fn new(phase_run_id: Uuid, precondition_sha: impl Into<String>, edits: Vec<FileEdit>) -> Self {
        Self {
            id: Uuid::new_v4(),
            phase_run_id,
            precondition_sha: precondition_sha.into(),
            edits,
        }
    }

    /// Every path this patch touches, deduplicated.
    pub fn touched_paths(&self) -> BTreeSet<PathBuf> {
        self.edits.iter().map(|e| e.path.clone()).collect()
    }
}

// ---------------------------------------------------------------------------
// PolicyProfile
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxTier {
    Low,
    Medium,
    High,
}

/// Named capability set bound to a task at submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyProfile {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    /// Ordered anchored regexes; the first match allows, no match denies.
    #[serde(default)]
    pub command_allow: Vec<String>,
    /// Prefix set for file writes.
    #[serde(default)]
    pub write_scopes: Vec<PathBuf>,
    /// Exact hosts or `*.suffix` globs.
    #[serde(default)]
    pub egress_allow: Vec<String>,
    #[serde(default = "default_call_ceiling")]
    pub per_call_cost_ceiling: f64,
    #[serde(default = "default_task_ceiling")]
    pub per_task_cost_ceiling: f64,
    #[serde(default = "default_tier")]
    pub sandbox_tier: SandboxTier,
}

fn default_version() -> u32 {
    1
}

fn default_call_ceiling() -> f64 {
    1.0
}

fn default_task_ceiling() -> f64 {
    25.0
}

fn default_tier() -> SandboxTier {
    SandboxTier::Medium
}

// ---------------------------------------------------------------------------
// AdapterDescriptor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterCapability {
    Plan,
    Propose,
    Refine,
    ApplyPatch,
    RunTests,
    SummarizeDiff,
    Embed,
    CommitMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionModel {
    CliPty,
    HttpApi,
    InProcess,
}

/// Rate card used to project a call's cost before it is made.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    #[serde(default)]
    pub usd_per_1k_in: f64,
    #[serde(default)]
    pub usd_per_1k_out: f64,
    #[serde(default)]
    pub flat_usd_per_call: f64,
    #[serde(default = "default_est_wall")]
    pub est_wall_time_secs: u64,
}

fn default_est_wall() -> u64 {
    60
}

impl CostModel {
    /// Project the cost of a call given token estimates.
    pub fn project(&self, tokens_in: u64, tokens_out: u64) -> f64 {
        self.flat_usd_per_call
            + (tokens_in as f64 / 1000.0) * self.usd_per_1k_in
            + (tokens_out as f64 / 1000.0) * self.usd_per_1k_out
    }
}

/// Registration record for an agent adapter. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub id: String,
    pub capabilities: BTreeSet<AdapterCapability>,
    pub execution: ExecutionModel,
    pub default_profile: String,
    pub cost_model: CostModel,
    #[serde(default = "default_version")]
    pub version: u32,
    /// For `cli_pty` adapters: the agent binary (defaults to the id).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<String>,
    /// For `cli_pty` adapters: arguments placed before the phase flag.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// For `http_api` adapters: the endpoint URL.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// A projected cost for one adapter call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub cost_usd: f64,
    pub wall_time_secs: u64,
}

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// One row of the static routing table: which adapter drives `phase` for
/// tasks in `mode`, with an ordered fallback chain consulted when the
/// primary lacks a required capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRule {
    pub mode: TaskMode,
    pub phase: Phase,
    pub adapter: String,
    #[serde(default)]
    pub fallback: Vec<String>,
}

// ---------------------------------------------------------------------------
// TaskContext — read-only bundle handed to adapters
// ---------------------------------------------------------------------------

/// What an adapter is allowed to know about the task it is working on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskContext {
    pub task_id: String,
    pub workspace_root: PathBuf,
    pub commit_sha: String,
    pub goal: String,
    pub acceptance_summary: String,
    pub profile: String,
    pub remaining_cost_usd: f64,
    pub remaining_iterations: u32,
    pub remaining_wall_secs: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses_have_no_exits() {
        for terminal in [TaskStatus::Succeeded, TaskStatus::Failed, TaskStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for target in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Suspended,
                TaskStatus::Succeeded,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(
                    !terminal.can_transition_to(&target),
                    "{terminal} -> {target} must be invalid"
                );
            }
        }
    }

    #[test]
    fn suspended_can_resume_or_terminate() {
        assert!(TaskStatus::Suspended.can_transition_to(&TaskStatus::Running));
        assert!(TaskStatus::Suspended.can_transition_to(&TaskStatus::Failed));
        assert!(TaskStatus::Suspended.can_transition_to(&TaskStatus::Cancelled));
        assert!(!TaskStatus::Suspended.can_transition_to(&TaskStatus::Succeeded));
    }

    #[test]
    fn cost_model_projection() {
        let model = CostModel {
            usd_per_1k_in: 0.003,
            usd_per_1k_out: 0.015,
            flat_usd_per_call: 0.01,
            est_wall_time_secs: 30,
        };
        let projected = model.project(2000, 1000);
        assert!((projected - (0.01 + 0.006 + 0.015)).abs() < 1e-9);
    }

    #[test]
    fn patchset_touched_paths_deduplicates() {
        let edits = vec![
            FileEdit {
                path: PathBuf::from("src/lib.rs"),
                change_type: ChangeType::Modified,
                diff: b"--- a\n+++ b\n".to_vec(),
            },
            FileEdit {
                path: PathBuf::from("src/lib.rs"),
                change_type: ChangeType::Modified,
                diff: b"--- a\n+++ b\n".to_vec(),
            },
            FileEdit {
                path: PathBuf::from("src/main.rs"),
                change_type: ChangeType::Created,
                diff: Vec::new(),
            },
        ];
        let patch = PatchSet::new(Uuid::new_v4(), "abc123", edits);
        assert_eq!(patch.touched_paths().len(), 2);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&TaskStatus::Succeeded).unwrap();
        assert_eq!(json, "\"succeeded\"");
        let mode = serde_json::to_string(&TaskMode::AppGeneration).unwrap();
        assert_eq!(mode, "\"app_generation\"");
    }

    #[test]
    fn remaining_budget_saturates_at_zero() {
        let task = Task {
            id: "t1".into(),
            goal: "g".into(),
            repo: RepoRef {
                url: "https://example.com/r.git".into(),
                branch: "main".into(),
                commit_sha: "deadbeef".into(),
            },
            mode: TaskMode::Bugfix,
            acceptance: vec![],
            profile: "default".into(),
            profile_version: 1,
            budgets: Budgets {
                max_iterations: 2,
                cost_usd: 1.0,
                wall_time_secs: 60,
            },
            spent: Spent {
                iterations: 3,
                cost_usd: 1.5,
                wall_time_secs: 10,
            },
            deploy: false,
            priority: 0,
            status: TaskStatus::Running,
            created_at: Utc::now(),
            terminal_at: None,
            terminal_reason: None,
        };
        assert_eq!(task.remaining_iterations(), 0);
        assert_eq!(task.remaining_cost_usd(), 0.0);
    }
}

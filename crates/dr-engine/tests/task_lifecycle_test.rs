//! End-to-end lifecycle tests: scripted adapters and fixed predicates
//! drive real tasks through the full state machine.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use dr_adapters::mock::ScriptedAdapter;
use dr_adapters::{
    AdapterError, AdapterRegistry, AgentAdapter, OutcomePayload, PhaseOutcome, ReviewReport,
};
use dr_audit::AuditStore;
use dr_core::config::Config;
use dr_core::events::{AuditKind, MetaKind, MetaRecord, StreamKind};
use dr_core::types::{
    AdapterCapability, AdapterDescriptor, Budgets, ChangeType, CostEstimate, CostModel,
    ExecutionModel, FailureReason, FileEdit, PatchSet, Phase, PhaseRun, PolicyProfile, SandboxTier,
    TaskContext, TaskMode, TaskSpec, TaskState, TaskStatus,
};
use dr_core::workspace::{GitOutput, GitRunner, WorkspaceManager};
use dr_engine::driver::EngineDeps;
use dr_engine::predicate::{AcceptancePredicate, FixedPredicate, PredicateRegistry};
use dr_engine::Scheduler;
use dr_overlay::{OverlayBroker, SubscribeFrom};
use dr_policy::PolicyGuard;
use dr_sandbox::launcher::{LaunchedProcess, PtyLauncher};
use dr_sandbox::SandboxRunner;

const BOUND_SHA: &str = "abc123";

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

/// Git runner that answers `rev-parse` with the bound sha and succeeds at
/// everything else.
struct MockGit;

impl GitRunner for MockGit {
    fn run_git(&self, _dir: &Path, args: &[&str]) -> Result<GitOutput, String> {
        if args.first() == Some(&"rev-parse") {
            Ok(GitOutput::ok(format!("{BOUND_SHA}\n")))
        } else {
            Ok(GitOutput::ok(""))
        }
    }
}

/// These tests never spawn real processes.
struct NullLauncher;

impl PtyLauncher for NullLauncher {
    fn launch(
        &self,
        _cwd: &Path,
        _argv: &[String],
        _env: &[(String, String)],
    ) -> Result<LaunchedProcess, String> {
        Err("no processes in lifecycle tests".into())
    }
}

/// Adapter that never returns until cancelled.
struct HangingAdapter {
    descriptor: AdapterDescriptor,
}

impl HangingAdapter {
    fn new() -> Self {
        Self {
            descriptor: AdapterDescriptor {
                id: "hanging".into(),
                capabilities: ScriptedAdapter::full("x").descriptor().capabilities.clone(),
                execution: ExecutionModel::InProcess,
                default_profile: "dev".into(),
                cost_model: CostModel {
                    usd_per_1k_in: 0.0,
                    usd_per_1k_out: 0.0,
                    flat_usd_per_call: 0.001,
                    est_wall_time_secs: 1,
                },
                version: 1,
                binary: None,
                args: vec![],
                endpoint: None,
            },
        }
    }
}

#[async_trait]
impl AgentAdapter for HangingAdapter {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    fn estimate_cost(&self, _phase: Phase, _digest: &str) -> CostEstimate {
        CostEstimate {
            cost_usd: 0.001,
            wall_time_secs: 1,
        }
    }

    async fn propose(
        &self,
        _phase: Phase,
        _ctx: &TaskContext,
        _prior_feedback: Option<&str>,
    ) -> Result<PhaseOutcome, AdapterError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(AdapterError::Transient("unreachable".into()))
    }
}

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    _tmp: tempfile::TempDir,
    deps: EngineDeps,
    scheduler: Scheduler,
}

fn fast_config(tmp: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.engine.max_concurrent = 2;
    cfg.engine.workspace_root = tmp.join("work");
    cfg.engine.retention_grace_secs = 3600;
    cfg.engine.plan_max_attempts = 2;
    cfg.engine.phase_timeout_secs = 30;
    cfg.engine.retry_base_ms = 1;
    cfg.engine.retry_cap_ms = 5;
    cfg.engine.retry_max_attempts = 2;
    cfg.engine.cancel_grace_secs = 1;
    cfg.audit.dir = tmp.join("audit");
    cfg.profiles = vec![PolicyProfile {
        name: "dev".into(),
        version: 1,
        command_allow: vec![".*".into()],
        write_scopes: vec![tmp.to_path_buf()],
        egress_allow: vec![],
        per_call_cost_ceiling: 1.0,
        per_task_cost_ceiling: 25.0,
        sandbox_tier: SandboxTier::Low,
    }];
    cfg
}

fn fixture_with(
    adapter: Arc<dyn AgentAdapter>,
    predicates: Vec<Arc<dyn AcceptancePredicate>>,
    tune: impl FnOnce(&mut Config),
) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = fast_config(tmp.path());
    tune(&mut cfg);
    let cfg = Arc::new(cfg);

    let store = Arc::new(AuditStore::open(&cfg.audit.dir).unwrap());
    let broker = Arc::new(OverlayBroker::new(Arc::clone(&store), cfg.overlay.clone()));
    let guard = Arc::new(PolicyGuard::new(
        Arc::clone(&store),
        cfg.budget.safety_multiplier,
    ));
    let workspaces = Arc::new(WorkspaceManager::with_git_runner(
        &cfg.engine.workspace_root,
        cfg.engine.retention_grace_secs,
        Box::new(MockGit),
    ));
    let sandbox = Arc::new(SandboxRunner::new(
        Arc::new(NullLauncher),
        Arc::clone(&broker),
        Arc::clone(&guard),
        cfg.sandbox.clone(),
        cfg.overlay.clone(),
    ));

    let mut registry = AdapterRegistry::new(vec![]);
    registry.register(adapter).unwrap();

    let mut predicate_registry = PredicateRegistry::new();
    for predicate in predicates {
        predicate_registry.register(predicate).unwrap();
    }

    let deps = EngineDeps {
        store,
        broker,
        guard,
        workspaces,
        sandbox,
        registry: Arc::new(registry),
        predicates: Arc::new(predicate_registry),
        config: cfg,
    };
    let scheduler = Scheduler::new(deps.clone());
    Fixture {
        _tmp: tmp,
        deps,
        scheduler,
    }
}

fn spec(budgets: Budgets, acceptance: &[&str]) -> TaskSpec {
    TaskSpec {
        id: None,
        goal: "fix off-by-one in paginate".into(),
        repo_url: "https://example.com/repo.git".into(),
        branch: "main".into(),
        commit_sha: Some(BOUND_SHA.into()),
        mode: TaskMode::Bugfix,
        acceptance_criteria: acceptance.iter().map(|s| s.to_string()).collect(),
        policy_profile: "dev".into(),
        budgets,
        deploy: false,
        priority: 0,
    }
}

fn budgets() -> Budgets {
    Budgets {
        max_iterations: 3,
        cost_usd: 0.50,
        wall_time_secs: 300,
    }
}

/// The full capability set minus one.
fn caps_without(excluded: AdapterCapability) -> Vec<AdapterCapability> {
    [
        AdapterCapability::Plan,
        AdapterCapability::Propose,
        AdapterCapability::Refine,
        AdapterCapability::ApplyPatch,
        AdapterCapability::RunTests,
        AdapterCapability::SummarizeDiff,
        AdapterCapability::CommitMessage,
    ]
    .into_iter()
    .filter(|c| *c != excluded)
    .collect()
}

// -- scripted outcomes --

fn plan_ok() -> PhaseOutcome {
    PhaseOutcome::ok(OutcomePayload::Plan("1. find the bound\n2. fix it".into()))
        .with_cost(0.01, 900, 120)
}

fn code_ok() -> PhaseOutcome {
    PhaseOutcome::ok(OutcomePayload::Patch(PatchSet::new(
        Uuid::new_v4(),
        BOUND_SHA,
        vec![FileEdit {
            path: "src/paginate.rs".into(),
            change_type: ChangeType::Modified,
            diff: b"--- a/src/paginate.rs\n+++ b/src/paginate.rs\n".to_vec(),
        }],
    )))
    .with_cost(0.02, 2_000, 600)
}

fn review(approved: bool) -> PhaseOutcome {
    PhaseOutcome::ok(OutcomePayload::ReviewReport(ReviewReport {
        approved,
        summary: if approved {
            "bound fixed, tests cover the edge".into()
        } else {
            "loop bound still wrong for the empty page".into()
        },
    }))
    .with_cost(0.01, 1_200, 200)
}

fn commit_ok() -> PhaseOutcome {
    PhaseOutcome::ok(OutcomePayload::CommitMessage(
        "fix off-by-one in paginate".into(),
    ))
    .with_cost(0.005, 400, 60)
}

fn deploy_ok() -> PhaseOutcome {
    PhaseOutcome::ok(OutcomePayload::DeployRecord("released build 42".into())).with_cost(0.005, 200, 40)
}

async fn wait_terminal(scheduler: &Scheduler, task_id: &str) -> dr_core::types::Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(task) = scheduler.status(task_id) {
            if task.status.is_terminal() {
                return task;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "task {task_id} never reached a terminal state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn transitions(fix: &Fixture, task_id: &str) -> Vec<TaskState> {
    fix.deps
        .store
        .scan(task_id, 0)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::Transition)
        .filter_map(|e| e.next_state)
        .collect()
}

fn phase_runs(fix: &Fixture, task_id: &str) -> Vec<PhaseRun> {
    fix.deps
        .store
        .scan(task_id, 0)
        .unwrap()
        .into_iter()
        .filter(|e| e.kind == AuditKind::PhaseRun)
        .filter_map(|e| serde_json::from_value(e.payload).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_bugfix_runs_every_phase_once() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter.clone(),
        vec![Arc::new(FixedPredicate::passing("unit_tests_pass"))],
        |_| {},
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &["unit_tests_pass"])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.spent.iterations, 1);
    assert!(task.terminal_at.is_some());

    assert_eq!(
        transitions(&fix, &task_id),
        vec![
            TaskState::Planning,
            TaskState::Coding,
            TaskState::Testing,
            TaskState::Reviewing,
            TaskState::CommitPending,
            TaskState::Succeeded,
        ]
    );

    // Exactly one PhaseRun per phase, all attempt 1.
    let runs = phase_runs(&fix, &task_id);
    assert_eq!(runs.len(), 5);
    assert!(runs.iter().all(|r| r.attempt == 1));
    let phases: Vec<Phase> = runs.iter().map(|r| r.phase).collect();
    assert_eq!(
        phases,
        vec![Phase::Plan, Phase::Code, Phase::Test, Phase::Review, Phase::Commit]
    );

    // The reviewer declares summarize_diff, so its approval summary
    // lands on the commit record.
    let commit_run = runs.iter().find(|r| r.phase == Phase::Commit).unwrap();
    assert!(commit_run.artifacts.contains_key("diff_summary"));
}

#[tokio::test]
async fn adapters_without_refine_get_feedback_via_propose() {
    let adapter = Arc::new(ScriptedAdapter::with_capabilities(
        "no-refine",
        &caps_without(AdapterCapability::Refine),
    ));
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter.clone(),
        vec![Arc::new(FixedPredicate::new(
            "unit_tests_pass",
            vec![false, true],
        ))],
        |_| {},
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &["unit_tests_pass"])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    // The retry never went through refine, but the feedback arrived.
    assert_eq!(adapter.refine_calls(), 0);
    let second_code = adapter
        .calls()
        .into_iter()
        .filter(|(p, _)| *p == Phase::Code)
        .nth(1)
        .unwrap();
    assert!(second_code.1.unwrap().contains("acceptance predicates failed"));
}

#[tokio::test]
async fn diff_summary_requires_the_summarize_capability() {
    let adapter = Arc::new(ScriptedAdapter::with_capabilities(
        "no-summaries",
        &caps_without(AdapterCapability::SummarizeDiff),
    ));
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter,
        vec![Arc::new(FixedPredicate::passing("unit_tests_pass"))],
        |_| {},
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &["unit_tests_pass"])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;
    assert_eq!(task.status, TaskStatus::Succeeded);

    let runs = phase_runs(&fix, &task_id);
    let review_run = runs.iter().find(|r| r.phase == Phase::Review).unwrap();
    let commit_run = runs.iter().find(|r| r.phase == Phase::Commit).unwrap();
    // The review itself is still recorded, but nothing feeds a diff
    // summary onto the commit record.
    assert!(review_run.artifacts.contains_key("review"));
    assert!(!commit_run.artifacts.contains_key("diff_summary"));
}

#[tokio::test]
async fn failing_predicate_triggers_refine_loop_then_success() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter.clone(),
        vec![Arc::new(FixedPredicate::new(
            "unit_tests_pass",
            vec![false, true],
        ))],
        |_| {},
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &["unit_tests_pass"])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.spent.iterations, 2);

    // The second coding round saw the test failure as refine feedback,
    // delivered through the refine entry point (the adapter declares it).
    let calls = adapter.calls();
    let code_calls: Vec<_> = calls.iter().filter(|(p, _)| *p == Phase::Code).collect();
    assert_eq!(code_calls.len(), 2);
    assert!(code_calls[0].1.is_none());
    assert!(code_calls[1]
        .1
        .as_ref()
        .unwrap()
        .contains("acceptance predicates failed"));
    assert!(adapter.refine_calls() >= 1);

    // Two TESTING attempts recorded.
    let test_runs: Vec<_> = phase_runs(&fix, &task_id)
        .into_iter()
        .filter(|r| r.phase == Phase::Test)
        .collect();
    assert_eq!(test_runs.len(), 2);
    assert_eq!(test_runs[0].attempt, 1);
    assert_eq!(test_runs[1].attempt, 2);
}

#[tokio::test]
async fn budget_exhaustion_fails_in_planning_without_any_phase_run() {
    let adapter = Arc::new(
        ScriptedAdapter::full("mock").with_estimate(CostEstimate {
            cost_usd: 0.02,
            wall_time_secs: 1,
        }),
    );

    let fix = fixture_with(adapter, vec![], |_| {});
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix
        .scheduler
        .submit(spec(
            Budgets {
                max_iterations: 10,
                cost_usd: 0.01,
                wall_time_secs: 600,
            },
            &[],
        ))
        .unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.terminal_reason, Some(FailureReason::BudgetExceeded));
    assert!(phase_runs(&fix, &task_id).is_empty());

    // The denial itself is on the audit trail.
    let denied = fix
        .deps
        .store
        .scan(&task_id, 0)
        .unwrap()
        .into_iter()
        .any(|e| {
            e.kind == AuditKind::PolicyDecision
                && e.payload["gate"] == "budget"
                && e.payload["allow"] == serde_json::json!(false)
        });
    assert!(denied);
}

#[tokio::test]
async fn zero_iteration_budget_fails_at_first_coding_entry() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());

    let fix = fixture_with(adapter, vec![], |_| {});
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix
        .scheduler
        .submit(spec(
            Budgets {
                max_iterations: 0,
                cost_usd: 1.0,
                wall_time_secs: 600,
            },
            &[],
        ))
        .unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(
        task.terminal_reason,
        Some(FailureReason::IterationBudgetExhausted)
    );
    // Planning ran; coding never did.
    let runs = phase_runs(&fix, &task_id);
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].phase, Phase::Plan);
}

#[tokio::test]
async fn cancellation_mid_phase_is_prompt_and_audited_last() {
    let fix = fixture_with(Arc::new(HangingAdapter::new()), vec![], |_| {});
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &[])).unwrap();

    // Let the task reach PLANNING with the adapter hanging.
    tokio::time::sleep(Duration::from_millis(100)).await;
    fix.scheduler.cancel(&task_id, "operator abort").unwrap();

    let task = wait_terminal(&fix.scheduler, &task_id).await;
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.terminal_reason, Some(FailureReason::Cancelled));

    // META(cancelled) is on the overlay; no commit records exist.
    let sub = fix
        .scheduler
        .stream_overlay(&task_id, SubscribeFrom::Seq(0))
        .unwrap();
    let kinds: Vec<MetaKind> = sub
        .drain()
        .iter()
        .filter(|e| e.stream == StreamKind::Meta)
        .filter_map(|e| MetaRecord::from_bytes(&e.payload))
        .map(|r| r.kind)
        .collect();
    assert!(kinds.contains(&MetaKind::Cancelled));
    assert!(phase_runs(&fix, &task_id)
        .iter()
        .all(|r| r.phase != Phase::Commit));

    // The CANCELLED transition is the last audit transition.
    assert_eq!(transitions(&fix, &task_id).last(), Some(&TaskState::Cancelled));

    // Cancelling again is a no-op.
    fix.scheduler.cancel(&task_id, "again").unwrap();
}

#[tokio::test]
async fn review_rejection_loops_back_to_coding() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(false));
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter.clone(),
        vec![Arc::new(FixedPredicate::passing("unit_tests_pass"))],
        |_| {},
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &["unit_tests_pass"])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.spent.iterations, 2);
    let rejected_feedback = adapter
        .calls()
        .into_iter()
        .filter(|(p, _)| *p == Phase::Code)
        .nth(1)
        .unwrap()
        .1
        .unwrap();
    assert!(rejected_feedback.contains("review rejected"));
}

#[tokio::test]
async fn adapter_permanent_failure_fails_the_task() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());
    // Script exhausted at CODING: permanent failure.

    let fix = fixture_with(adapter, vec![], |_| {});
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &[])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.terminal_reason, Some(FailureReason::AdapterPermanent));
}

#[tokio::test]
async fn transient_failures_retry_in_state() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());
    adapter.push(Err(AdapterError::Transient("network blip".into())));
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter,
        vec![Arc::new(FixedPredicate::passing("unit_tests_pass"))],
        |cfg| cfg.engine.retry_max_attempts = 3,
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &["unit_tests_pass"])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    // The failed attempt and the successful one are distinguishable runs.
    let code_runs: Vec<_> = phase_runs(&fix, &task_id)
        .into_iter()
        .filter(|r| r.phase == Phase::Code)
        .collect();
    assert_eq!(code_runs.len(), 2);
    assert_eq!(code_runs[0].attempt, 1);
    assert_eq!(code_runs[1].attempt, 2);
}

#[tokio::test]
async fn budget_suspension_resumes_after_topup() {
    let adapter = Arc::new(
        ScriptedAdapter::full("mock").with_estimate(CostEstimate {
            cost_usd: 0.02,
            wall_time_secs: 1,
        }),
    );
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter,
        vec![Arc::new(FixedPredicate::passing("unit_tests_pass"))],
        |cfg| cfg.engine.suspend_on_budget = true,
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix
        .scheduler
        .submit(spec(
            Budgets {
                max_iterations: 3,
                cost_usd: 0.01,
                wall_time_secs: 600,
            },
            &["unit_tests_pass"],
        ))
        .unwrap();

    // The first planning estimate trips the budget and parks the task.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if fix.scheduler.status(&task_id).unwrap().status == TaskStatus::Suspended {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "task never suspended");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    fix.scheduler
        .resume(
            &task_id,
            Budgets {
                max_iterations: 0,
                cost_usd: 1.0,
                wall_time_secs: 0,
            },
        )
        .unwrap();

    let task = wait_terminal(&fix.scheduler, &task_id).await;
    assert_eq!(task.status, TaskStatus::Succeeded);
}

#[tokio::test]
async fn deploy_flag_adds_a_deploying_phase() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());
    adapter.push_ok(deploy_ok());

    let fix = fixture_with(
        adapter,
        vec![Arc::new(FixedPredicate::passing("unit_tests_pass"))],
        |_| {},
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let mut spec = spec(budgets(), &["unit_tests_pass"]);
    spec.deploy = true;
    let task_id = fix.scheduler.submit(spec).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;

    assert_eq!(task.status, TaskStatus::Succeeded);
    let states = transitions(&fix, &task_id);
    assert!(states.contains(&TaskState::Deploying));
    assert_eq!(states.last(), Some(&TaskState::Succeeded));
}

#[tokio::test]
async fn terminal_states_are_final() {
    let adapter = Arc::new(ScriptedAdapter::full("mock"));
    adapter.push_ok(plan_ok());
    adapter.push_ok(code_ok());
    adapter.push_ok(review(true));
    adapter.push_ok(commit_ok());

    let fix = fixture_with(
        adapter,
        vec![Arc::new(FixedPredicate::passing("unit_tests_pass"))],
        |_| {},
    );
    let runner = fix.scheduler.clone();
    tokio::spawn(async move { runner.run().await });

    let task_id = fix.scheduler.submit(spec(budgets(), &["unit_tests_pass"])).unwrap();
    let task = wait_terminal(&fix.scheduler, &task_id).await;
    assert_eq!(task.status, TaskStatus::Succeeded);

    // Cancel after success changes nothing.
    fix.scheduler.cancel(&task_id, "too late").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let task = fix.scheduler.status(&task_id).unwrap();
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(transitions(&fix, &task_id).last(), Some(&TaskState::Succeeded));
}

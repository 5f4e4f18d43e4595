use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use dr_adapters::{
    AdapterError, AdapterRegistry, Classification, OutcomePayload, PhaseOutcome, context_digest,
};
use dr_audit::AuditStore;
use dr_core::config::Config;
use dr_core::events::{AuditEntry, AuditKind, MetaKind, MetaRecord};
use dr_core::types::{
    AdapterCapability, CostEstimate, FailureReason, PatchSet, Phase, PhaseRun, PhaseRunOutcome,
    PolicyProfile, Task, TaskContext, TaskState,
};
use dr_core::workspace::{Workspace, WorkspaceError, WorkspaceManager};
use dr_overlay::OverlayBroker;
use dr_policy::{Decision, PolicyGuard};
use dr_sandbox::{SandboxCtx, SandboxRunner};

use crate::cancel::CancelToken;
use crate::predicate::PredicateRegistry;

// ---------------------------------------------------------------------------
// TaskSlot
// ---------------------------------------------------------------------------

/// The scheduler-owned record for one task: the mutable Task fields behind
/// a lock, the cancel token, and the resume signal for SUSPENDED tasks.
/// Components never hold a long-lived Task reference; they go through the
/// slot's narrow accessors.
pub struct TaskSlot {
    task: Mutex<Task>,
    pub cancel: CancelToken,
    pub resume: tokio::sync::Notify,
}

impl TaskSlot {
    pub fn new(task: Task) -> Self {
        Self {
            task: Mutex::new(task),
            cancel: CancelToken::new(),
            resume: tokio::sync::Notify::new(),
        }
    }

    pub fn snapshot(&self) -> Task {
        self.task.lock().expect("task lock poisoned").clone()
    }

    pub fn with_task<R>(&self, f: impl FnOnce(&mut Task) -> R) -> R {
        let mut task = self.task.lock().expect("task lock poisoned");
        f(&mut task)
    }
}

// ---------------------------------------------------------------------------
// EngineDeps
// ---------------------------------------------------------------------------

/// Bundle of shared components handed to every driver.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<AuditStore>,
    pub broker: Arc<OverlayBroker>,
    pub guard: Arc<PolicyGuard>,
    pub workspaces: Arc<WorkspaceManager>,
    pub sandbox: Arc<SandboxRunner>,
    pub registry: Arc<AdapterRegistry>,
    pub predicates: Arc<PredicateRegistry>,
    pub config: Arc<Config>,
}

// ---------------------------------------------------------------------------
// Step results
// ---------------------------------------------------------------------------

enum Step {
    Goto(TaskState),
    Stay,
    Fail(FailureReason, String),
    Suspend,
    Cancelled,
}

enum PhaseCall {
    Outcome(PhaseOutcome, PhaseRun),
    BudgetDenied(String),
    Cancelled,
    /// Adapter machinery failed after the bounded retry budget.
    GaveUp(String),
}

// ---------------------------------------------------------------------------
// TaskDriver
// ---------------------------------------------------------------------------

/// Drives a single task through plan→code→test→review→commit(→deploy).
///
/// Every transition is appended to the audit store before any side effect
/// of the destination state begins; on restart the scheduler rebuilds a
/// driver from the latest durable state and the next action is reissued
/// under a fresh attempt number.
pub struct TaskDriver {
    deps: EngineDeps,
    slot: Arc<TaskSlot>,
    profile: PolicyProfile,
    state: TaskState,
    workspace: Option<Workspace>,
    current_sha: String,
    attempts: HashMap<Phase, u32>,
    plan_attempts: u32,
    pending_feedback: Option<String>,
    pending_patch: Option<PatchSet>,
    review_summary: Option<String>,
    suspend_return: TaskState,
    fail_reason: Option<FailureReason>,
    warned_budget: bool,
}

impl TaskDriver {
    pub fn new(deps: EngineDeps, slot: Arc<TaskSlot>, resume_from: TaskState) -> Self {
        let snapshot = slot.snapshot();
        let profile = deps
            .config
            .profile(&snapshot.profile)
            .cloned()
            .unwrap_or_else(|| {
                // Submission validated the profile; an empty stand-in keeps
                // the deny-by-default behavior if config was reloaded badly.
                warn!(task_id = %snapshot.id, profile = %snapshot.profile, "profile missing at drive time");
                PolicyProfile {
                    name: snapshot.profile.clone(),
                    version: snapshot.profile_version,
                    command_allow: vec![],
                    write_scopes: vec![],
                    egress_allow: vec![],
                    per_call_cost_ceiling: 0.0,
                    per_task_cost_ceiling: 0.0,
                    sandbox_tier: dr_core::types::SandboxTier::High,
                }
            });
        let current_sha = snapshot.repo.commit_sha.clone();
        let attempts = primed_attempts(&deps.store, &snapshot.id);
        // A task recovered while SUSPENDED resumes into the state it was
        // suspended from, which the audit log remembers.
        let suspend_return = if resume_from == TaskState::Suspended {
            suspended_from(&deps.store, &snapshot.id).unwrap_or(TaskState::Planning)
        } else {
            resume_from
        };
        Self {
            deps,
            slot,
            profile,
            state: resume_from,
            workspace: None,
            current_sha,
            attempts,
            plan_attempts: 0,
            pending_feedback: None,
            pending_patch: None,
            review_summary: None,
            suspend_return,
            fail_reason: None,
            warned_budget: false,
        }
    }

    fn task_id(&self) -> String {
        self.slot.with_task(|t| t.id.clone())
    }

    /// Run the task to a terminal state. Returns the terminal state.
    pub async fn drive(mut self) -> TaskState {
        let task_id = self.task_id();
        info!(task_id = %task_id, state = %self.state, "driver starting");

        if self.slot.cancel.is_cancelled() {
            self.finalize_cancel().await;
            return self.state;
        }

        if !self.materialize_workspace().await {
            return self.state;
        }

        if self.state == TaskState::Pending && !self.transition(TaskState::Planning).await {
            return self.state;
        }

        while !self.state.is_terminal() {
            if self.slot.cancel.is_cancelled() {
                self.finalize_cancel().await;
                break;
            }

            let step = match self.state {
                TaskState::Planning => self.run_planning().await,
                TaskState::Coding => self.run_coding().await,
                TaskState::Testing => self.run_testing().await,
                TaskState::Reviewing => self.run_reviewing().await,
                TaskState::CommitPending => self.run_commit().await,
                TaskState::Deploying => self.run_deploy().await,
                TaskState::Suspended => self.park_suspended().await,
                state => {
                    error!(task_id = %task_id, %state, "driver reached an impossible state");
                    Step::Fail(FailureReason::Internal, format!("impossible state {state}"))
                }
            };

            match step {
                Step::Goto(next) => {
                    if !self.transition(next).await {
                        break;
                    }
                }
                Step::Stay => {}
                Step::Suspend => {
                    self.suspend_return = self.state;
                    if !self.transition(TaskState::Suspended).await {
                        break;
                    }
                }
                Step::Fail(reason, detail) => {
                    self.fail_reason = Some(reason);
                    warn!(task_id = %task_id, %reason, detail, "task failing");
                    let _ = self.transition(TaskState::Failed).await;
                    break;
                }
                Step::Cancelled => {
                    self.finalize_cancel().await;
                    break;
                }
            }
        }

        self.finalize();
        info!(task_id = %task_id, state = %self.state, "driver finished");
        self.state
    }

    // -----------------------------------------------------------------------
    // Phase handlers
    // -----------------------------------------------------------------------

    async fn run_planning(&mut self) -> Step {
        match self.call_adapter(Phase::Plan, false).await {
            PhaseCall::Outcome(outcome, mut run) => match outcome.classification {
                Classification::Ok => {
                    if let Some(OutcomePayload::Plan(text)) = &outcome.payload {
                        self.export_artifact(&mut run, "plan", text.as_bytes());
                    }
                    self.finish_run(run, PhaseRunOutcome::Ok, &outcome);
                    Step::Goto(TaskState::Coding)
                }
                Classification::NeedsRefine => {
                    self.finish_run(run, PhaseRunOutcome::Retryable, &outcome);
                    self.plan_attempts += 1;
                    if self.plan_attempts < self.deps.config.engine.plan_max_attempts {
                        self.pending_feedback = outcome.feedback;
                        Step::Stay
                    } else {
                        Step::Fail(
                            FailureReason::AdapterPermanent,
                            "plan refinement attempts exhausted".into(),
                        )
                    }
                }
                Classification::FailedTransient | Classification::FailedPermanent => {
                    self.finish_run(run, PhaseRunOutcome::Fatal, &outcome);
                    Step::Fail(
                        FailureReason::AdapterPermanent,
                        outcome.feedback.unwrap_or_else(|| "planning failed".into()),
                    )
                }
            },
            PhaseCall::BudgetDenied(reason) => self.budget_failure(reason),
            PhaseCall::Cancelled => Step::Cancelled,
            PhaseCall::GaveUp(detail) => Step::Fail(FailureReason::AdapterPermanent, detail),
        }
    }

    async fn run_coding(&mut self) -> Step {
        match self.call_adapter(Phase::Code, true).await {
            PhaseCall::Outcome(outcome, mut run) => {
                // One iteration per CODING entry that actually ran.
                self.slot.with_task(|t| t.spent.iterations += 1);

                match outcome.classification {
                    Classification::Ok => {
                        let patch = match &outcome.payload {
                            Some(OutcomePayload::Patch(patch)) => patch.clone(),
                            _ => {
                                self.finish_run(run, PhaseRunOutcome::Fatal, &outcome);
                                return Step::Fail(
                                    FailureReason::AdapterPermanent,
                                    "coding outcome carried no patch".into(),
                                );
                            }
                        };
                        match self.apply_patch(&patch).await {
                            PatchApply::Applied => {
                                let bytes =
                                    serde_json::to_vec(&patch).unwrap_or_default();
                                self.export_artifact(&mut run, "patch", &bytes);
                                self.finish_run(run, PhaseRunOutcome::Ok, &outcome);
                                self.pending_patch = Some(patch);
                                Step::Goto(TaskState::Testing)
                            }
                            PatchApply::OutOfScope(detail) => {
                                self.finish_run(run, PhaseRunOutcome::PolicyBlocked, &outcome);
                                Step::Fail(FailureReason::AdapterPermanent, detail)
                            }
                            PatchApply::Conflict(feedback) => {
                                self.finish_run(run, PhaseRunOutcome::Retryable, &outcome);
                                self.pending_feedback = Some(feedback);
                                self.iteration_guard()
                            }
                            PatchApply::Cancelled => Step::Cancelled,
                        }
                    }
                    Classification::NeedsRefine => {
                        self.finish_run(run, PhaseRunOutcome::Retryable, &outcome);
                        self.pending_feedback = outcome.feedback;
                        self.iteration_guard()
                    }
                    Classification::FailedTransient | Classification::FailedPermanent => {
                        self.finish_run(run, PhaseRunOutcome::Fatal, &outcome);
                        Step::Fail(
                            FailureReason::AdapterPermanent,
                            outcome.feedback.unwrap_or_else(|| "coding failed".into()),
                        )
                    }
                }
            }
            PhaseCall::BudgetDenied(reason) => self.budget_failure(reason),
            PhaseCall::Cancelled => Step::Cancelled,
            PhaseCall::GaveUp(detail) => Step::Fail(FailureReason::AdapterPermanent, detail),
        }
    }

    async fn run_testing(&mut self) -> Step {
        let snapshot = self.slot.snapshot();
        let predicates = match self.deps.predicates.resolve(&snapshot.acceptance) {
            Ok(predicates) => predicates,
            Err(e) => {
                return Step::Fail(FailureReason::Internal, e.to_string());
            }
        };

        let attempt = self.next_attempt(Phase::Test);
        let mut run = PhaseRun::begin(&snapshot.id, Phase::Test, attempt, "acceptance");
        let sandbox_ctx = self.sandbox_ctx(&snapshot);

        let mut failures = Vec::new();
        for predicate in predicates {
            let result = tokio::select! {
                result = predicate.evaluate(
                    &self.deps.sandbox,
                    &sandbox_ctx,
                    self.pending_patch.as_ref(),
                ) => result,
                _ = self.slot.cancel.cancelled() => return Step::Cancelled,
            };
            if !result.passed {
                failures.push(result.summary);
            }
        }

        run.ended_at = Some(Utc::now());
        if failures.is_empty() {
            run.outcome = PhaseRunOutcome::Ok;
            self.append_phase_run(&run);
            Step::Goto(TaskState::Reviewing)
        } else {
            run.outcome = PhaseRunOutcome::Retryable;
            let summary = failures.join("; ");
            self.export_artifact(&mut run, "test_failures", summary.as_bytes());
            self.append_phase_run(&run);
            self.pending_feedback = Some(format!("acceptance predicates failed: {summary}"));
            self.iteration_guard()
        }
    }

    async fn run_reviewing(&mut self) -> Step {
        match self.call_adapter(Phase::Review, false).await {
            PhaseCall::Outcome(outcome, mut run) => match outcome.classification {
                Classification::Ok => {
                    let report = match &outcome.payload {
                        Some(OutcomePayload::ReviewReport(report)) => report.clone(),
                        _ => {
                            self.finish_run(run, PhaseRunOutcome::Fatal, &outcome);
                            return Step::Fail(
                                FailureReason::AdapterPermanent,
                                "review outcome carried no report".into(),
                            );
                        }
                    };
                    if report.approved {
                        self.export_artifact(&mut run, "review", report.summary.as_bytes());
                        // Only a reviewer declaring summarize_diff feeds
                        // the commit record's diff summary.
                        let summarizes = self
                            .deps
                            .registry
                            .get(&run.adapter_id)
                            .map(|a| {
                                a.descriptor()
                                    .capabilities
                                    .contains(&AdapterCapability::SummarizeDiff)
                            })
                            .unwrap_or(false);
                        self.finish_run(run, PhaseRunOutcome::Ok, &outcome);
                        self.review_summary = summarizes.then_some(report.summary);
                        Step::Goto(TaskState::CommitPending)
                    } else {
                        self.finish_run(run, PhaseRunOutcome::Retryable, &outcome);
                        self.pending_feedback =
                            Some(format!("review rejected the change: {}", report.summary));
                        self.iteration_guard()
                    }
                }
                Classification::NeedsRefine => {
                    self.finish_run(run, PhaseRunOutcome::Retryable, &outcome);
                    self.pending_feedback = outcome.feedback;
                    self.iteration_guard()
                }
                Classification::FailedTransient | Classification::FailedPermanent => {
                    self.finish_run(run, PhaseRunOutcome::Fatal, &outcome);
                    Step::Fail(
                        FailureReason::AdapterPermanent,
                        outcome.feedback.unwrap_or_else(|| "review failed".into()),
                    )
                }
            },
            PhaseCall::BudgetDenied(reason) => self.budget_failure(reason),
            PhaseCall::Cancelled => Step::Cancelled,
            PhaseCall::GaveUp(detail) => Step::Fail(FailureReason::AdapterPermanent, detail),
        }
    }

    async fn run_commit(&mut self) -> Step {
        match self.call_adapter(Phase::Commit, false).await {
            PhaseCall::Outcome(outcome, mut run) => match outcome.classification {
                Classification::Ok => {
                    if let Some(OutcomePayload::CommitMessage(message)) = &outcome.payload {
                        self.export_artifact(&mut run, "commit_message", message.as_bytes());
                    }
                    // The approved review's summary doubles as the diff
                    // summary attached to the commit record.
                    if let Some(summary) = self.review_summary.take() {
                        self.export_artifact(&mut run, "diff_summary", summary.as_bytes());
                    }
                    self.finish_run(run, PhaseRunOutcome::Ok, &outcome);
                    let deploy = self.slot.with_task(|t| t.deploy);
                    if deploy {
                        Step::Goto(TaskState::Deploying)
                    } else {
                        Step::Goto(TaskState::Succeeded)
                    }
                }
                Classification::NeedsRefine => {
                    self.finish_run(run, PhaseRunOutcome::Retryable, &outcome);
                    self.pending_feedback = outcome.feedback;
                    Step::Stay
                }
                Classification::FailedTransient | Classification::FailedPermanent => {
                    self.finish_run(run, PhaseRunOutcome::Fatal, &outcome);
                    Step::Fail(
                        FailureReason::AdapterPermanent,
                        outcome.feedback.unwrap_or_else(|| "commit failed".into()),
                    )
                }
            },
            PhaseCall::BudgetDenied(reason) => self.budget_failure(reason),
            PhaseCall::Cancelled => Step::Cancelled,
            PhaseCall::GaveUp(detail) => Step::Fail(FailureReason::AdapterPermanent, detail),
        }
    }

    async fn run_deploy(&mut self) -> Step {
        match self.call_adapter(Phase::Deploy, false).await {
            PhaseCall::Outcome(outcome, mut run) => match outcome.classification {
                Classification::Ok => {
                    if let Some(OutcomePayload::DeployRecord(record)) = &outcome.payload {
                        self.export_artifact(&mut run, "deploy_record", record.as_bytes());
                    }
                    self.finish_run(run, PhaseRunOutcome::Ok, &outcome);
                    Step::Goto(TaskState::Succeeded)
                }
                Classification::NeedsRefine => {
                    self.finish_run(run, PhaseRunOutcome::Retryable, &outcome);
                    self.pending_feedback = outcome.feedback;
                    Step::Stay
                }
                Classification::FailedTransient | Classification::FailedPermanent => {
                    self.finish_run(run, PhaseRunOutcome::Fatal, &outcome);
                    Step::Fail(
                        FailureReason::AdapterPermanent,
                        outcome.feedback.unwrap_or_else(|| "deploy failed".into()),
                    )
                }
            },
            PhaseCall::BudgetDenied(reason) => self.budget_failure(reason),
            PhaseCall::Cancelled => Step::Cancelled,
            PhaseCall::GaveUp(detail) => Step::Fail(FailureReason::AdapterPermanent, detail),
        }
    }

    /// Wait in SUSPENDED for an operator resume (budget top-up) or cancel.
    async fn park_suspended(&mut self) -> Step {
        tokio::select! {
            _ = self.slot.resume.notified() => {
                info!(task_id = %self.task_id(), "task resumed by operator");
                Step::Goto(self.suspend_return)
            }
            _ = self.slot.cancel.cancelled() => Step::Cancelled,
        }
    }

    // -----------------------------------------------------------------------
    // Adapter invocation with budget gate, retry, and timeout
    // -----------------------------------------------------------------------

    async fn call_adapter(&mut self, phase: Phase, consumes_iteration: bool) -> PhaseCall {
        let retry_max = self.deps.config.engine.retry_max_attempts;
        let mut transient_streak: u32 = 0;

        loop {
            let snapshot = self.slot.snapshot();
            let adapter = match self.deps.registry.route(snapshot.mode, phase) {
                Ok(adapter) => adapter,
                Err(e) => return PhaseCall::GaveUp(e.to_string()),
            };

            let ctx = self.task_context(&snapshot);
            let digest = context_digest(&ctx, phase);
            let estimate = adapter.estimate_cost(phase, &digest);

            let decision = match self.budget_gate(&snapshot, estimate, consumes_iteration).await {
                Some(decision) => decision,
                None => return PhaseCall::Cancelled,
            };
            if let Decision::Deny { reason } = decision {
                return PhaseCall::BudgetDenied(reason);
            }

            let attempt = self.next_attempt(phase);
            let run = PhaseRun::begin(&snapshot.id, phase, attempt, adapter.id());
            let feedback = self.pending_feedback.take();
            let timeout = Duration::from_secs(self.deps.config.engine.phase_timeout_secs);

            debug!(
                task_id = %snapshot.id,
                %phase,
                attempt,
                adapter = adapter.id(),
                refining = feedback.is_some(),
                "invoking adapter"
            );

            let can_refine = adapter
                .descriptor()
                .capabilities
                .contains(&AdapterCapability::Refine);
            let call = async {
                match &feedback {
                    Some(fb) if can_refine => adapter.refine(phase, &ctx, fb).await,
                    // Adapters without the refine capability get the
                    // critic's feedback folded into a fresh proposal.
                    Some(fb) => adapter.propose(phase, &ctx, Some(fb)).await,
                    None => adapter.propose(phase, &ctx, None).await,
                }
            };

            let result = tokio::select! {
                result = call => result,
                _ = self.slot.cancel.cancelled() => {
                    return PhaseCall::Cancelled;
                }
                _ = tokio::time::sleep(timeout) => {
                    warn!(task_id = %snapshot.id, %phase, ?timeout, "phase wall clock expired");
                    // The dropped adapter future may leave a sandbox run
                    // behind; reap it before retrying.
                    self.deps
                        .sandbox
                        .cancel_task(&snapshot.id, Duration::from_secs(1))
                        .await;
                    Err(AdapterError::Transient(format!("phase timed out after {timeout:?}")))
                }
            };

            match result {
                Ok(outcome) => {
                    if !self.spend(&outcome) {
                        let mut run = run;
                        run.ended_at = Some(Utc::now());
                        run.outcome = PhaseRunOutcome::BudgetExceeded;
                        self.append_phase_run(&run);
                        return PhaseCall::BudgetDenied(
                            "actual adapter cost exhausted the task budget".into(),
                        );
                    }
                    if !outcome.is_well_formed(phase) {
                        let mut run = run;
                        run.ended_at = Some(Utc::now());
                        run.outcome = PhaseRunOutcome::Fatal;
                        self.append_phase_run(&run);
                        return PhaseCall::GaveUp(format!(
                            "adapter `{}` returned a malformed outcome for {phase}",
                            adapter.id()
                        ));
                    }
                    return PhaseCall::Outcome(outcome, run);
                }
                Err(AdapterError::Permanent(detail)) => {
                    let mut run = run;
                    run.ended_at = Some(Utc::now());
                    run.outcome = PhaseRunOutcome::Fatal;
                    self.append_phase_run(&run);
                    return PhaseCall::GaveUp(detail);
                }
                Err(AdapterError::Transient(detail)) => {
                    let mut run = run;
                    run.ended_at = Some(Utc::now());
                    run.outcome = PhaseRunOutcome::Retryable;
                    self.append_phase_run(&run);
                    // The retry should still see the critic's feedback.
                    self.pending_feedback = feedback;

                    transient_streak += 1;
                    if transient_streak >= retry_max {
                        return PhaseCall::GaveUp(format!(
                            "adapter kept failing transiently: {detail}"
                        ));
                    }
                    let backoff = backoff_delay(
                        transient_streak,
                        self.deps.config.engine.retry_base_ms,
                        self.deps.config.engine.retry_cap_ms,
                    );
                    warn!(
                        task_id = %snapshot.id,
                        %phase,
                        streak = transient_streak,
                        ?backoff,
                        detail,
                        "transient adapter failure, backing off"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.slot.cancel.cancelled() => return PhaseCall::Cancelled,
                    }
                }
            }
        }
    }

    /// Budget gate with audit-unavailable blocking. `None` means the task
    /// was cancelled while the gate was unreachable.
    async fn budget_gate(
        &mut self,
        snapshot: &Task,
        estimate: CostEstimate,
        consumes_iteration: bool,
    ) -> Option<Decision> {
        let mut backoff_n: u32 = 0;
        loop {
            match self
                .deps
                .guard
                .check_budget(&self.profile, snapshot, estimate, consumes_iteration)
            {
                Ok(decision) => return Some(decision),
                Err(e) => {
                    // No decision without a durable record of it.
                    backoff_n = backoff_n.saturating_add(1);
                    let delay = backoff_delay(
                        backoff_n,
                        self.deps.config.engine.retry_base_ms,
                        self.deps.config.engine.retry_cap_ms,
                    );
                    warn!(task_id = %snapshot.id, error = %e, ?delay, "audit unavailable, budget gate blocked");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.slot.cancel.cancelled() => return None,
                    }
                }
            }
        }
    }

    /// Account actual cost. Returns `false` when the task budget is now
    /// exhausted (spent is clamped to the ceiling so it never reads over).
    fn spend(&mut self, outcome: &PhaseOutcome) -> bool {
        let (within, spent, budget) = self.slot.with_task(|t| {
            let new_total = t.spent.cost_usd + outcome.cost_usd;
            let within = new_total <= t.budgets.cost_usd;
            t.spent.cost_usd = new_total.min(t.budgets.cost_usd);
            (within, t.spent.cost_usd, t.budgets.cost_usd)
        });

        let warn_at = budget * self.deps.config.budget.warn_fraction;
        if !self.warned_budget && budget > 0.0 && spent >= warn_at {
            self.warned_budget = true;
            let task_id = self.task_id();
            let _ = self.deps.broker.publish_meta(
                &task_id,
                MetaRecord::new(
                    MetaKind::BudgetWarning,
                    format!("spent ${spent:.4} of ${budget:.4}"),
                ),
            );
            let entry = AuditEntry::new(&task_id, AuditKind::BudgetWarning).with_payload(
                serde_json::json!({ "spent_usd": spent, "budget_usd": budget }),
            );
            if let Err(e) = self.deps.store.append(entry) {
                warn!(task_id = %task_id, error = %e, "failed to audit budget warning");
            }
        }
        within
    }

    fn budget_failure(&mut self, reason: String) -> Step {
        let failure = if reason.contains("iteration") {
            FailureReason::IterationBudgetExhausted
        } else if reason.contains("wall") {
            FailureReason::WallTimeExceeded
        } else {
            FailureReason::BudgetExceeded
        };
        if self.deps.config.engine.suspend_on_budget {
            info!(task_id = %self.task_id(), %reason, "budget exhausted, suspending for operator top-up");
            Step::Suspend
        } else {
            Step::Fail(failure, reason)
        }
    }

    /// TESTING/REVIEWING send the task back to CODING only while the
    /// iteration budget has room.
    fn iteration_guard(&self) -> Step {
        let (spent, max) = self
            .slot
            .with_task(|t| (t.spent.iterations, t.budgets.max_iterations));
        if spent >= max {
            Step::Fail(
                FailureReason::IterationBudgetExhausted,
                format!("{spent} of {max} iterations used"),
            )
        } else {
            Step::Goto(TaskState::Coding)
        }
    }

    // -----------------------------------------------------------------------
    // Patch application
    // -----------------------------------------------------------------------

    async fn apply_patch(&mut self, patch: &PatchSet) -> PatchApply {
        let Some(ws) = &self.workspace else {
            return PatchApply::Conflict("workspace not materialized".into());
        };
        let task_id = self.task_id();

        // Write-scope containment first; touched paths are resolved
        // against the workspace, and the profile's prefix set must cover
        // the ephemeral workspace root.
        let paths: Vec<std::path::PathBuf> = patch
            .touched_paths()
            .into_iter()
            .map(|p| ws.path.join(p))
            .collect();
        loop {
            match self.deps.guard.check_write(&self.profile, &task_id, &paths) {
                Ok(Decision::Allow) => break,
                Ok(Decision::Deny { reason }) => {
                    return PatchApply::OutOfScope(format!("patch rejected: {reason}"));
                }
                Err(e) => {
                    warn!(task_id = %task_id, error = %e, "audit unavailable, write gate blocked");
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_millis(
                            self.deps.config.engine.retry_base_ms,
                        )) => {}
                        _ = self.slot.cancel.cancelled() => return PatchApply::Cancelled,
                    }
                }
            }
        }

        match self.deps.workspaces.apply_patchset(ws, patch) {
            Ok(()) => {
                match self.deps.workspaces.head_sha(ws) {
                    Ok(head) => self.current_sha = head,
                    Err(e) => {
                        debug!(task_id = %task_id, error = %e, "head probe failed after apply");
                    }
                }
                PatchApply::Applied
            }
            Err(WorkspaceError::PreconditionMismatch { expected, actual }) => {
                // Refresh the bound sha so the next attempt computes
                // against reality.
                self.current_sha = actual.clone();
                PatchApply::Conflict(format!(
                    "patch was computed against {expected} but the workspace is at {actual}; recompute"
                ))
            }
            Err(e) => PatchApply::Conflict(format!("patch failed to apply: {e}")),
        }
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    async fn materialize_workspace(&mut self) -> bool {
        let snapshot = self.slot.snapshot();
        match self.deps.workspaces.reallocate(&snapshot.id, &snapshot.repo) {
            Ok(ws) => {
                self.current_sha = ws.bound_sha.clone();
                // A task submitted without a pin binds to the resolved head.
                self.slot
                    .with_task(|t| t.repo.commit_sha = ws.bound_sha.clone());
                self.workspace = Some(ws);
                true
            }
            Err(e) => {
                error!(task_id = %snapshot.id, error = %e, "workspace materialization failed");
                self.fail_reason = Some(FailureReason::Internal);
                let _ = self.transition(TaskState::Failed).await;
                self.finalize();
                false
            }
        }
    }

    fn task_context(&self, snapshot: &Task) -> TaskContext {
        let ws_root = self
            .workspace
            .as_ref()
            .map(|w| w.path.clone())
            .unwrap_or_default();
        TaskContext {
            task_id: snapshot.id.clone(),
            workspace_root: ws_root,
            commit_sha: self.current_sha.clone(),
            goal: snapshot.goal.clone(),
            acceptance_summary: snapshot.acceptance.join(", "),
            profile: snapshot.profile.clone(),
            remaining_cost_usd: snapshot.remaining_cost_usd(),
            remaining_iterations: snapshot.remaining_iterations(),
            remaining_wall_secs: snapshot
                .budgets
                .wall_time_secs
                .saturating_sub(snapshot.elapsed_secs(Utc::now())),
        }
    }

    fn sandbox_ctx(&self, snapshot: &Task) -> SandboxCtx {
        SandboxCtx {
            task_id: snapshot.id.clone(),
            workspace: self
                .workspace
                .as_ref()
                .map(|w| w.path.clone())
                .unwrap_or_default(),
            profile: self.profile.clone(),
            extra_env: vec![],
        }
    }

    fn next_attempt(&mut self, phase: Phase) -> u32 {
        let counter = self.attempts.entry(phase).or_insert(0);
        *counter += 1;
        *counter
    }

    fn export_artifact(&self, run: &mut PhaseRun, name: &str, bytes: &[u8]) {
        match self.deps.workspaces.export_blob(bytes) {
            Ok(blob) => {
                run.artifacts.insert(name.to_string(), blob);
            }
            Err(e) => {
                warn!(task_id = %run.task_id, artifact = name, error = %e, "artifact export failed");
            }
        }
    }

    fn finish_run(&self, mut run: PhaseRun, outcome: PhaseRunOutcome, phase: &PhaseOutcome) {
        run.ended_at = Some(Utc::now());
        run.outcome = outcome;
        run.tokens_in = phase.tokens_in;
        run.tokens_out = phase.tokens_out;
        run.cost_usd = phase.cost_usd;
        self.append_phase_run(&run);
    }

    /// PhaseRun records are informational; unlike transitions they do not
    /// block the driver when the store hiccups (the next transition will).
    fn append_phase_run(&self, run: &PhaseRun) {
        let entry = AuditEntry::new(&run.task_id, AuditKind::PhaseRun)
            .with_payload(serde_json::to_value(run).unwrap_or_default())
            .with_causation(run.id.to_string());
        if let Err(e) = self.deps.store.append(entry) {
            warn!(task_id = %run.task_id, error = %e, "failed to audit phase run");
        }
    }

    /// Write-ahead transition: durable audit first, then the in-memory
    /// update, then the observability event. Returns `false` when the task
    /// was cancelled while the store was unavailable.
    async fn transition(&mut self, to: TaskState) -> bool {
        let task_id = self.task_id();
        let mut entry = AuditEntry::transition(&task_id, self.state, to);
        if to == TaskState::Failed {
            if let Some(reason) = self.fail_reason {
                entry = entry.with_payload(serde_json::json!({ "reason": reason }));
            }
        }

        let mut backoff_n: u32 = 0;
        loop {
            match self.deps.store.append(entry.clone()) {
                Ok(_) => break,
                Err(e) if e.is_retryable() => {
                    backoff_n = backoff_n.saturating_add(1);
                    let delay = backoff_delay(
                        backoff_n,
                        self.deps.config.engine.retry_base_ms,
                        self.deps.config.engine.retry_cap_ms,
                    );
                    warn!(task_id = %task_id, error = %e, ?delay, "audit unavailable, holding state");
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.slot.cancel.cancelled() => {
                            // No durable record is possible; stop here and
                            // let restart recovery settle the task.
                            warn!(task_id = %task_id, "cancelled while audit store was down");
                            return false;
                        }
                    }
                }
                Err(e) => {
                    error!(task_id = %task_id, error = %e, "audit append failed fatally");
                    self.state = TaskState::Failed;
                    self.slot.with_task(|t| {
                        t.status = dr_core::types::TaskStatus::Failed;
                        t.terminal_at = Some(Utc::now());
                        t.terminal_reason = Some(FailureReason::Internal);
                    });
                    return false;
                }
            }
        }

        let from = self.state;
        self.state = to;
        self.slot.with_task(|t| {
            t.status = to.status();
            t.spent.wall_time_secs = t.elapsed_secs(Utc::now()).min(t.budgets.wall_time_secs);
            if to.is_terminal() {
                t.terminal_at = Some(Utc::now());
                if to == TaskState::Failed {
                    t.terminal_reason = self.fail_reason.or(Some(FailureReason::Internal));
                } else if to == TaskState::Cancelled {
                    t.terminal_reason = Some(FailureReason::Cancelled);
                }
            }
        });

        info!(task_id = %task_id, %from, %to, "task transition");
        let _ = self.deps.broker.publish_meta(
            &task_id,
            MetaRecord::new(MetaKind::PhaseTransition, format!("{from} -> {to}")),
        );
        true
    }

    /// Cancellation: stop the sandbox, emit META(cancelled), then audit
    /// the CANCELLED transition last.
    async fn finalize_cancel(&mut self) {
        let task_id = self.task_id();
        let grace = Duration::from_secs(self.deps.config.engine.cancel_grace_secs);
        info!(task_id = %task_id, ?grace, "cancelling task");

        self.deps.sandbox.cancel_task(&task_id, grace).await;
        let reason = self
            .slot
            .cancel
            .reason()
            .unwrap_or_else(|| "cancelled".into());
        let _ = self
            .deps
            .broker
            .publish_meta(&task_id, MetaRecord::new(MetaKind::Cancelled, reason));

        let _ = self.transition(TaskState::Cancelled).await;
        self.finalize();
    }

    /// Terminal cleanup: close the overlay topic and hand the workspace to
    /// the retention sweeper. Idempotent.
    fn finalize(&mut self) {
        if !self.state.is_terminal() {
            return;
        }
        let task_id = self.task_id();
        if let Err(e) = self.deps.broker.close(&task_id) {
            warn!(task_id = %task_id, error = %e, "overlay close failed");
        }
        self.deps.workspaces.retire(&task_id);
    }
}

enum PatchApply {
    Applied,
    OutOfScope(String),
    Conflict(String),
    Cancelled,
}

/// Exponential backoff with a cap.
fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let ms = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
    Duration::from_millis(ms)
}

/// The state a task held before its most recent suspension.
fn suspended_from(store: &AuditStore, task_id: &str) -> Option<TaskState> {
    store
        .scan(task_id, 0)
        .ok()?
        .into_iter()
        .rev()
        .find(|e| e.next_state == Some(TaskState::Suspended))
        .and_then(|e| e.prior_state)
}

/// On recovery, attempt numbers continue after the persisted PhaseRuns so
/// reissued actions stay distinguishable.
fn primed_attempts(store: &AuditStore, task_id: &str) -> HashMap<Phase, u32> {
    let mut attempts = HashMap::new();
    let Ok(entries) = store.scan(task_id, 0) else {
        return attempts;
    };
    for entry in entries {
        if entry.kind != AuditKind::PhaseRun {
            continue;
        }
        if let Ok(run) = serde_json::from_value::<PhaseRun>(entry.payload.clone()) {
            let counter = attempts.entry(run.phase).or_insert(0);
            *counter = (*counter).max(run.attempt);
        }
    }
    attempts
}

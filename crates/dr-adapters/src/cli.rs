//! Adapter for CLI coding agents driven over a PTY.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use dr_core::events::StreamKind;
use dr_core::types::{
    AdapterDescriptor, CostEstimate, Phase, PolicyProfile, TaskContext,
};
use dr_overlay::{OverlayBroker, SubscribeFrom};
use dr_sandbox::{ExitReason, SandboxCtx, SandboxRunner};

use crate::adapter::{AdapterError, AgentAdapter, PhaseOutcome, Result};
use crate::wire;

/// Drives one external CLI coding agent (aider, codellm, and friends)
/// through the sandbox.
///
/// The agent receives its instructions on stdin, works inside the task
/// workspace, and reports by printing a final JSON line with a top-level
/// `"outcome"` key. Everything it prints passes through the overlay
/// stream untouched; this adapter reads its own task's stream back to
/// find the structured tail.
pub struct CliAgentAdapter {
    descriptor: AdapterDescriptor,
    binary: String,
    base_args: Vec<String>,
    runner: Arc<SandboxRunner>,
    broker: Arc<OverlayBroker>,
    profiles: HashMap<String, PolicyProfile>,
    run_timeout: Duration,
}

impl CliAgentAdapter {
    pub fn new(
        descriptor: AdapterDescriptor,
        binary: impl Into<String>,
        base_args: Vec<String>,
        runner: Arc<SandboxRunner>,
        broker: Arc<OverlayBroker>,
        profiles: Vec<PolicyProfile>,
        run_timeout: Duration,
    ) -> Self {
        Self {
            descriptor,
            binary: binary.into(),
            base_args,
            runner,
            broker,
            profiles: profiles.into_iter().map(|p| (p.name.clone(), p)).collect(),
            run_timeout,
        }
    }

    fn build_instructions(
        &self,
        phase: Phase,
        ctx: &TaskContext,
        prior_feedback: Option<&str>,
    ) -> String {
        let mut text = format!(
            "Phase: {phase}\nGoal: {}\nCommit: {}\nAcceptance: {}\n",
            ctx.goal, ctx.commit_sha, ctx.acceptance_summary
        );
        if let Some(feedback) = prior_feedback {
            text.push_str(&format!("Feedback from the previous attempt:\n{feedback}\n"));
        }
        text.push_str(
            "Work only inside the current directory. Finish by printing a single JSON line \
             {\"outcome\": ...} describing the result.\n",
        );
        text
    }
}

#[async_trait]
impl AgentAdapter for CliAgentAdapter {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    fn estimate_cost(&self, phase: Phase, _context_digest: &str) -> CostEstimate {
        let (tokens_in, tokens_out) = phase_token_estimate(phase);
        CostEstimate {
            cost_usd: self.descriptor.cost_model.project(tokens_in, tokens_out),
            wall_time_secs: self.descriptor.cost_model.est_wall_time_secs,
        }
    }

    async fn propose(
        &self,
        phase: Phase,
        ctx: &TaskContext,
        prior_feedback: Option<&str>,
    ) -> Result<PhaseOutcome> {
        let profile = self
            .profiles
            .get(&ctx.profile)
            .cloned()
            .ok_or_else(|| AdapterError::Permanent(format!("unknown profile `{}`", ctx.profile)))?;

        let mut argv = vec![self.binary.clone()];
        argv.extend(self.base_args.iter().cloned());
        argv.push("--phase".into());
        argv.push(phase.to_string());

        let instructions = self.build_instructions(phase, ctx, prior_feedback);

        // Watch our own overlay stream to recover the agent's output.
        let sub = self
            .broker
            .subscribe(&ctx.task_id, SubscribeFrom::Live)
            .map_err(|e| AdapterError::Transient(format!("overlay subscribe failed: {e}")))?;

        let sandbox_ctx = SandboxCtx {
            task_id: ctx.task_id.clone(),
            workspace: ctx.workspace_root.clone(),
            profile,
            extra_env: vec![("DROVER_TASK_ID".into(), ctx.task_id.clone())],
        };

        let mut handle = self
            .runner
            .run(&sandbox_ctx, &argv, Some(instructions.as_bytes()))
            .await
            .map_err(|e| AdapterError::Transient(format!("sandbox run failed: {e}")))?;

        let outcome = handle
            .wait(self.run_timeout)
            .await
            .map_err(|e| AdapterError::Transient(format!("sandbox wait failed: {e}")))?;

        let output: Vec<u8> = sub
            .drain()
            .into_iter()
            .filter(|e| e.stream == StreamKind::Stdout)
            .flat_map(|e| e.payload)
            .collect();
        let output = String::from_utf8_lossy(&output).into_owned();

        debug!(
            task_id = %ctx.task_id,
            %phase,
            exit_reason = ?outcome.exit_reason,
            output_bytes = outcome.output_bytes,
            "cli agent finished"
        );

        match outcome.exit_reason {
            ExitReason::PolicyBlocked => Ok(PhaseOutcome::needs_refine(
                "a command was blocked by policy; stay within the allowed command set",
            )),
            ExitReason::Timeout => Ok(PhaseOutcome::needs_refine(format!(
                "the agent hit the wall-clock cap after {:?}; produce a smaller step",
                outcome.duration
            ))),
            ExitReason::KilledOverRss => Ok(PhaseOutcome::needs_refine(
                "the agent exceeded its memory cap; reduce the working set",
            )),
            ExitReason::OutputExceeded => Ok(PhaseOutcome::needs_refine(
                "the agent exceeded its output cap; be less verbose",
            )),
            ExitReason::Cancelled => Err(AdapterError::Transient("run cancelled".into())),
            ExitReason::Crashed => Err(AdapterError::Transient(format!(
                "agent process crashed (exit code {:?})",
                outcome.exit_code
            ))),
            ExitReason::Normal => match wire::parse_tail_outcome(&output) {
                Some(wire) => Ok(wire.into_phase_outcome(phase, Uuid::new_v4())),
                None => {
                    warn!(task_id = %ctx.task_id, %phase, "agent produced no structured outcome");
                    Ok(PhaseOutcome::failed_permanent(
                        "agent output carried no structured outcome record",
                    ))
                }
            },
        }
    }
}

/// Per-phase token projections for the pure cost estimate.
fn phase_token_estimate(phase: Phase) -> (u64, u64) {
    match phase {
        Phase::Plan => (4_000, 1_500),
        Phase::Code => (8_000, 4_000),
        Phase::Test => (2_000, 500),
        Phase::Review => (6_000, 1_000),
        Phase::Commit => (1_000, 200),
        Phase::Deploy => (500, 200),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

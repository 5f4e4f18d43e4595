use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use dr_core::types::{
    AdapterDescriptor, CostEstimate, PatchSet, Phase, TaskContext,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// An unexpected adapter failure. Expected outcomes (including agent
/// mistakes) travel inside [`PhaseOutcome::classification`]; this error is
/// for the adapter machinery itself breaking.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error("transient adapter failure: {0}")]
    Transient(String),
    #[error("permanent adapter failure: {0}")]
    Permanent(String),
}

pub type Result<T> = std::result::Result<T, AdapterError>;

// ---------------------------------------------------------------------------
// PhaseOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Ok,
    NeedsRefine,
    FailedTransient,
    FailedPermanent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub passed: bool,
    pub summary: String,
    #[serde(default)]
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewReport {
    pub approved: bool,
    pub summary: String,
}

/// The value a phase produces, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomePayload {
    Patch(PatchSet),
    Plan(String),
    TestReport(TestReport),
    ReviewReport(ReviewReport),
    CommitMessage(String),
    DeployRecord(String),
    DiffSummary(String),
}

/// What an adapter hands back for one phase attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseOutcome {
    pub classification: Classification,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<OutcomePayload>,
    /// Feedback for the next refine round (test failures, review notes,
    /// policy denials).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub cost_usd: f64,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

impl PhaseOutcome {
    pub fn ok(payload: OutcomePayload) -> Self {
        Self {
            classification: Classification::Ok,
            payload: Some(payload),
            feedback: None,
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn needs_refine(feedback: impl Into<String>) -> Self {
        Self {
            classification: Classification::NeedsRefine,
            payload: None,
            feedback: Some(feedback.into()),
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn failed_permanent(feedback: impl Into<String>) -> Self {
        Self {
            classification: Classification::FailedPermanent,
            payload: None,
            feedback: Some(feedback.into()),
            cost_usd: 0.0,
            tokens_in: 0,
            tokens_out: 0,
        }
    }

    pub fn with_cost(mut self, cost_usd: f64, tokens_in: u64, tokens_out: u64) -> Self {
        self.cost_usd = cost_usd;
        self.tokens_in = tokens_in;
        self.tokens_out = tokens_out;
        self
    }

    /// An `Ok` outcome must carry the payload its phase calls for; anything
    /// else is malformed and treated as a permanent failure upstream.
    pub fn is_well_formed(&self, phase: Phase) -> bool {
        if self.classification != Classification::Ok {
            return true;
        }
        match (phase, &self.payload) {
            (Phase::Plan, Some(OutcomePayload::Plan(_))) => true,
            (Phase::Code, Some(OutcomePayload::Patch(_))) => true,
            (Phase::Test, Some(OutcomePayload::TestReport(_))) => true,
            (Phase::Review, Some(OutcomePayload::ReviewReport(_))) => true,
            (Phase::Commit, Some(OutcomePayload::CommitMessage(_))) => true,
            (Phase::Deploy, Some(OutcomePayload::DeployRecord(_))) => true,
            _ => false,
        }
    }
}

// ---------------------------------------------------------------------------
// AgentAdapter
// ---------------------------------------------------------------------------

/// Uniform contract over external coding agents.
///
/// Implementations must confine filesystem writes to the task workspace,
/// route shell execution through the sandbox (for `cli_pty` models) or
/// allow-listed HTTP (for `http_api` models), and never spawn anything
/// that outlives the call.
#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn descriptor(&self) -> &AdapterDescriptor;

    fn id(&self) -> &str {
        &self.descriptor().id
    }

    /// Pure projection of what a call would cost; used by the budget gate
    /// before anything is spent.
    fn estimate_cost(&self, phase: Phase, context_digest: &str) -> CostEstimate;

    /// Produce this phase's output from scratch.
    async fn propose(
        &self,
        phase: Phase,
        ctx: &TaskContext,
        prior_feedback: Option<&str>,
    ) -> Result<PhaseOutcome>;

    /// Same contract as `propose`, conditioned on a critic's feedback.
    async fn refine(&self, phase: Phase, ctx: &TaskContext, feedback: &str) -> Result<PhaseOutcome> {
        self.propose(phase, ctx, Some(feedback)).await
    }
}

impl std::fmt::Debug for dyn AgentAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentAdapter").field("id", &self.id()).finish()
    }
}

/// Stable digest of the context an adapter call would see; keyed into
/// `estimate_cost` so estimates stay pure.
pub fn context_digest(ctx: &TaskContext, phase: Phase) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ctx.task_id.as_bytes());
    hasher.update(ctx.commit_sha.as_bytes());
    hasher.update(ctx.goal.as_bytes());
    hasher.update(phase.to_string().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

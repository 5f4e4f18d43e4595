//! Structured outcome records exchanged with external agents.
//!
//! CLI agents emit one JSON line with a top-level `"outcome"` key as the
//! last thing they print; HTTP agents return the same body as their
//! response. Everything else in the byte stream is treated as chatter.

use serde::Deserialize;
use uuid::Uuid;

use dr_core::types::{ChangeType, FileEdit, PatchSet, Phase};

use crate::adapter::{Classification, OutcomePayload, PhaseOutcome, ReviewReport, TestReport};

#[derive(Debug, Deserialize)]
pub(crate) struct WireEnvelope {
    pub outcome: WireOutcome,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireOutcome {
    pub classification: Classification,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub patch: Option<WirePatch>,
    #[serde(default)]
    pub test_report: Option<TestReport>,
    #[serde(default)]
    pub review: Option<ReviewReport>,
    #[serde(default)]
    pub commit_message: Option<String>,
    #[serde(default)]
    pub deploy_record: Option<String>,
    #[serde(default)]
    pub diff_summary: Option<String>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub tokens_in: u64,
    #[serde(default)]
    pub tokens_out: u64,
    #[serde(default)]
    pub cost_usd: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePatch {
    pub precondition_sha: String,
    pub edits: Vec<WireEdit>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireEdit {
    pub path: String,
    pub change_type: ChangeType,
    pub diff: String,
}

impl WireOutcome {
    /// Lift the wire record into a `PhaseOutcome` for `phase`, picking the
    /// payload field that phase calls for.
    pub(crate) fn into_phase_outcome(self, phase: Phase, phase_run_id: Uuid) -> PhaseOutcome {
        let payload = match phase {
            Phase::Plan => self.plan.map(OutcomePayload::Plan),
            Phase::Code => self.patch.map(|p| {
                OutcomePayload::Patch(PatchSet::new(
                    phase_run_id,
                    p.precondition_sha,
                    p.edits
                        .into_iter()
                        .map(|e| FileEdit {
                            path: e.path.into(),
                            change_type: e.change_type,
                            diff: e.diff.into_bytes(),
                        })
                        .collect(),
                ))
            }),
            Phase::Test => self.test_report.map(OutcomePayload::TestReport),
            Phase::Review => self.review.map(OutcomePayload::ReviewReport),
            Phase::Commit => self.commit_message.map(OutcomePayload::CommitMessage),
            Phase::Deploy => self.deploy_record.map(OutcomePayload::DeployRecord),
        };
        PhaseOutcome {
            classification: self.classification,
            payload,
            feedback: self.feedback,
            cost_usd: self.cost_usd,
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
        }
    }
}

/// Scan captured output for the last structured outcome line.
pub(crate) fn parse_tail_outcome(output: &str) -> Option<WireOutcome> {
    output
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| {
            serde_json::from_str::<WireEnvelope>(line)
                .ok()
                .map(|env| env.outcome)
        })
}

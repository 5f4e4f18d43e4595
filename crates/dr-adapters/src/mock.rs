//! Scripted in-process adapter used by tests and the demo configuration.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use dr_core::types::{
    AdapterCapability, AdapterDescriptor, CostEstimate, CostModel, ExecutionModel, Phase,
    TaskContext,
};

use crate::adapter::{AdapterError, AgentAdapter, PhaseOutcome, Result};

/// Replays a queue of pre-canned outcomes and records every call it sees.
/// When the script runs dry it answers with a permanent failure, which
/// makes forgotten steps loud in tests.
pub struct ScriptedAdapter {
    descriptor: AdapterDescriptor,
    estimate: CostEstimate,
    script: Mutex<VecDeque<Result<PhaseOutcome>>>,
    calls: Mutex<Vec<(Phase, Option<String>)>>,
    refines: std::sync::atomic::AtomicU32,
}

impl ScriptedAdapter {
    /// An adapter declaring every capability.
    pub fn full(id: &str) -> Self {
        Self::with_capabilities(
            id,
            &[
                AdapterCapability::Plan,
                AdapterCapability::Propose,
                AdapterCapability::Refine,
                AdapterCapability::ApplyPatch,
                AdapterCapability::RunTests,
                AdapterCapability::SummarizeDiff,
                AdapterCapability::CommitMessage,
            ],
        )
    }

    pub fn with_capabilities(id: &str, capabilities: &[AdapterCapability]) -> Self {
        Self {
            descriptor: AdapterDescriptor {
                id: id.to_string(),
                capabilities: capabilities.iter().copied().collect(),
                execution: ExecutionModel::InProcess,
                default_profile: "default".into(),
                cost_model: CostModel {
                    usd_per_1k_in: 0.0,
                    usd_per_1k_out: 0.0,
                    flat_usd_per_call: 0.01,
                    est_wall_time_secs: 1,
                },
                version: 1,
                binary: None,
                args: vec![],
                endpoint: None,
            },
            estimate: CostEstimate {
                cost_usd: 0.01,
                wall_time_secs: 1,
            },
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            refines: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Override the pure cost estimate.
    pub fn with_estimate(mut self, estimate: CostEstimate) -> Self {
        self.estimate = estimate;
        self
    }

    /// Queue the next outcome (or error) to return.
    pub fn push(&self, outcome: Result<PhaseOutcome>) {
        self.script.lock().expect("script poisoned").push_back(outcome);
    }

    pub fn push_ok(&self, outcome: PhaseOutcome) {
        self.push(Ok(outcome));
    }

    /// Calls observed so far, as (phase, prior_feedback) pairs.
    pub fn calls(&self) -> Vec<(Phase, Option<String>)> {
        self.calls.lock().expect("calls poisoned").clone()
    }

    /// How many calls arrived through the `refine` entry point.
    pub fn refine_calls(&self) -> u32 {
        self.refines.load(std::sync::atomic::Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentAdapter for ScriptedAdapter {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    fn estimate_cost(&self, _phase: Phase, _context_digest: &str) -> CostEstimate {
        self.estimate
    }

    async fn propose(
        &self,
        phase: Phase,
        _ctx: &TaskContext,
        prior_feedback: Option<&str>,
    ) -> Result<PhaseOutcome> {
        self.calls
            .lock()
            .expect("calls poisoned")
            .push((phase, prior_feedback.map(|s| s.to_string())));
        self.script
            .lock()
            .expect("script poisoned")
            .pop_front()
            .unwrap_or_else(|| {
                Err(AdapterError::Permanent(format!(
                    "scripted adapter exhausted at phase {phase}"
                )))
            })
    }

    async fn refine(&self, phase: Phase, ctx: &TaskContext, feedback: &str) -> Result<PhaseOutcome> {
        self.refines
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.propose(phase, ctx, Some(feedback)).await
    }
}

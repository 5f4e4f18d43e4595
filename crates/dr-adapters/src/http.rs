//! Adapter for coding agents reached over an HTTP model API.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use dr_core::types::{AdapterDescriptor, CostEstimate, Phase, PolicyProfile, TaskContext};
use dr_policy::{Decision, PolicyGuard};

use crate::adapter::{AdapterError, AgentAdapter, PhaseOutcome, Result};
use crate::wire::WireOutcome;

/// Calls an HTTP agent endpoint with the task context and maps its JSON
/// response onto a `PhaseOutcome`.
///
/// Shell command patterns do not apply here; the egress and budget gates
/// still do. The target host is checked against the task profile's
/// egress allow-list on every call.
pub struct HttpAgentAdapter {
    descriptor: AdapterDescriptor,
    endpoint: String,
    host: String,
    client: reqwest::Client,
    guard: Arc<PolicyGuard>,
    profiles: HashMap<String, PolicyProfile>,
}

impl HttpAgentAdapter {
    pub fn new(
        descriptor: AdapterDescriptor,
        endpoint: impl Into<String>,
        guard: Arc<PolicyGuard>,
        profiles: Vec<PolicyProfile>,
        request_timeout: Duration,
    ) -> std::result::Result<Self, String> {
        let endpoint = endpoint.into();
        let host = host_of(&endpoint).ok_or_else(|| format!("endpoint has no host: {endpoint}"))?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| format!("http client build failed: {e}"))?;
        Ok(Self {
            descriptor,
            endpoint,
            host,
            client,
            guard,
            profiles: profiles.into_iter().map(|p| (p.name.clone(), p)).collect(),
        })
    }
}

#[async_trait]
impl AgentAdapter for HttpAgentAdapter {
    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    fn estimate_cost(&self, phase: Phase, _context_digest: &str) -> CostEstimate {
        let (tokens_in, tokens_out) = match phase {
            Phase::Plan => (3_000, 1_000),
            Phase::Code => (6_000, 3_000),
            Phase::Test => (1_500, 400),
            Phase::Review => (4_000, 800),
            Phase::Commit => (800, 150),
            Phase::Deploy => (400, 150),
        };
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
            .ok_or_else(|| AdapterError::Permanent(format!("unknown profile `{}`", ctx.profile)))?;

        let decision = self
            .guard
            .check_egress(profile, &ctx.task_id, &self.host)
            .map_err(|e| AdapterError::Transient(format!("policy gate unavailable: {e}")))?;
        if let Decision::Deny { reason } = decision {
            warn!(task_id = %ctx.task_id, host = %self.host, %reason, "egress denied");
            return Ok(PhaseOutcome::needs_refine(format!(
                "egress denied: {reason}"
            )));
        }

        let body = json!({
            "phase": phase,
            "goal": ctx.goal,
            "commit_sha": ctx.commit_sha,
            "acceptance": ctx.acceptance_summary,
            "prior_feedback": prior_feedback,
            "workspace": ctx.workspace_root,
        });

        debug!(task_id = %ctx.task_id, %phase, endpoint = %self.endpoint, "calling http agent");
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AdapterError::Transient("http agent timed out".into())
                } else {
                    AdapterError::Transient(format!("http error: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AdapterError::Transient(format!(
                "http agent returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(AdapterError::Permanent(format!(
                "http agent returned {status}"
            )));
        }

        let wire: WireOutcome = response
            .json()
            .await
            .map_err(|e| AdapterError::Permanent(format!("unparseable agent response: {e}")))?;
        Ok(wire.into_phase_outcome(phase, Uuid::new_v4()))
    }
}

/// Extract the host portion of an http(s) URL without a full URL parser.
fn host_of(endpoint: &str) -> Option<String> {
    let rest = endpoint
        .strip_prefix("https://")
        .or_else(|| endpoint.strip_prefix("http://"))?;
    let authority = rest.split(['/', '?']).next()?;
    let host = authority.split('@').last()?.split(':').next()?;
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

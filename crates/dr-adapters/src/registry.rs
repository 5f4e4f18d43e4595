use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use dr_core::types::{AdapterCapability, Phase, RouteRule, TaskMode};

use crate::adapter::AgentAdapter;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("duplicate adapter id: `{0}`")]
    Duplicate(String),
    #[error("adapter not found: `{0}`")]
    NotFound(String),
    #[error("no adapter routes {mode:?}/{phase}")]
    NoRoute { mode: TaskMode, phase: Phase },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

// ---------------------------------------------------------------------------
// AdapterRegistry
// ---------------------------------------------------------------------------

/// Typed registry of adapters plus the static routing table.
///
/// Adapters register once at startup; afterwards the registry is consulted
/// read-only. Routing is a (mode, phase) lookup: the rule's primary
/// adapter wins when it is registered and carries the phase's required
/// capability, otherwise the fallback chain is walked in order.
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn AgentAdapter>>,
    routes: Vec<RouteRule>,
}

impl AdapterRegistry {
    pub fn new(routes: Vec<RouteRule>) -> Self {
        Self {
            adapters: HashMap::new(),
            routes,
        }
    }

    pub fn register(&mut self, adapter: Arc<dyn AgentAdapter>) -> Result<()> {
        let id = adapter.id().to_string();
        if self.adapters.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        info!(adapter = %id, capabilities = ?adapter.descriptor().capabilities, "adapter registered");
        self.adapters.insert(id, adapter);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn AgentAdapter>> {
        self.adapters
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Resolve the adapter that drives `phase` for tasks in `mode`.
    pub fn route(&self, mode: TaskMode, phase: Phase) -> Result<Arc<dyn AgentAdapter>> {
        let needed = required_capability(phase);
        if let Some(rule) = self
            .routes
            .iter()
            .find(|r| r.mode == mode && r.phase == phase)
        {
            for candidate in std::iter::once(&rule.adapter).chain(rule.fallback.iter()) {
                if let Some(adapter) = self.adapters.get(candidate) {
                    if adapter.descriptor().capabilities.contains(&needed) {
                        debug!(adapter = %candidate, ?mode, %phase, "routed");
                        return Ok(Arc::clone(adapter));
                    }
                }
            }
        }
        // No rule (or no routed adapter qualifies): any capable adapter,
        // in deterministic id order.
        let mut ids: Vec<&String> = self.adapters.keys().collect();
        ids.sort();
        for id in ids {
            let adapter = &self.adapters[id];
            if adapter.descriptor().capabilities.contains(&needed) {
                debug!(adapter = %id, ?mode, %phase, "routed by capability fallback");
                return Ok(Arc::clone(adapter));
            }
        }
        Err(RegistryError::NoRoute { mode, phase })
    }

    /// True when every adapter-driven phase a task in `mode` can reach has
    /// an adapter. TESTING is driven by acceptance predicates, not an
    /// adapter, so it is not required here.
    pub fn covers(&self, mode: TaskMode, deploy: bool) -> bool {
        let mut phases = vec![Phase::Plan, Phase::Code, Phase::Review, Phase::Commit];
        if deploy {
            phases.push(Phase::Deploy);
        }
        phases.iter().all(|p| self.route(mode, *p).is_ok())
    }
}

/// The capability a phase's driving adapter must declare.
///
/// `refine` and `summarize_diff` are not routing concerns: the driver
/// consults them directly when picking the retry entry point and when
/// carrying a review summary onto the commit record.
pub fn required_capability(phase: Phase) -> AdapterCapability {
    match phase {
        Phase::Plan => AdapterCapability::Plan,
        Phase::Code => AdapterCapability::Propose,
        Phase::Test => AdapterCapability::RunTests,
        Phase::Review => AdapterCapability::Propose,
        Phase::Commit => AdapterCapability::CommitMessage,
        Phase::Deploy => AdapterCapability::ApplyPatch,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

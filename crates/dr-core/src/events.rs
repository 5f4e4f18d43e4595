use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::TaskState;

// ---------------------------------------------------------------------------
// Overlay events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    Stdout,
    Stderr,
    Meta,
}

/// One chunk of captured PTY output, or a structured META record.
///
/// Per task, `seq` is gap-free starting at 0 and matches production order.
/// Payload bytes are opaque; ANSI escapes pass through and chunk boundaries
/// carry no semantic meaning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEvent {
    pub task_id: String,
    pub seq: u64,
    /// Nanoseconds since the Unix epoch.
    pub ts_ns: i64,
    pub stream: StreamKind,
    pub payload: Vec<u8>,
}

impl OverlayEvent {
    pub fn now_ts_ns() -> i64 {
        Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros() * 1000)
    }
}

/// Discriminated payload carried on the META stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaKind {
    ProcessStart,
    ProcessExit,
    PolicyDecision,
    BudgetWarning,
    PhaseTransition,
    Cancelled,
    SlowConsumer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub kind: MetaKind,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl MetaRecord {
    pub fn new(kind: MetaKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            exit_code: None,
            data: serde_json::Value::Null,
        }
    }

    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("meta record serializes")
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }
}

// ---------------------------------------------------------------------------
// Audit entries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    TaskCreated,
    Transition,
    PhaseRun,
    PolicyDecision,
    BudgetWarning,
    Metric,
    Internal,
}

/// One append-only audit record. Never mutated after append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub task_id: String,
    /// Per-task sequence assigned by the store at append time.
    #[serde(default)]
    pub seq: u64,
    pub kind: AuditKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_state: Option<TaskState>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub payload: serde_json::Value,
    pub ts: DateTime<Utc>,
    /// Links to the PhaseRun or OverlayEvent that caused this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation: Option<String>,
}

impl AuditEntry {
    pub fn new(task_id: impl Into<String>, kind: AuditKind) -> Self {
        Self {
            task_id: task_id.into(),
            seq: 0,
            kind,
            prior_state: None,
            next_state: None,
            payload: serde_json::Value::Null,
            ts: Utc::now(),
            causation: None,
        }
    }

    pub fn transition(
        task_id: impl Into<String>,
        prior: TaskState,
        next: TaskState,
    ) -> Self {
        let mut entry = Self::new(task_id, AuditKind::Transition);
        entry.prior_state = Some(prior);
        entry.next_state = Some(next);
        entry
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_causation(mut self, causation: impl Into<String>) -> Self {
        self.causation = Some(causation.into());
        self
    }
}

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::types::{AdapterDescriptor, PolicyProfile, RouteRule};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

/// Top-level configuration loaded from `~/.drover/config.toml`.
///
/// Policy profiles, adapter descriptors, and the routing table are part of
/// the configuration; each carries a version tag, and tasks bind to the
/// versions in force at submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub overlay: OverlayConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub profiles: Vec<PolicyProfile>,
    #[serde(default)]
    pub adapters: Vec<AdapterDescriptor>,
    #[serde(default)]
    pub routing: Vec<RouteRule>,
    #[serde(default)]
    pub predicates: Vec<PredicateSpec>,
}

/// One acceptance predicate backed by a command run in the workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredicateSpec {
    pub name: String,
    pub argv: Vec<String>,
    #[serde(default = "default_predicate_wait")]
    pub wait_secs: u64,
}

fn default_predicate_wait() -> u64 {
    300
}

impl Config {
    /// Load from `~/.drover/config.toml`, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".drover")
            .join("config.toml")
    }

    pub fn profile(&self, name: &str) -> Option<&PolicyProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Simultaneously RUNNING task ceiling.
    pub max_concurrent: u32,
    /// Ephemeral root for per-task workspaces.
    pub workspace_root: PathBuf,
    /// How long a terminal task's workspace is retained for post-mortems.
    pub retention_grace_secs: u64,
    pub plan_max_attempts: u32,
    /// Per-phase wall clock around adapter calls.
    pub phase_timeout_secs: u64,
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    pub retry_max_attempts: u32,
    /// When true, budget exhaustion suspends the task for operator top-up
    /// instead of failing it.
    pub suspend_on_budget: bool,
    /// Grace given to a cancelled task before its sandbox is hard-killed.
    pub cancel_grace_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            workspace_root: std::env::temp_dir().join("drover-work"),
            retention_grace_secs: 3600,
            plan_max_attempts: 2,
            phase_timeout_secs: 900,
            retry_base_ms: 500,
            retry_cap_ms: 30_000,
            retry_max_attempts: 3,
            suspend_on_budget: false,
            cancel_grace_secs: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Directory holding the per-task append-only logs.
    pub dir: PathBuf,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            dir: dirs::data_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("drover")
                .join("audit"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Events retained in the live replay window per task.
    pub live_window: usize,
    /// Per-subscriber backlog before forced disconnection.
    pub subscriber_backlog: usize,
    /// Upper bound on a single published chunk.
    pub chunk_bytes: usize,
    /// Maximum delay before a partial chunk is flushed.
    pub flush_interval_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            live_window: 1024,
            subscriber_backlog: 256,
            chunk_bytes: 8 * 1024,
            flush_interval_ms: 5,
        }
    }
}

/// Resource caps applied to one sandboxed process.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SandboxCaps {
    pub wall_secs: u64,
    pub cpu_secs: u64,
    pub max_rss_bytes: u64,
    pub max_output_bytes: u64,
    pub max_open_files: u64,
    pub disk_quota_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub low: SandboxCaps,
    pub medium: SandboxCaps,
    pub high: SandboxCaps,
    /// Environment variables passed through to sandboxed processes.
    pub env_allow: Vec<String>,
}

impl SandboxConfig {
    pub fn caps_for(&self, tier: crate::types::SandboxTier) -> SandboxCaps {
        match tier {
            crate::types::SandboxTier::Low => self.low,
            crate::types::SandboxTier::Medium => self.medium,
            crate::types::SandboxTier::High => self.high,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let base = SandboxCaps {
            wall_secs: 600,
            cpu_secs: 300,
            max_rss_bytes: 2 * 1024 * 1024 * 1024,
            max_output_bytes: 64 * 1024 * 1024,
            max_open_files: 1024,
            disk_quota_bytes: 4 * 1024 * 1024 * 1024,
        };
        Self {
            low: base,
            medium: SandboxCaps {
                wall_secs: 300,
                max_output_bytes: 32 * 1024 * 1024,
                ..base
            },
            high: SandboxCaps {
                wall_secs: 120,
                cpu_secs: 60,
                max_rss_bytes: 1024 * 1024 * 1024,
                max_output_bytes: 16 * 1024 * 1024,
                max_open_files: 256,
                disk_quota_bytes: 1024 * 1024 * 1024,
            },
            env_allow: vec![
                "PATH".into(),
                "HOME".into(),
                "LANG".into(),
                "LC_ALL".into(),
                "TERM".into(),
                "TZ".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetConfig {
    /// Safety multiplier applied to projected adapter costs.
    pub safety_multiplier: f64,
    /// Fraction of the cost budget at which a budget_warning is emitted.
    pub warn_fraction: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            safety_multiplier: 1.2,
            warn_fraction: 0.8,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

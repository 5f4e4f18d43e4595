use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::{BlobRef, PatchSet, RepoRef};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("git command failed: {0}")]
    GitCommand(String),
    #[error("workspace already exists for task: {0}")]
    AlreadyExists(String),
    #[error("workspace not found for task: {0}")]
    NotFound(String),
    #[error("patch precondition mismatch: patch built against {expected}, workspace head is {actual}")]
    PreconditionMismatch { expected: String, actual: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, WorkspaceError>;

// ---------------------------------------------------------------------------
// GitRunner trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over git CLI operations so they can be mocked in tests.
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Real git runner that shells out to the `git` binary.
pub struct SystemGit;

impl GitRunner for SystemGit {
    fn run_git(&self, dir: &Path, args: &[&str]) -> std::result::Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;

        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Workspace
// ---------------------------------------------------------------------------

/// One task's ephemeral working directory, seeded from the repo at the
/// bound commit. Lives until the retention grace window after the task
/// reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub task_id: String,
    pub path: PathBuf,
    pub bound_sha: String,
}

// ---------------------------------------------------------------------------
// WorkspaceManager
// ---------------------------------------------------------------------------

/// Allocates, seeds, and retires per-task workspaces under an ephemeral
/// root, and exports surviving artifacts as content-addressed blobs.
pub struct WorkspaceManager {
    root: PathBuf,
    git: Box<dyn GitRunner>,
    retention_grace_secs: u64,
    /// Terminal timestamps for retired workspaces awaiting sweep.
    retired: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>, retention_grace_secs: u64) -> Self {
        Self::with_git_runner(root, retention_grace_secs, Box::new(SystemGit))
    }

    /// Construct with a custom git runner (used by tests).
    pub fn with_git_runner(
        root: impl Into<PathBuf>,
        retention_grace_secs: u64,
        git: Box<dyn GitRunner>,
    ) -> Self {
        Self {
            root: root.into(),
            git,
            retention_grace_secs,
            retired: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.root.join("tasks").join(task_id)
    }

    fn blob_dir(&self) -> PathBuf {
        self.root.join("blobs")
    }

    /// Materialize a fresh workspace for `task_id`, seeded from the repo at
    /// the bound commit.
    pub fn allocate(&self, task_id: &str, repo: &RepoRef) -> Result<Workspace> {
        let path = self.task_dir(task_id);
        if path.exists() {
            return Err(WorkspaceError::AlreadyExists(task_id.to_string()));
        }
        std::fs::create_dir_all(&path)?;

        info!(
            task_id,
            workspace = %path.display(),
            commit = %repo.commit_sha,
            "seeding workspace"
        );

        self.git_ok(&path, &["clone", "--branch", &repo.branch, &repo.url, "."])?;
        let bound_sha = if repo.commit_sha.is_empty() {
            // No pin requested: bind to whatever the branch head resolved to.
            let out = self.git_ok(&path, &["rev-parse", "HEAD"])?;
            out.stdout.trim().to_string()
        } else {
            self.git_ok(&path, &["checkout", "--detach", &repo.commit_sha])?;
            repo.commit_sha.clone()
        };

        Ok(Workspace {
            task_id: task_id.to_string(),
            path,
            bound_sha,
        })
    }

    /// Allocate, replacing any directory left behind by a previous
    /// process (crash recovery re-seeds from the bound commit).
    pub fn reallocate(&self, task_id: &str, repo: &RepoRef) -> Result<Workspace> {
        let path = self.task_dir(task_id);
        if path.exists() {
            warn!(task_id, "removing stale workspace before reallocation");
            std::fs::remove_dir_all(&path)?;
        }
        self.allocate(task_id, repo)
    }

    /// Current HEAD of a workspace.
    pub fn head_sha(&self, ws: &Workspace) -> Result<String> {
        let out = self.git_ok(&ws.path, &["rev-parse", "HEAD"])?;
        Ok(out.stdout.trim().to_string())
    }

    /// Apply a patch set to the workspace.
    ///
    /// Fails with `PreconditionMismatch` when the workspace head has moved
    /// since the patch was computed; the caller refreshes the bound sha and
    /// asks the adapter to refine.
    pub fn apply_patchset(&self, ws: &Workspace, patch: &PatchSet) -> Result<()> {
        let head = self.head_sha(ws)?;
        if head != patch.precondition_sha {
            return Err(WorkspaceError::PreconditionMismatch {
                expected: patch.precondition_sha.clone(),
                actual: head,
            });
        }

        for (idx, edit) in patch.edits.iter().enumerate() {
            let diff_path = ws.path.join(format!(".drover-patch-{idx}.diff"));
            std::fs::write(&diff_path, &edit.diff)?;
            let diff_str = diff_path.to_string_lossy().into_owned();
            let applied = self.git_ok(&ws.path, &["apply", "--whitespace=nowarn", &diff_str]);
            std::fs::remove_file(&diff_path).ok();
            applied?;
            debug!(task_id = %ws.task_id, path = %edit.path.display(), "edit applied");
        }
        Ok(())
    }

    /// Export bytes into the content-addressed blob store.
    pub fn export_blob(&self, bytes: &[u8]) -> Result<BlobRef> {
        let sha256 = hex_digest(bytes);
        let dir = self.blob_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(&sha256);
        if !path.exists() {
            let mut file = std::fs::File::create(&path)?;
            file.write_all(bytes)?;
            file.sync_data()?;
        }
        Ok(BlobRef {
            sha256,
            len: bytes.len() as u64,
        })
    }

    /// Read a previously exported blob back.
    pub fn read_blob(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        Ok(std::fs::read(self.blob_dir().join(&blob.sha256))?)
    }

    /// Mark a workspace as retired; it stays on disk for the grace window
    /// so operators can inspect failed tasks.
    pub fn retire(&self, task_id: &str) {
        let mut retired = self.retired.lock().expect("retired lock poisoned");
        retired.insert(task_id.to_string(), Utc::now());
        debug!(task_id, "workspace retired, awaiting sweep");
    }

    /// Remove retired workspaces whose grace window has elapsed. Returns
    /// the task ids that were removed.
    pub fn sweep(&self) -> Vec<String> {
        let now = Utc::now();
        let mut removed = Vec::new();
        let mut retired = self.retired.lock().expect("retired lock poisoned");
        retired.retain(|task_id, retired_at| {
            let elapsed = (now - *retired_at).num_seconds().max(0) as u64;
            if elapsed < self.retention_grace_secs {
                return true;
            }
            let dir = self.root.join("tasks").join(task_id.as_str());
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => info!(task_id, "workspace removed after grace window"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(task_id, error = %e, "failed to remove workspace"),
            }
            removed.push(task_id.clone());
            false
        });
        removed
    }

    fn git_ok(&self, dir: &Path, args: &[&str]) -> Result<GitOutput> {
        let out = self
            .git
            .run_git(dir, args)
            .map_err(WorkspaceError::GitCommand)?;
        if !out.success {
            return Err(WorkspaceError::GitCommand(format!(
                "git {} failed: {}",
                args.join(" "),
                out.stderr.trim()
            )));
        }
        Ok(out)
    }
}

/// Hex-encoded SHA-256 of `bytes`.
pub fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use dr_core::config::{OverlayConfig, SandboxCaps, SandboxConfig};
use dr_core::events::{MetaKind, MetaRecord, StreamKind};
use dr_core::types::PolicyProfile;
use dr_overlay::OverlayBroker;
use dr_policy::{Decision, PolicyGuard};

use crate::launcher::{LaunchedProcess, PtyLauncher};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("spawn failed: {0}")]
    Spawn(String),
    #[error("policy gate unavailable: {0}")]
    Policy(#[from] dr_policy::PolicyError),
    #[error("overlay error: {0}")]
    Overlay(#[from] dr_overlay::OverlayError),
    #[error("wait timed out after {0:?}")]
    WaitTimeout(Duration),
    #[error("outcome already taken")]
    OutcomeTaken,
}

pub type Result<T> = std::result::Result<T, SandboxError>;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Normal,
    Timeout,
    KilledOverRss,
    OutputExceeded,
    Cancelled,
    Crashed,
    PolicyBlocked,
}

/// Structured result of a sandboxed run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub exit_code: Option<i32>,
    pub signaled: bool,
    pub duration: Duration,
    pub max_rss: u64,
    pub output_bytes: u64,
    pub truncated: bool,
    pub exit_reason: ExitReason,
}

// ---------------------------------------------------------------------------
// SandboxCtx
// ---------------------------------------------------------------------------

/// Per-run context: whose task this is, where it may run, and under which
/// policy profile.
#[derive(Debug, Clone)]
pub struct SandboxCtx {
    pub task_id: String,
    pub workspace: PathBuf,
    pub profile: PolicyProfile,
    /// Task-injected variables layered over the environment allow-list.
    pub extra_env: Vec<(String, String)>,
}

// ---------------------------------------------------------------------------
// RunHandle
// ---------------------------------------------------------------------------

enum HandleState {
    /// The run was denied before spawn; the outcome is already known.
    Finished(Outcome),
    /// The run is live; the pump task will deliver the outcome.
    Live {
        outcome_rx: oneshot::Receiver<Outcome>,
        cancel_tx: mpsc::Sender<Duration>,
    },
    Taken,
}

/// Handle onto one sandboxed run.
pub struct RunHandle {
    pub task_id: String,
    state: HandleState,
}

impl RunHandle {
    /// Wait for the process to finish, up to `timeout`.
    ///
    /// On timeout the handle stays live so the caller can cancel and wait
    /// again.
    pub async fn wait(&mut self, timeout: Duration) -> Result<Outcome> {
        match std::mem::replace(&mut self.state, HandleState::Taken) {
            HandleState::Finished(outcome) => Ok(outcome),
            HandleState::Live {
                mut outcome_rx,
                cancel_tx,
            } => match tokio::time::timeout(timeout, &mut outcome_rx).await {
                Ok(Ok(outcome)) => Ok(outcome),
                Ok(Err(_)) => Ok(Outcome {
                    exit_code: None,
                    signaled: false,
                    duration: Duration::ZERO,
                    max_rss: 0,
                    output_bytes: 0,
                    truncated: false,
                    exit_reason: ExitReason::Crashed,
                }),
                Err(_) => {
                    self.state = HandleState::Live {
                        outcome_rx,
                        cancel_tx,
                    };
                    Err(SandboxError::WaitTimeout(timeout))
                }
            },
            HandleState::Taken => Err(SandboxError::OutcomeTaken),
        }
    }

    /// Request termination: soft stop first, hard kill after `grace`.
    pub async fn cancel(&self, grace: Duration) {
        if let HandleState::Live { cancel_tx, .. } = &self.state {
            let _ = cancel_tx.send(grace).await;
        }
    }
}

/// Outcome of a run that was denied by policy and never spawned.
fn denied_outcome() -> Outcome {
    Outcome {
        exit_code: None,
        signaled: false,
        duration: Duration::ZERO,
        max_rss: 0,
        output_bytes: 0,
        truncated: false,
        exit_reason: ExitReason::PolicyBlocked,
    }
}

// ---------------------------------------------------------------------------
// SandboxRunner
// ---------------------------------------------------------------------------

/// Spawns external processes attached to a PTY inside a task workspace,
/// streams their output into the overlay broker, and enforces the
/// resource caps of the task's sandbox tier.
pub struct SandboxRunner {
    launcher: Arc<dyn PtyLauncher>,
    broker: Arc<OverlayBroker>,
    guard: Arc<PolicyGuard>,
    sandbox_cfg: SandboxConfig,
    overlay_cfg: OverlayConfig,
    /// Cancel handles for in-flight runs, keyed by task id.
    active: Arc<std::sync::Mutex<std::collections::HashMap<String, Vec<mpsc::Sender<Duration>>>>>,
}

impl SandboxRunner {
    pub fn new(
        launcher: Arc<dyn PtyLauncher>,
        broker: Arc<OverlayBroker>,
        guard: Arc<PolicyGuard>,
        sandbox_cfg: SandboxConfig,
        overlay_cfg: OverlayConfig,
    ) -> Self {
        Self {
            launcher,
            broker,
            guard,
            sandbox_cfg,
            overlay_cfg,
            active: Arc::new(std::sync::Mutex::new(std::collections::HashMap::new())),
        }
    }

    /// Terminate every in-flight run for a task: soft stop, hard kill
    /// after `grace`. Used by task cancellation.
    pub async fn cancel_task(&self, task_id: &str, grace: Duration) {
        let senders = {
            let active = self.active.lock().expect("active runs poisoned");
            active.get(task_id).cloned().unwrap_or_default()
        };
        for tx in senders {
            let _ = tx.send(grace).await;
        }
    }

    /// Run `argv` in the task's workspace.
    ///
    /// The command gate is consulted before spawn; a denial produces a
    /// handle whose outcome is already `PolicyBlocked`, with the denial
    /// mirrored onto the task's STDERR overlay stream.
    pub async fn run(
        &self,
        ctx: &SandboxCtx,
        argv: &[String],
        stdin_script: Option<&[u8]>,
    ) -> Result<RunHandle> {
        let decision = self.guard.check_command(&ctx.profile, &ctx.task_id, argv)?;
        if let Decision::Deny { reason } = decision {
            warn!(task_id = %ctx.task_id, %reason, "command blocked before spawn");
            self.broker.publish(
                &ctx.task_id,
                StreamKind::Stderr,
                format!("policy denied: {reason}\r\n").into_bytes(),
            )?;
            self.broker.publish_meta(
                &ctx.task_id,
                MetaRecord::new(MetaKind::PolicyDecision, reason)
                    .with_data(serde_json::json!({ "argv": argv, "allow": false })),
            )?;
            return Ok(RunHandle {
                task_id: ctx.task_id.clone(),
                state: HandleState::Finished(denied_outcome()),
            });
        }

        let caps = self.sandbox_cfg.caps_for(ctx.profile.sandbox_tier);
        let env = self.filtered_env(ctx);
        let process = self
            .launcher
            .launch(&ctx.workspace, argv, &env)
            .map_err(SandboxError::Spawn)?;

        info!(
            task_id = %ctx.task_id,
            command = %argv.join(" "),
            pid = process.control.pid(),
            tier = ?ctx.profile.sandbox_tier,
            "sandboxed process started"
        );
        self.broker.publish_meta(
            &ctx.task_id,
            MetaRecord::new(MetaKind::ProcessStart, argv.join(" ")).with_data(
                serde_json::json!({ "pid": process.control.pid(), "argv": argv }),
            ),
        )?;

        if let Some(script) = stdin_script {
            let _ = process.writer.send(script.to_vec());
            // EOT so line-oriented tools see end of input on the PTY.
            let _ = process.writer.send(vec![0x04]);
        }

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = mpsc::channel(1);

        {
            let mut active = self.active.lock().expect("active runs poisoned");
            active
                .entry(ctx.task_id.clone())
                .or_default()
                .push(cancel_tx.clone());
        }

        let pump = Pump {
            broker: Arc::clone(&self.broker),
            task_id: ctx.task_id.clone(),
            caps,
            chunk_bytes: self.overlay_cfg.chunk_bytes,
            active: Arc::clone(&self.active),
        };
        tokio::spawn(pump.run(process, cancel_rx, outcome_tx));

        Ok(RunHandle {
            task_id: ctx.task_id.clone(),
            state: HandleState::Live {
                outcome_rx,
                cancel_tx,
            },
        })
    }

    /// Allow-listed process environment plus task-injected variables.
    fn filtered_env(&self, ctx: &SandboxCtx) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = std::env::vars()
            .filter(|(key, _)| self.sandbox_cfg.env_allow.iter().any(|allowed| allowed == key))
            .collect();
        env.extend(ctx.extra_env.iter().cloned());
        env
    }
}

// ---------------------------------------------------------------------------
// Pump — per-run supervision task
// ---------------------------------------------------------------------------

struct Pump {
    broker: Arc<OverlayBroker>,
    task_id: String,
    caps: SandboxCaps,
    chunk_bytes: usize,
    active: Arc<std::sync::Mutex<std::collections::HashMap<String, Vec<mpsc::Sender<Duration>>>>>,
}

impl Pump {
    async fn run(
        self,
        process: LaunchedProcess,
        mut cancel_rx: mpsc::Receiver<Duration>,
        outcome_tx: oneshot::Sender<Outcome>,
    ) {
        let started = Instant::now();
        let deadline = started + Duration::from_secs(self.caps.wall_secs);
        let mut rss_timer = tokio::time::interval(Duration::from_millis(500));
        rss_timer.tick().await;

        let mut output_bytes: u64 = 0;
        let mut max_rss: u64 = 0;
        let mut truncated = false;
        let mut reason = ExitReason::Normal;

        loop {
            tokio::select! {
                chunk = process.reader.recv_async() => match chunk {
                    Ok(bytes) => {
                        if truncated {
                            continue;
                        }
                        output_bytes += bytes.len() as u64;
                        self.publish_chunks(&bytes);
                        if output_bytes > self.caps.max_output_bytes {
                            warn!(task_id = %self.task_id, output_bytes, "output cap exceeded");
                            truncated = true;
                            reason = ExitReason::OutputExceeded;
                            process.control.kill();
                        }
                    }
                    // EOF: the process closed its side of the PTY.
                    Err(_) => break,
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    warn!(task_id = %self.task_id, wall_secs = self.caps.wall_secs, "wall clock cap exceeded");
                    reason = ExitReason::Timeout;
                    process.control.kill();
                    break;
                }
                _ = rss_timer.tick() => {
                    if let Some(rss) = process.control.pid().and_then(read_rss_bytes) {
                        max_rss = max_rss.max(rss);
                        if rss > self.caps.max_rss_bytes {
                            warn!(task_id = %self.task_id, rss, "rss cap exceeded");
                            reason = ExitReason::KilledOverRss;
                            process.control.kill();
                            break;
                        }
                    }
                }
                Some(grace) = cancel_rx.recv() => {
                    debug!(task_id = %self.task_id, ?grace, "cancel requested, sending soft stop");
                    // ETX over the PTY is the soft stop; the hard kill
                    // follows after the grace window.
                    let _ = process.writer.send(vec![0x03]);
                    tokio::time::sleep(grace).await;
                    reason = ExitReason::Cancelled;
                    process.control.kill();
                    break;
                }
            }
        }

        // Drain whatever the reader still buffered.
        while let Ok(bytes) = process.reader.try_recv() {
            if !truncated {
                output_bytes += bytes.len() as u64;
                self.publish_chunks(&bytes);
            }
        }

        let exit = wait_for_exit(&process, Duration::from_secs(2)).await;
        let (exit_code, signaled) = match exit {
            Some(exit) => (Some(exit.code), exit.signaled),
            None => (None, true),
        };
        if reason == ExitReason::Normal {
            match exit_code {
                Some(0) => {}
                Some(_) if signaled => reason = ExitReason::Crashed,
                Some(_) => {}
                None => reason = ExitReason::Crashed,
            }
        }

        let outcome = Outcome {
            exit_code,
            signaled,
            duration: started.elapsed(),
            max_rss,
            output_bytes,
            truncated,
            exit_reason: reason,
        };

        let mut record = MetaRecord::new(MetaKind::ProcessExit, format!("exit_reason={reason:?}"))
            .with_data(serde_json::json!({
                "duration_ms": outcome.duration.as_millis() as u64,
                "output_bytes": outcome.output_bytes,
                "truncated": outcome.truncated,
            }));
        if let Some(code) = exit_code {
            record = record.with_exit_code(code);
        }
        if let Err(e) = self.broker.publish_meta(&self.task_id, record) {
            warn!(task_id = %self.task_id, error = %e, "failed to publish process_exit");
        }

        info!(
            task_id = %self.task_id,
            ?outcome.exit_reason,
            exit_code = ?outcome.exit_code,
            output_bytes = outcome.output_bytes,
            "sandboxed process finished"
        );

        // Closing our receiver marks the registered cancel sender dead so
        // the cleanup below can prune it.
        drop(cancel_rx);
        {
            let mut active = self.active.lock().expect("active runs poisoned");
            if let Some(senders) = active.get_mut(&self.task_id) {
                senders.retain(|tx| !tx.is_closed());
                if senders.is_empty() {
                    active.remove(&self.task_id);
                }
            }
        }
        let _ = outcome_tx.send(outcome);
    }

    fn publish_chunks(&self, bytes: &[u8]) {
        for chunk in bytes.chunks(self.chunk_bytes) {
            if let Err(e) = self
                .broker
                .publish(&self.task_id, StreamKind::Stdout, chunk.to_vec())
            {
                debug!(task_id = %self.task_id, error = %e, "overlay publish failed");
            }
        }
    }
}

/// Poll for the exit status with a bounded wait.
async fn wait_for_exit(
    process: &LaunchedProcess,
    max_wait: Duration,
) -> Option<crate::launcher::ProcessExit> {
    let deadline = Instant::now() + max_wait;
    loop {
        if let Some(exit) = process.control.try_wait() {
            return Some(exit);
        }
        if Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Resident set size of a process, where the platform exposes it.
#[cfg(target_os = "linux")]
fn read_rss_bytes(pid: u32) -> Option<u64> {
    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[cfg(not(target_os = "linux"))]
fn read_rss_bytes(_pid: u32) -> Option<u64> {
    None
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::{ProcessControl, ProcessExit};
    use dr_audit::AuditStore;
    use dr_core::events::StreamKind;
    use dr_core::types::SandboxTier;
    use dr_overlay::SubscribeFrom;
    use std::path::Path;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    // -- Mock launcher --

    struct MockControl {
        killed: AtomicBool,
        exit_code: i32,
        /// `try_wait` reports exit only once the reader channel has closed
        /// or the process has been killed.
        reader_done: Arc<AtomicBool>,
    }

    impl ProcessControl for MockControl {
        fn pid(&self) -> Option<u32> {
            None
        }

        fn try_wait(&self) -> Option<ProcessExit> {
            if self.killed.load(Ordering::SeqCst) {
                return Some(ProcessExit {
                    code: -1,
                    signaled: true,
                });
            }
            if self.reader_done.load(Ordering::SeqCst) {
                Some(ProcessExit {
                    code: self.exit_code,
                    signaled: false,
                })
            } else {
                None
            }
        }

        fn kill(&self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    /// Scripted launcher: emits canned chunks, then optionally hangs until
    /// killed instead of closing the reader.
    struct MockLauncher {
        chunks: Vec<Vec<u8>>,
        exit_code: i32,
        hang_after_output: bool,
        _write_rxs: Mutex<Vec<flume::Receiver<Vec<u8>>>>,
    }

    impl MockLauncher {
        fn new(chunks: Vec<Vec<u8>>, exit_code: i32) -> Self {
            Self {
                chunks,
                exit_code,
                hang_after_output: false,
                _write_rxs: Mutex::new(Vec::new()),
            }
        }

        fn hanging(chunks: Vec<Vec<u8>>) -> Self {
            Self {
                chunks,
                exit_code: 0,
                hang_after_output: true,
                _write_rxs: Mutex::new(Vec::new()),
            }
        }
    }

    impl PtyLauncher for MockLauncher {
        fn launch(
            &self,
            _cwd: &Path,
            _argv: &[String],
            _env: &[(String, String)],
        ) -> std::result::Result<LaunchedProcess, String> {
            let (read_tx, read_rx) = flume::unbounded();
            let (write_tx, write_rx) = flume::bounded(256);
            let reader_done = Arc::new(AtomicBool::new(false));

            for chunk in &self.chunks {
                let _ = read_tx.send(chunk.clone());
            }

            let control = Arc::new(MockControl {
                killed: AtomicBool::new(false),
                exit_code: self.exit_code,
                reader_done: Arc::clone(&reader_done),
            });

            if self.hang_after_output {
                // Keep the reader open until the control is killed.
                let control_for_thread = Arc::clone(&control);
                let done = Arc::clone(&reader_done);
                std::thread::spawn(move || {
                    while !control_for_thread.killed.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    done.store(true, Ordering::SeqCst);
                    drop(read_tx);
                });
                self._write_rxs.lock().unwrap().push(write_rx);
            } else {
                reader_done.store(true, Ordering::SeqCst);
                drop(read_tx);
                self._write_rxs.lock().unwrap().push(write_rx);
            }

            Ok(LaunchedProcess {
                id: uuid::Uuid::new_v4(),
                reader: read_rx,
                writer: write_tx,
                control,
            })
        }
    }

    fn fixture(launcher: Arc<dyn PtyLauncher>) -> (tempfile::TempDir, Arc<OverlayBroker>, SandboxRunner) {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(AuditStore::open(tmp.path()).unwrap());
        let broker = Arc::new(OverlayBroker::new(
            Arc::clone(&store),
            OverlayConfig::default(),
        ));
        let guard = Arc::new(PolicyGuard::new(store, 1.2));
        let runner = SandboxRunner::new(
            launcher,
            Arc::clone(&broker),
            guard,
            SandboxConfig::default(),
            OverlayConfig::default(),
        );
        (tmp, broker, runner)
    }

    fn ctx(tmp: &tempfile::TempDir, allow: &[&str]) -> SandboxCtx {
        SandboxCtx {
            task_id: "t1".into(),
            workspace: tmp.path().to_path_buf(),
            profile: PolicyProfile {
                name: "test".into(),
                version: 1,
                command_allow: allow.iter().map(|s| s.to_string()).collect(),
                write_scopes: vec![tmp.path().to_path_buf()],
                egress_allow: vec![],
                per_call_cost_ceiling: 1.0,
                per_task_cost_ceiling: 25.0,
                sandbox_tier: SandboxTier::Low,
            },
            extra_env: vec![],
        }
    }

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn run_streams_output_and_reports_outcome() {
        let launcher = Arc::new(MockLauncher::new(
            vec![b"hello ".to_vec(), b"world\n".to_vec()],
            0,
        ));
        let (tmp, broker, runner) = fixture(launcher);
        let ctx = ctx(&tmp, &["echo .*"]);

        let sub = broker.subscribe("t1", SubscribeFrom::Seq(0)).unwrap();
        let mut handle = runner
            .run(&ctx, &argv(&["echo", "hello", "world"]), None)
            .await
            .unwrap();
        let outcome = handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::Normal);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output_bytes, 12);
        assert!(!outcome.truncated);

        // process_start META, two stdout chunks, process_exit META.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = sub.drain();
        let stdout_bytes: Vec<u8> = events
            .iter()
            .filter(|e| e.stream == StreamKind::Stdout)
            .flat_map(|e| e.payload.clone())
            .collect();
        assert_eq!(stdout_bytes, b"hello world\n".to_vec());
        let metas: Vec<MetaKind> = events
            .iter()
            .filter(|e| e.stream == StreamKind::Meta)
            .filter_map(|e| MetaRecord::from_bytes(&e.payload))
            .map(|r| r.kind)
            .collect();
        assert_eq!(metas, vec![MetaKind::ProcessStart, MetaKind::ProcessExit]);
    }

    #[tokio::test]
    async fn denied_command_never_spawns() {
        let launcher = Arc::new(MockLauncher::new(vec![b"nope".to_vec()], 0));
        let (tmp, broker, runner) = fixture(launcher);
        let ctx = ctx(&tmp, &["git (status|diff)"]);

        let sub = broker.subscribe("t1", SubscribeFrom::Seq(0)).unwrap();
        let mut handle = runner
            .run(&ctx, &argv(&["rm", "-rf", "/tmp/x"]), None)
            .await
            .unwrap();
        let outcome = handle.wait(Duration::from_secs(1)).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::PolicyBlocked);
        assert_eq!(outcome.exit_code, None);
        assert_eq!(outcome.output_bytes, 0);

        // The denial is visible on stderr; no process output ever appears.
        let events = sub.drain();
        let stderr: Vec<u8> = events
            .iter()
            .filter(|e| e.stream == StreamKind::Stderr)
            .flat_map(|e| e.payload.clone())
            .collect();
        assert!(String::from_utf8_lossy(&stderr).contains("policy denied"));
        assert!(events
            .iter()
            .filter(|e| e.stream == StreamKind::Stdout)
            .next()
            .is_none());
    }

    #[tokio::test]
    async fn output_cap_truncates_and_kills() {
        let big = vec![b'x'; 4096];
        let launcher = Arc::new(MockLauncher::hanging(vec![big.clone(), big.clone(), big]));
        let (tmp, _broker, mut runner) = fixture(launcher);
        runner.sandbox_cfg.low.max_output_bytes = 5000;
        let ctx = ctx(&tmp, &[".*"]);

        let mut handle = runner.run(&ctx, &argv(&["yes"]), None).await.unwrap();
        let outcome = handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::OutputExceeded);
        assert!(outcome.truncated);
        assert!(outcome.signaled);
    }

    #[tokio::test]
    async fn wall_cap_times_out() {
        let launcher = Arc::new(MockLauncher::hanging(vec![]));
        let (tmp, _broker, mut runner) = fixture(launcher);
        runner.sandbox_cfg.low.wall_secs = 1;
        let ctx = ctx(&tmp, &[".*"]);

        let mut handle = runner.run(&ctx, &argv(&["sleep", "60"]), None).await.unwrap();
        let outcome = handle.wait(Duration::from_secs(10)).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::Timeout);
        assert!(outcome.signaled);
    }

    #[tokio::test]
    async fn cancel_soft_then_hard() {
        let launcher = Arc::new(MockLauncher::hanging(vec![b"working...".to_vec()]));
        let (tmp, _broker, runner) = fixture(launcher);
        let ctx = ctx(&tmp, &[".*"]);

        let mut handle = runner.run(&ctx, &argv(&["agent"]), None).await.unwrap();
        handle.cancel(Duration::from_millis(50)).await;
        let outcome = handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(outcome.exit_reason, ExitReason::Cancelled);
        assert!(outcome.signaled);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let launcher = Arc::new(MockLauncher::new(vec![b"error: no such test\n".to_vec()], 2));
        let (tmp, _broker, runner) = fixture(launcher);
        let ctx = ctx(&tmp, &[".*"]);

        let mut handle = runner.run(&ctx, &argv(&["cargo", "test"]), None).await.unwrap();
        let outcome = handle.wait(Duration::from_secs(5)).await.unwrap();

        assert_eq!(outcome.exit_code, Some(2));
        assert_eq!(outcome.exit_reason, ExitReason::Normal);
        assert!(!outcome.signaled);
    }
}

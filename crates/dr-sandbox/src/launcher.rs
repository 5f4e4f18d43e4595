use std::io::{Read, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use tracing::{debug, warn};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// ProcessControl
// ---------------------------------------------------------------------------

/// Terminal status of a launched process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: i32,
    pub signaled: bool,
}

/// Lifecycle control over a launched process, independent of its I/O.
pub trait ProcessControl: Send + Sync {
    fn pid(&self) -> Option<u32>;
    /// `None` while the process is still running.
    fn try_wait(&self) -> Option<ProcessExit>;
    /// Force termination. Idempotent.
    fn kill(&self);
}

// ---------------------------------------------------------------------------
// LaunchedProcess
// ---------------------------------------------------------------------------

/// A process attached to a PTY: byte channels for I/O plus a control
/// handle. The reader channel closes at EOF.
pub struct LaunchedProcess {
    pub id: Uuid,
    pub reader: flume::Receiver<Vec<u8>>,
    pub writer: flume::Sender<Vec<u8>>,
    pub control: Arc<dyn ProcessControl>,
}

// ---------------------------------------------------------------------------
// PtyLauncher trait (for testability)
// ---------------------------------------------------------------------------

/// Abstraction over PTY spawning so the runner can be exercised with
/// scripted processes in tests.
pub trait PtyLauncher: Send + Sync {
    fn launch(
        &self,
        cwd: &Path,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<LaunchedProcess, String>;
}

// ---------------------------------------------------------------------------
// PtyNativeLauncher — portable-pty production implementation
// ---------------------------------------------------------------------------

pub struct PtyNativeLauncher {
    rows: u16,
    cols: u16,
}

impl PtyNativeLauncher {
    pub fn new() -> Self {
        Self { rows: 24, cols: 80 }
    }
}

impl Default for PtyNativeLauncher {
    fn default() -> Self {
        Self::new()
    }
}

struct PtyChildControl {
    child: Mutex<Box<dyn portable_pty::Child + Send + Sync>>,
    /// Keeps the PTY master open for the child's lifetime.
    _master: Mutex<Box<dyn portable_pty::MasterPty + Send>>,
    pid: Option<u32>,
    killed: Mutex<bool>,
}

impl ProcessControl for PtyChildControl {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn try_wait(&self) -> Option<ProcessExit> {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("pty child lock was poisoned, recovering");
            e.into_inner()
        });
        match child.try_wait() {
            Ok(Some(status)) => {
                let killed = *self.killed.lock().expect("killed flag poisoned");
                Some(ProcessExit {
                    code: status.exit_code() as i32,
                    signaled: killed,
                })
            }
            Ok(None) => None,
            Err(_) => Some(ProcessExit {
                code: -1,
                signaled: false,
            }),
        }
    }

    fn kill(&self) {
        let mut child = self.child.lock().unwrap_or_else(|e| {
            warn!("pty child lock was poisoned, recovering");
            e.into_inner()
        });
        *self.killed.lock().expect("killed flag poisoned") = true;
        if let Err(e) = child.kill() {
            debug!("pty kill returned error (process likely exited): {e}");
        }
    }
}

impl PtyLauncher for PtyNativeLauncher {
    fn launch(
        &self,
        cwd: &Path,
        argv: &[String],
        env: &[(String, String)],
    ) -> Result<LaunchedProcess, String> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| format!("openpty failed: {e}"))?;

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| "empty argv".to_string())?;
        let mut command = CommandBuilder::new(program);
        for arg in args {
            command.arg(arg);
        }
        command.cwd(cwd);
        command.env_clear();
        for (key, value) in env {
            command.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(command)
            .map_err(|e| format!("spawn failed: {e}"))?;
        let pid = child.process_id();

        debug!(program = %program, ?args, pid, "spawned PTY process");

        // -- stdout/stderr reader thread (PTY merges both) --
        let (read_tx, read_rx) = flume::bounded::<Vec<u8>>(256);
        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| format!("clone reader failed: {e}"))?;
        std::thread::spawn(move || {
            let mut buf = [0u8; 4096];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if read_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    // EIO is the usual signal that the child went away.
                    Err(_) => break,
                }
            }
        });

        // -- stdin writer thread --
        let (write_tx, write_rx) = flume::bounded::<Vec<u8>>(256);
        let mut writer = pair
            .master
            .take_writer()
            .map_err(|e| format!("take writer failed: {e}"))?;
        std::thread::spawn(move || {
            while let Ok(data) = write_rx.recv() {
                if writer.write_all(&data).is_err() {
                    break;
                }
                let _ = writer.flush();
            }
        });

        Ok(LaunchedProcess {
            id: Uuid::new_v4(),
            reader: read_rx,
            writer: write_tx,
            control: Arc::new(PtyChildControl {
                child: Mutex::new(child),
                _master: Mutex::new(pair.master),
                pid,
                killed: Mutex::new(false),
            }),
        })
    }
}

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, info, warn};

use dr_core::events::{AuditEntry, OverlayEvent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// Backend unavailability. Callers must treat the originating action as
    /// not-yet-durable and retry or fail the task.
    #[error("audit backend unavailable: {0}")]
    Unavailable(String),
    #[error("audit record malformed: {0}")]
    Malformed(String),
    #[error("no audit log for task: {0}")]
    UnknownTask(String),
}

impl AuditError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuditError::Unavailable(_))
    }
}

impl From<std::io::Error> for AuditError {
    fn from(err: std::io::Error) -> Self {
        AuditError::Unavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AuditError>;

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

/// File-backed append-only log, one pair of files per task:
///
/// * `<task>.audit.jsonl` — audit entries, fsynced on every append
/// * `<task>.overlay.jsonl` — captured overlay events, buffered; sealed to
///   `<task>.overlay.jsonl.zst` when the topic closes
///
/// A crash between appends leaves at most one torn trailing line, which
/// `scan` ignores. Appends never reorder.
pub struct AuditStore {
    dir: PathBuf,
    logs: Mutex<HashMap<String, TaskLog>>,
    overlays: Mutex<HashMap<String, BufWriter<File>>>,
}

struct TaskLog {
    file: File,
    next_seq: u64,
}

impl AuditStore {
    /// Open (or create) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "audit store opened");
        Ok(Self {
            dir,
            logs: Mutex::new(HashMap::new()),
            overlays: Mutex::new(HashMap::new()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn audit_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.audit.jsonl"))
    }

    fn overlay_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.overlay.jsonl"))
    }

    fn sealed_overlay_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.overlay.jsonl.zst"))
    }

    // -----------------------------------------------------------------------
    // Audit entries
    // -----------------------------------------------------------------------

    /// Atomically append an entry, assigning it the task's next sequence
    /// number. Returns the assigned sequence. The entry is durable (fsynced)
    /// before this returns.
    pub fn append(&self, mut entry: AuditEntry) -> Result<u64> {
        let mut logs = self.logs.lock().expect("audit log lock poisoned");
        let log = match logs.entry(entry.task_id.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                let path = self.audit_path(&entry.task_id);
                let next_seq = recover_next_seq(&path)?;
                let file = OpenOptions::new().create(true).append(true).open(&path)?;
                slot.insert(TaskLog { file, next_seq })
            }
        };

        entry.seq = log.next_seq;
        let mut line =
            serde_json::to_vec(&entry).map_err(|e| AuditError::Malformed(e.to_string()))?;
        line.push(b'\n');
        log.file.write_all(&line)?;
        log.file.sync_data()?;
        log.next_seq += 1;
        debug!(task_id = %entry.task_id, seq = entry.seq, kind = ?entry.kind, "audit appended");
        Ok(entry.seq)
    }

    /// Entries for a task in append order, starting at `from_seq`.
    ///
    /// A torn trailing line (crash mid-append) is skipped; a malformed line
    /// in the middle of the log is an error.
    pub fn scan(&self, task_id: &str, from_seq: u64) -> Result<Vec<AuditEntry>> {
        let path = self.audit_path(task_id);
        if !path.exists() {
            return Err(AuditError::UnknownTask(task_id.to_string()));
        }
        let lines = read_lines(&path)?;
        let mut entries = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<AuditEntry>(line) {
                Ok(entry) => {
                    if entry.seq >= from_seq {
                        entries.push(entry);
                    }
                }
                Err(e) if idx + 1 == lines.len() => {
                    warn!(task_id, "ignoring torn trailing audit line: {e}");
                }
                Err(e) => return Err(AuditError::Malformed(e.to_string())),
            }
        }
        Ok(entries)
    }

    /// The most recent transition entry for a task, used by the scheduler
    /// on restart to resume or fail the task.
    pub fn latest_state(&self, task_id: &str) -> Result<Option<AuditEntry>> {
        let entries = self.scan(task_id, 0)?;
        Ok(entries
            .into_iter()
            .rev()
            .find(|e| e.next_state.is_some()))
    }

    /// Task ids that have an audit log on disk.
    pub fn known_tasks(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for dirent in std::fs::read_dir(&self.dir)? {
            let name = dirent?.file_name();
            let name = name.to_string_lossy();
            if let Some(task_id) = name.strip_suffix(".audit.jsonl") {
                ids.push(task_id.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    // -----------------------------------------------------------------------
    // Overlay stream
    // -----------------------------------------------------------------------

    /// Persist one overlay event. Buffered and flushed per append, but not
    /// fsynced; overlay durability is best-effort relative to the audit log.
    pub fn append_overlay(&self, event: &OverlayEvent) -> Result<()> {
        let mut overlays = self.overlays.lock().expect("overlay lock poisoned");
        let writer = match overlays.entry(event.task_id.clone()) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(slot) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.overlay_path(&event.task_id))?;
                slot.insert(BufWriter::new(file))
            }
        };
        let mut line =
            serde_json::to_vec(event).map_err(|e| AuditError::Malformed(e.to_string()))?;
        line.push(b'\n');
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    /// Persisted overlay events with `seq >= from_seq`, in order, whether
    /// the stream is still raw or already sealed.
    pub fn scan_overlay(&self, task_id: &str, from_seq: u64) -> Result<Vec<OverlayEvent>> {
        let raw = self.overlay_path(task_id);
        let sealed = self.sealed_overlay_path(task_id);

        let lines = if raw.exists() {
            read_lines(&raw)?
        } else if sealed.exists() {
            let file = File::open(&sealed)?;
            let bytes = zstd::decode_all(BufReader::new(file))?;
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(|l| l.to_string())
                .collect()
        } else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        for (idx, line) in lines.iter().enumerate() {
            match serde_json::from_str::<OverlayEvent>(line) {
                Ok(event) => {
                    if event.seq >= from_seq {
                        events.push(event);
                    }
                }
                Err(e) if idx + 1 == lines.len() => {
                    warn!(task_id, "ignoring torn trailing overlay line: {e}");
                }
                Err(e) => return Err(AuditError::Malformed(e.to_string())),
            }
        }
        Ok(events)
    }

    /// Compress a finished overlay stream in place. Idempotent; a missing
    /// raw stream (already sealed, or no output captured) is not an error.
    pub fn seal_overlay(&self, task_id: &str) -> Result<()> {
        {
            let mut overlays = self.overlays.lock().expect("overlay lock poisoned");
            if let Some(mut writer) = overlays.remove(task_id) {
                writer.flush()?;
            }
        }
        let raw = self.overlay_path(task_id);
        if !raw.exists() {
            return Ok(());
        }
        let sealed = self.sealed_overlay_path(task_id);
        let input = std::fs::read(&raw)?;
        let compressed = zstd::encode_all(input.as_slice(), 3)?;
        let mut file = File::create(&sealed)?;
        file.write_all(&compressed)?;
        file.sync_data()?;
        std::fs::remove_file(&raw)?;
        info!(
            task_id,
            raw_bytes = input.len(),
            sealed_bytes = compressed.len(),
            "overlay stream sealed"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut lines = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push(line);
        }
    }
    Ok(lines)
}

/// On reopen after a restart, the next sequence continues after the last
/// intact entry.
fn recover_next_seq(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let lines = read_lines(path)?;
    let mut next = 0;
    for line in &lines {
        if let Ok(entry) = serde_json::from_str::<AuditEntry>(line) {
            next = entry.seq + 1;
        }
    }
    Ok(next)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

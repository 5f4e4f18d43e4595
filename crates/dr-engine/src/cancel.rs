use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tracing::debug;

/// Per-task cancellation coordinator.
///
/// The driver and any in-flight phase work `select!` on [`cancelled`]
/// alongside their main future; cancel wins every race. Triggering is
/// idempotent and the first reason sticks.
#[derive(Debug, Clone)]
pub struct CancelToken {
    trigger: broadcast::Sender<()>,
    flag: Arc<AtomicBool>,
    reason: Arc<Mutex<Option<String>>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            flag: Arc::new(AtomicBool::new(false)),
            reason: Arc::new(Mutex::new(None)),
        }
    }

    /// Request cancellation. Later calls keep the original reason.
    pub fn trigger(&self, reason: impl Into<String>) {
        if self
            .flag
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            *self.reason.lock().expect("reason lock poisoned") = Some(reason.into());
            let _ = self.trigger.send(());
        } else {
            debug!("cancel already triggered");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().expect("reason lock poisoned").clone()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let mut rx = self.trigger.subscribe();
        // Re-check after subscribing to close the window against a
        // trigger that landed in between.
        if self.is_cancelled() {
            return;
        }
        let _ = rx.recv().await;
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

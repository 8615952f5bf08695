use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Why a run ended before its schedule did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// Interrupted by the user (Ctrl-C).
    Stopped,
    /// An abort-on-fail threshold fired.
    Aborted(String),
}

/// Run-wide state shared by the threshold watcher, the signal handler and
/// every scenario scheduler. Once halted, every scheduler targets zero workers.
pub struct ControlState {
    aborted: AtomicBool,
    reason: Mutex<Option<HaltReason>>,
    halt: CancellationToken,
}

impl ControlState {
    pub fn new() -> Self {
        Self {
            aborted: AtomicBool::new(false),
            reason: Mutex::new(None),
            halt: CancellationToken::new(),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn stop(&self) {
        self.record(HaltReason::Stopped);
    }

    pub fn abort(&self, reason: impl Into<String>) {
        self.aborted.store(true, Ordering::SeqCst);
        self.record(HaltReason::Aborted(reason.into()));
    }

    // First reason wins.
    fn record(&self, reason: HaltReason) {
        let mut slot = self.reason.lock();
        if slot.is_none() {
            *slot = Some(reason);
        }
        drop(slot);
        self.halt.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    pub fn reason(&self) -> Option<HaltReason> {
        self.reason.lock().clone()
    }

    /// Resolves once the run is stopped or aborted.
    pub async fn halted(&self) {
        self.halt.cancelled().await
    }
}

impl Default for ControlState {
    fn default() -> Self {
        Self::new()
    }
}

//! Runtime state shared between the node and its collaborators.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Whether the initial bulk sync has finished. Cloned handles share one flag.
#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    finished: Arc<AtomicBool>,
}

impl SyncStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_sync_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn set_finished(&self, finished: bool) {
        self.finished.store(finished, Ordering::SeqCst);
    }
}

/// Lifecycle state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Not running.
    Stopped,
    /// Opening the store.
    Starting,
    /// Catching up to the chain head.
    BackfillRunning,
    /// Running the post-backfill orphan and liquidity passes.
    Reconciling,
    /// Following the chain tip in real-time.
    Live,
    /// Tearing down.
    ShuttingDown,
}

impl NodeState {
    /// `true` between a successful start and shutdown.
    pub fn is_running(self) -> bool {
        !matches!(self, Self::Stopped | Self::ShuttingDown)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Starting => write!(f, "starting"),
            Self::BackfillRunning => write!(f, "backfill"),
            Self::Reconciling => write!(f, "reconciling"),
            Self::Live => write!(f, "live"),
            Self::ShuttingDown => write!(f, "shutting-down"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let a = SyncStatus::new();
        let b = a.clone();
        assert!(!b.is_sync_finished());
        a.set_finished(true);
        assert!(b.is_sync_finished());
    }

    #[test]
    fn running_states() {
        assert!(NodeState::Live.is_running());
        assert!(NodeState::BackfillRunning.is_running());
        assert!(!NodeState::Stopped.is_running());
        assert_eq!(NodeState::BackfillRunning.to_string(), "backfill");
    }
}

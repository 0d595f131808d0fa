//! Error types for the marketsync pipeline.

use thiserror::Error;

/// Errors that can occur while syncing and materializing chain data.
#[derive(Debug, Error)]
pub enum IndexerError {
    /// Transient chain-client failure (connection reset, timeout, empty result).
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC retries exhausted after {attempts} attempts: {reason}")]
    RetriesExhausted { attempts: u32, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    /// Input that can never be applied (block without timestamp, null tx hash, bad payload).
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Handler error in '{handler}': {reason}")]
    Handler { handler: String, reason: String },

    #[error("Snapshot hash mismatch: file name says {expected}, contents hash to {actual}")]
    SnapshotIntegrity { expected: String, actual: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Clock override pop mismatch: expected {expected}, top of stack is {actual:?}")]
    ClockMisuse { expected: i64, actual: Option<i64> },

    #[error("Node is not running")]
    NotRunning,

    #[error("Indexer aborted: {reason}")]
    Aborted { reason: String },

    #[error("{0}")]
    Other(String),
}

impl IndexerError {
    /// Returns `true` if the chain client may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }

    /// Returns `true` for snapshot integrity failures, which must never be retried.
    pub fn is_integrity_failure(&self) -> bool {
        matches!(self, Self::SnapshotIntegrity { .. })
    }
}

impl From<std::io::Error> for IndexerError {
    fn from(e: std::io::Error) -> Self {
        Self::Snapshot(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_rpc_errors_are_retryable() {
        assert!(IndexerError::Rpc("timeout".into()).is_retryable());
        assert!(!IndexerError::Storage("locked".into()).is_retryable());
        assert!(!IndexerError::RetriesExhausted { attempts: 3, reason: "x".into() }.is_retryable());
    }

    #[test]
    fn integrity_display_names_both_hashes() {
        let e = IndexerError::SnapshotIntegrity {
            expected: "aa".into(),
            actual: "bb".into(),
        };
        assert!(e.is_integrity_failure());
        let msg = e.to_string();
        assert!(msg.contains("aa") && msg.contains("bb"));
    }
}

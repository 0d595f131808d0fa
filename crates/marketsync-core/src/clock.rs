//! The effective-time source for lifecycle advancement.
//!
//! Production nodes use [`BlockClock`]: time is the timestamp of the latest
//! block. Test harnesses use [`OverrideClock`], which layers a LIFO stack of
//! pinned timestamps on top of the block time.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::error::IndexerError;

/// Supplies the timestamp the state advancer runs against.
pub trait Clock: Send + Sync {
    /// Effective time for a block carrying `block_timestamp`.
    fn effective_time(&self, block_timestamp: i64) -> i64;

    /// Record the timestamp of a block whose unit committed.
    fn record_committed(&self, block_timestamp: i64);

    /// Current effective time (0 before any block was seen).
    fn now(&self) -> i64;

    /// Forget everything (called on shutdown).
    fn reset(&self) {}
}

/// Time = latest committed block timestamp.
#[derive(Debug, Default)]
pub struct BlockClock {
    head: AtomicI64,
}

impl BlockClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for BlockClock {
    fn effective_time(&self, block_timestamp: i64) -> i64 {
        block_timestamp
    }

    fn record_committed(&self, block_timestamp: i64) {
        self.head.store(block_timestamp, Ordering::SeqCst);
    }

    fn now(&self) -> i64 {
        self.head.load(Ordering::SeqCst)
    }

    fn reset(&self) {
        self.head.store(0, Ordering::SeqCst);
    }
}

/// Block clock plus a stack of overrides. The top override, if any, wins.
#[derive(Debug, Default)]
pub struct OverrideClock {
    block: BlockClock,
    overrides: Mutex<Vec<i64>>,
}

impl OverrideClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin the effective time to `timestamp` until the matching pop.
    pub fn push_override(&self, timestamp: i64) {
        self.lock().push(timestamp);
        tracing::debug!(timestamp, "clock override pushed");
    }

    /// Pop `timestamp`, which must be the most recently pushed value.
    ///
    /// A mismatch leaves the stack untouched.
    pub fn pop_override(&self, timestamp: i64) -> Result<(), IndexerError> {
        let mut stack = self.lock();
        match stack.last().copied() {
            Some(top) if top == timestamp => {
                stack.pop();
                tracing::debug!(timestamp, "clock override popped");
                Ok(())
            }
            actual => Err(IndexerError::ClockMisuse {
                expected: timestamp,
                actual,
            }),
        }
    }

    /// Top of the override stack.
    pub fn current_override(&self) -> Option<i64> {
        self.lock().last().copied()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<i64>> {
        // The stack holds plain integers; a poisoned guard is still consistent.
        self.overrides.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for OverrideClock {
    fn effective_time(&self, block_timestamp: i64) -> i64 {
        self.current_override().unwrap_or(block_timestamp)
    }

    fn record_committed(&self, block_timestamp: i64) {
        self.block.record_committed(block_timestamp);
    }

    fn now(&self) -> i64 {
        self.current_override().unwrap_or_else(|| self.block.now())
    }

    fn reset(&self) {
        self.lock().clear();
        self.block.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_clock_tracks_committed_head() {
        let clock = BlockClock::new();
        assert_eq!(clock.now(), 0);
        assert_eq!(clock.effective_time(500), 500);
        clock.record_committed(500);
        assert_eq!(clock.now(), 500);
        clock.reset();
        assert_eq!(clock.now(), 0);
    }

    #[test]
    fn push_then_pop_restores_previous_time() {
        let clock = OverrideClock::new();
        clock.record_committed(1_000);
        assert_eq!(clock.now(), 1_000);

        clock.push_override(5_000);
        assert_eq!(clock.now(), 5_000);
        assert_eq!(clock.effective_time(1_012), 5_000);

        clock.pop_override(5_000).unwrap();
        assert_eq!(clock.now(), 1_000);
        assert_eq!(clock.effective_time(1_012), 1_012);
    }

    #[test]
    fn nested_overrides_are_lifo() {
        let clock = OverrideClock::new();
        clock.push_override(10);
        clock.push_override(20);
        assert_eq!(clock.now(), 20);
        clock.pop_override(20).unwrap();
        assert_eq!(clock.now(), 10);
        clock.pop_override(10).unwrap();
        assert_eq!(clock.current_override(), None);
    }

    #[test]
    fn mismatched_pop_is_rejected_and_keeps_stack() {
        let clock = OverrideClock::new();
        clock.push_override(10);
        let err = clock.pop_override(11).unwrap_err();
        assert!(matches!(
            err,
            IndexerError::ClockMisuse {
                expected: 11,
                actual: Some(10)
            }
        ));
        assert_eq!(clock.now(), 10);
    }

    #[test]
    fn pop_on_empty_stack_is_rejected() {
        let clock = OverrideClock::new();
        assert!(clock.pop_override(1).is_err());
    }

    #[test]
    fn reset_clears_overrides() {
        let clock = OverrideClock::new();
        clock.record_committed(99);
        clock.push_override(1);
        clock.reset();
        assert_eq!(clock.current_override(), None);
        assert_eq!(clock.now(), 0);
    }
}

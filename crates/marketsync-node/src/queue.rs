//! Block & Log Queue: applies units strictly one at a time.
//!
//! A single worker task drains an unbounded channel. A failing unit is
//! fatal: the worker stops taking units and hands the error to the
//! injected callback.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use marketsync_core::error::IndexerError;
use marketsync_core::types::BlockUnit;

use crate::processor::UnitProcessor;

/// Receives the error that stopped a component.
pub type ErrorCallback = Arc<dyn Fn(IndexerError) + Send + Sync>;

pub struct BlockQueue {
    tx: Mutex<Option<mpsc::UnboundedSender<BlockUnit>>>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
}

impl BlockQueue {
    /// Spawn the worker.
    pub fn start(processor: Arc<dyn UnitProcessor>, on_error: ErrorCallback) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<BlockUnit>();
        let stopped = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(AtomicUsize::new(0));

        let worker = {
            let stopped = stopped.clone();
            let pending = pending.clone();
            tokio::spawn(async move {
                while let Some(unit) = rx.recv().await {
                    if stopped.load(Ordering::SeqCst) {
                        break;
                    }
                    let number = unit.block.number;
                    let direction = unit.direction;
                    let outcome = processor.process(unit).await;
                    pending.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = outcome {
                        error!(block = number, %direction, error = %e, "block unit failed, stopping queue");
                        stopped.store(true, Ordering::SeqCst);
                        on_error(e);
                        break;
                    }
                }
                debug!("block queue worker exited");
            })
        };

        Self {
            tx: Mutex::new(Some(tx)),
            worker: tokio::sync::Mutex::new(Some(worker)),
            stopped,
            pending,
        }
    }

    /// Enqueue a unit. Fails with `NotRunning` once the queue has stopped.
    pub fn push(&self, unit: BlockUnit) -> Result<(), IndexerError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(IndexerError::NotRunning);
        }
        let guard = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let Some(tx) = guard.as_ref() else {
            return Err(IndexerError::NotRunning);
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        tx.send(unit).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            IndexerError::NotRunning
        })
    }

    /// Units accepted but not yet finished.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop taking units and wait for the in-flight one to finish.
    ///
    /// Units still queued are dropped. Safe to call more than once.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!(error = %e, "block queue worker panicked");
            }
        }
        self.pending.store(0, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marketsync_core::types::BlockSummary;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<u64>>,
        delay_ms: u64,
        fail_at: Option<u64>,
        started: AtomicUsize,
    }

    #[async_trait]
    impl UnitProcessor for Recorder {
        async fn process(&self, unit: BlockUnit) -> Result<(), IndexerError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            if self.fail_at == Some(unit.block.number) {
                return Err(IndexerError::Storage("disk full".into()));
            }
            self.seen.lock().unwrap().push(unit.block.number);
            Ok(())
        }
    }

    fn unit(n: u64) -> BlockUnit {
        BlockUnit::add(
            BlockSummary {
                number: n,
                hash: format!("0x{n}"),
                parent_hash: String::new(),
                timestamp: Some(n as i64),
            },
            vec![],
        )
    }

    fn ignore_errors() -> ErrorCallback {
        Arc::new(|_| {})
    }

    async fn drain(queue: &BlockQueue) {
        for _ in 0..200 {
            if queue.pending() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue did not drain");
    }

    #[tokio::test]
    async fn units_apply_in_push_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = BlockQueue::start(recorder.clone(), ignore_errors());
        for n in [3, 1, 2] {
            queue.push(unit(n)).unwrap();
        }
        drain(&queue).await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![3, 1, 2]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_unit() {
        let recorder = Arc::new(Recorder {
            delay_ms: 50,
            ..Default::default()
        });
        let queue = BlockQueue::start(recorder.clone(), ignore_errors());
        queue.push(unit(1)).unwrap();
        while recorder.started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }
        queue.stop().await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1]);
        assert!(matches!(queue.push(unit(2)), Err(IndexerError::NotRunning)));
        queue.stop().await;
    }

    #[tokio::test]
    async fn failing_unit_stops_queue_and_reports() {
        let recorder = Arc::new(Recorder {
            fail_at: Some(2),
            ..Default::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let on_error: ErrorCallback = Arc::new(move |e| {
            let _ = tx.send(e);
        });
        let queue = BlockQueue::start(recorder.clone(), on_error);
        for n in 1..=3 {
            queue.push(unit(n)).unwrap();
        }

        let err = rx.recv().await.unwrap();
        assert!(matches!(err, IndexerError::Storage(_)));
        assert!(queue.is_stopped());
        assert!(queue.push(unit(4)).is_err());
        queue.stop().await;
        assert_eq!(*recorder.seen.lock().unwrap(), vec![1]);
    }
}

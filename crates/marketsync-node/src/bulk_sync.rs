//! Bulk Sync Engine: chunked catch-up from the last stored block to the head.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use marketsync_core::error::IndexerError;
use marketsync_core::notify::{ControlMessage, NotificationBus};
use marketsync_core::status::SyncStatus;
use marketsync_core::types::BlockDirection;

use crate::chain::ChainFetcher;
use crate::processor::BlockProcessor;

pub const DEFAULT_BLOCKS_PER_CHUNK: u64 = 720;

pub struct BulkSync<'a> {
    fetcher: &'a ChainFetcher,
    processor: &'a BlockProcessor,
    blocks_per_chunk: u64,
    sync_status: SyncStatus,
    notifications: NotificationBus,
}

impl<'a> BulkSync<'a> {
    pub fn new(
        fetcher: &'a ChainFetcher,
        processor: &'a BlockProcessor,
        sync_status: SyncStatus,
        notifications: NotificationBus,
    ) -> Self {
        Self {
            fetcher,
            processor,
            blocks_per_chunk: DEFAULT_BLOCKS_PER_CHUNK,
            sync_status,
            notifications,
        }
    }

    pub fn blocks_per_chunk(mut self, n: u64) -> Self {
        self.blocks_per_chunk = n.max(1);
        self
    }

    /// Apply every block from the resume point to the chain head.
    ///
    /// Returns the handoff: the last block covered. Live sync continues at
    /// handoff + 1. When `shutdown` is raised between blocks the sync stops
    /// early, returns what it covered and leaves the sync status unfinished.
    /// A chunk the client cannot deliver complete fails the sync; the next
    /// run resumes after the highest stored block.
    pub async fn run(&self, upload_block: u64, shutdown: &AtomicBool) -> Result<u64, IndexerError> {
        let start = match self.processor.store().highest_block().await? {
            Some(highest) => highest + 1,
            None => upload_block,
        };
        self.sync_status.set_finished(false);
        self.notifications.control(ControlMessage::BulkSyncStarted);

        let mut next = start;
        loop {
            let head = self.fetcher.head_block_number().await?;
            if head < next {
                break;
            }
            info!(from = next, head, "bulk sync pass");
            while next <= head {
                let to = next.saturating_add(self.blocks_per_chunk - 1).min(head);
                let blocks = self.fetcher.range(next, to).await?;
                for b in &blocks {
                    if shutdown.load(Ordering::SeqCst) {
                        let handoff = b.block.number.saturating_sub(1);
                        info!(handoff, "bulk sync interrupted by shutdown");
                        return Ok(handoff);
                    }
                    self.processor
                        .apply(BlockDirection::Add, &b.block, &b.logs, true)
                        .await?;
                }
                info!(from = next, to, blocks = blocks.len(), "bulk sync chunk applied");
                next = to + 1;
            }
        }

        let handoff = next.saturating_sub(1);
        self.sync_status.set_finished(true);
        self.notifications.control(ControlMessage::BulkSyncFinished);
        info!(start, handoff, "bulk sync finished");
        Ok(handoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use marketsync_core::clock::BlockClock;
    use marketsync_core::notify::Notification;
    use marketsync_core::types::BlockSummary;
    use marketsync_storage::reconcile::StoreReconciler;
    use marketsync_storage::sqlite::Store;

    use crate::chain::{BlockWithLogs, ChainClient, ContractAddresses, UnitStream};
    use crate::scripted::ScriptedChain;
    use crate::retry::{RetryConfig, RetryPolicy};

    fn block(n: u64) -> BlockWithLogs {
        BlockWithLogs {
            block: BlockSummary {
                number: n,
                hash: format!("0x{n:x}"),
                parent_hash: format!("0x{:x}", n.saturating_sub(1)),
                timestamp: Some(1_000 + n as i64),
            },
            logs: vec![],
        }
    }

    fn scripted(last: u64) -> ScriptedChain {
        ScriptedChain::new(
            "1",
            ContractAddresses {
                universe: "0xu".into(),
                upload_block_number: 5,
            },
        )
        .with_blocks((5..=last).map(block))
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            head_backoff: Duration::from_millis(1),
            range_backoff: Duration::from_millis(1),
            ..Default::default()
        })
    }

    async fn processor(bus: &NotificationBus) -> BlockProcessor {
        let store = Store::in_memory("1").await.unwrap();
        let reconciler = Arc::new(StoreReconciler::new(store.clone()));
        BlockProcessor::new(store, Arc::new(BlockClock::new()), bus.clone(), reconciler)
    }

    #[tokio::test]
    async fn syncs_in_chunks_to_head() {
        let bus = NotificationBus::new(64);
        let mut rx = bus.subscribe();
        let status = SyncStatus::new();
        let fetcher = ChainFetcher::new(Arc::new(scripted(9)), fast_retry(0));
        let p = processor(&bus).await;

        let handoff = BulkSync::new(&fetcher, &p, status.clone(), bus.clone())
            .blocks_per_chunk(2)
            .run(5, &AtomicBool::new(false))
            .await
            .unwrap();

        assert_eq!(handoff, 9);
        assert!(status.is_sync_finished());
        let rows = p.store().blocks().await.unwrap();
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r.bulk_sync));

        let controls: Vec<ControlMessage> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|n| match n {
                Notification::Control { message } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(controls, vec![ControlMessage::BulkSyncStarted, ControlMessage::BulkSyncFinished]);
    }

    #[tokio::test]
    async fn resumes_after_highest_stored_block() {
        let bus = NotificationBus::new(64);
        let p = processor(&bus).await;
        let early = ChainFetcher::new(Arc::new(scripted(7)), fast_retry(0));
        BulkSync::new(&early, &p, SyncStatus::new(), bus.clone())
            .run(5, &AtomicBool::new(false))
            .await
            .unwrap();
        let first_seven = p.store().block(7).await.unwrap().unwrap();

        let later = ChainFetcher::new(Arc::new(scripted(12)), fast_retry(0));
        let handoff = BulkSync::new(&later, &p, SyncStatus::new(), bus.clone())
            .run(5, &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(handoff, 12);
        assert_eq!(p.store().highest_block().await.unwrap(), Some(12));
        assert_eq!(p.store().block(7).await.unwrap().unwrap(), first_seven);
    }

    #[tokio::test]
    async fn empty_chain_hands_off_before_upload_block() {
        let bus = NotificationBus::new(8);
        let p = processor(&bus).await;
        let chain = ScriptedChain::new(
            "1",
            ContractAddresses {
                universe: "0xu".into(),
                upload_block_number: 5,
            },
        );
        let fetcher = ChainFetcher::new(Arc::new(chain), fast_retry(0));
        let status = SyncStatus::new();
        let handoff = BulkSync::new(&fetcher, &p, status.clone(), bus)
            .run(5, &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(handoff, 4);
        assert!(status.is_sync_finished());
    }

    #[tokio::test]
    async fn exhausted_retries_are_fatal() {
        let bus = NotificationBus::new(8);
        let p = processor(&bus).await;
        let chain = scripted(9);
        chain.fail_next(100);
        let fetcher = ChainFetcher::new(Arc::new(chain), fast_retry(2));
        let status = SyncStatus::new();
        let err = BulkSync::new(&fetcher, &p, status.clone(), bus)
            .run(5, &AtomicBool::new(false))
            .await
            .unwrap_err();
        assert!(matches!(err, IndexerError::RetriesExhausted { .. }));
        assert!(!status.is_sync_finished());
    }

    #[tokio::test]
    async fn shutdown_stops_between_blocks() {
        let bus = NotificationBus::new(8);
        let p = processor(&bus).await;
        let fetcher = ChainFetcher::new(Arc::new(scripted(9)), fast_retry(0));
        let status = SyncStatus::new();
        let handoff = BulkSync::new(&fetcher, &p, status.clone(), bus)
            .run(5, &AtomicBool::new(true))
            .await
            .unwrap();
        assert_eq!(handoff, 4);
        assert!(!status.is_sync_finished());
        assert!(p.store().blocks().await.unwrap().is_empty());
    }

    /// Head moves forward on every read until it reaches the last block.
    struct GrowingChain {
        inner: ScriptedChain,
        head: AtomicU64,
        last: u64,
    }

    #[async_trait]
    impl ChainClient for GrowingChain {
        fn network_id(&self) -> String {
            self.inner.network_id()
        }

        async fn current_block(&self) -> Result<u64, IndexerError> {
            let head = self.head.load(Ordering::SeqCst);
            self.head.store((head + 3).min(self.last), Ordering::SeqCst);
            Ok(head)
        }

        fn contract_addresses(&self, network_id: &str) -> Result<ContractAddresses, IndexerError> {
            self.inner.contract_addresses(network_id)
        }

        async fn blocks_with_logs(&self, from: u64, to: u64) -> Result<Vec<BlockWithLogs>, IndexerError> {
            self.inner.blocks_with_logs(from, to).await
        }

        async fn subscribe(&self, from_block: u64) -> Result<UnitStream, IndexerError> {
            self.inner.subscribe(from_block).await
        }

        async fn disconnect(&self) {
            self.inner.disconnect().await
        }
    }

    #[tokio::test]
    async fn keeps_going_while_head_advances() {
        let bus = NotificationBus::new(64);
        let p = processor(&bus).await;
        let chain = GrowingChain {
            inner: scripted(14),
            head: AtomicU64::new(6),
            last: 14,
        };
        let fetcher = ChainFetcher::new(Arc::new(chain), fast_retry(0));
        let handoff = BulkSync::new(&fetcher, &p, SyncStatus::new(), bus)
            .blocks_per_chunk(4)
            .run(5, &AtomicBool::new(false))
            .await
            .unwrap();
        assert_eq!(handoff, 14);
        assert_eq!(p.store().blocks().await.unwrap().len(), 10);
    }

    /// Never returns `hole` from a range reply.
    struct GappedChain {
        inner: ScriptedChain,
        hole: u64,
    }

    #[async_trait]
    impl ChainClient for GappedChain {
        fn network_id(&self) -> String {
            self.inner.network_id()
        }

        async fn current_block(&self) -> Result<u64, IndexerError> {
            self.inner.current_block().await
        }

        fn contract_addresses(&self, network_id: &str) -> Result<ContractAddresses, IndexerError> {
            self.inner.contract_addresses(network_id)
        }

        async fn blocks_with_logs(&self, from: u64, to: u64) -> Result<Vec<BlockWithLogs>, IndexerError> {
            let mut blocks = self.inner.blocks_with_logs(from, to).await?;
            blocks.retain(|b| b.block.number != self.hole);
            Ok(blocks)
        }

        async fn subscribe(&self, from_block: u64) -> Result<UnitStream, IndexerError> {
            self.inner.subscribe(from_block).await
        }

        async fn disconnect(&self) {
            self.inner.disconnect().await
        }
    }

    #[tokio::test]
    async fn chunk_with_a_missing_block_stops_the_sync() {
        let bus = NotificationBus::new(64);
        let p = processor(&bus).await;
        let chain = GappedChain {
            inner: scripted(9),
            hole: 7,
        };
        let fetcher = ChainFetcher::new(Arc::new(chain), fast_retry(1));
        let status = SyncStatus::new();
        let err = BulkSync::new(&fetcher, &p, status.clone(), bus)
            .blocks_per_chunk(2)
            .run(5, &AtomicBool::new(false))
            .await
            .unwrap_err();

        assert!(matches!(err, IndexerError::RetriesExhausted { attempts: 2, .. }));
        assert!(!status.is_sync_finished());
        let stored: Vec<u64> = p.store().blocks().await.unwrap().iter().map(|r| r.block_number).collect();
        assert_eq!(stored, vec![5, 6]);
        assert_eq!(p.store().highest_block().await.unwrap(), Some(6));
    }
}

//! Applies one block unit inside one database transaction.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};

use marketsync_core::clock::Clock;
use marketsync_core::error::IndexerError;
use marketsync_core::handler::{dispatch, HandlerContext};
use marketsync_core::mutation::WriteBatch;
use marketsync_core::notify::NotificationBus;
use marketsync_core::types::{BlockDirection, BlockSummary, BlockUnit, EventLog};
use marketsync_storage::advance::StateAdvancer;
use marketsync_storage::apply::apply_batch;
use marketsync_storage::reconcile::Reconciler;
use marketsync_storage::snapshot::export_snapshot;
use marketsync_storage::sqlite::{remove_block, upsert_block, Store, SCHEMA_VERSION};

/// Anything the block queue can hand units to.
#[async_trait]
pub trait UnitProcessor: Send + Sync {
    async fn process(&self, unit: BlockUnit) -> Result<(), IndexerError>;
}

#[derive(Debug, Clone)]
struct WarpExport {
    dir: PathBuf,
    interval: u64,
}

/// Writes blocks, their handler batches and lifecycle passes to the store.
pub struct BlockProcessor {
    store: Store,
    clock: Arc<dyn Clock>,
    notifications: NotificationBus,
    reconciler: Arc<dyn Reconciler>,
    advancer: StateAdvancer,
    warp: Option<WarpExport>,
}

impl BlockProcessor {
    pub fn new(
        store: Store,
        clock: Arc<dyn Clock>,
        notifications: NotificationBus,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        Self {
            store,
            clock,
            notifications,
            reconciler,
            advancer: StateAdvancer::default(),
            warp: None,
        }
    }

    pub fn with_advancer(mut self, advancer: StateAdvancer) -> Self {
        self.advancer = advancer;
        self
    }

    /// Export a warp snapshot into `dir` after every block whose number is a
    /// multiple of `interval`.
    pub fn with_warp_export(mut self, dir: impl Into<PathBuf>, interval: u64) -> Self {
        if interval > 0 {
            self.warp = Some(WarpExport {
                dir: dir.into(),
                interval,
            });
        }
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Apply or revert `block` with its `logs`.
    ///
    /// All input is validated and every handler has run before the
    /// transaction opens, so malformed input writes nothing. Notifications
    /// go out only after commit.
    pub async fn apply(
        &self,
        direction: BlockDirection,
        block: &BlockSummary,
        logs: &[EventLog],
        bulk_sync: bool,
    ) -> Result<(), IndexerError> {
        let block_timestamp = match direction {
            BlockDirection::Add => block.require_timestamp()?,
            BlockDirection::Remove => block.timestamp.unwrap_or_else(|| self.clock.now()),
        };
        let now = self.clock.effective_time(block_timestamp);
        let ctx = HandlerContext {
            network_id: self.store.network_id().to_string(),
            block_number: block.number,
            timestamp: now,
        };

        let mut batches: Vec<WriteBatch> = Vec::with_capacity(logs.len());
        for log in logs {
            let batch = match direction {
                BlockDirection::Add => dispatch(log, &ctx)?,
                BlockDirection::Remove => {
                    let mut reverted = log.clone();
                    reverted.removed = true;
                    dispatch(&reverted, &ctx)?
                }
            };
            if let Some(batch) = batch {
                batches.push(batch);
            }
        }

        let mut tx = self.store.begin().await?;
        let mut notifications = Vec::new();
        match direction {
            BlockDirection::Add => {
                upsert_block(&mut tx, block, now, bulk_sync).await?;
                notifications.extend(self.advancer.advance(&mut tx, now, block.number).await?);
                for batch in &batches {
                    apply_batch(&mut tx, batch).await?;
                }
            }
            BlockDirection::Remove => {
                for batch in batches.iter().rev() {
                    apply_batch(&mut tx, batch).await?;
                }
                remove_block(&mut tx, block.number).await?;
            }
        }
        tx.commit().await.map_err(|e| IndexerError::Storage(e.to_string()))?;

        match direction {
            BlockDirection::Add => {
                self.clock.record_committed(block_timestamp);
                info!(
                    block = block.number,
                    hash = %block.hash,
                    logs = logs.len(),
                    bulk_sync,
                    "block applied"
                );
            }
            BlockDirection::Remove => {
                warn!(block = block.number, hash = %block.hash, logs = logs.len(), "block removed");
            }
        }

        notifications.extend(batches.into_iter().flat_map(|b| b.notifications));
        self.notifications.publish_all(notifications);
        self.notifications.publish_all(self.reconciler.reconcile().await?);

        if direction == BlockDirection::Add {
            self.maybe_export(block.number);
        }
        Ok(())
    }

    fn maybe_export(&self, block_number: u64) {
        let Some(warp) = &self.warp else {
            return;
        };
        if block_number % warp.interval != 0 {
            return;
        }
        let store = self.store.clone();
        let dir = warp.dir.clone();
        tokio::spawn(async move {
            if let Err(e) = export_snapshot(&store, SCHEMA_VERSION, &dir).await {
                error!(block = block_number, error = %e, "warp export failed");
            }
        });
    }
}

#[async_trait]
impl UnitProcessor for BlockProcessor {
    async fn process(&self, unit: BlockUnit) -> Result<(), IndexerError> {
        self.apply(unit.direction, &unit.block, &unit.logs, false).await
    }
}

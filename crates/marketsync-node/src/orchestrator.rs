//! Node lifecycle: store → bulk sync → reconciliation → live queue → API.
//!
//! ```text
//! Stopped ─▶ Starting ─▶ BackfillRunning ─▶ Reconciling ─▶ Live
//!    ▲                                                      │
//!    └────────────────────── ShuttingDown ◀─────────────────┘
//! ```
//!
//! Failures during start and fatal errors from the live pipeline are both
//! delivered to the `on_error` callback given to [`Orchestrator::start`].

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use marketsync_core::clock::{BlockClock, Clock};
use marketsync_core::config::NodeConfig;
use marketsync_core::error::IndexerError;
use marketsync_core::notify::{ControlMessage, NotificationBus};
use marketsync_core::status::{NodeState, SyncStatus};
use marketsync_storage::advance::StateAdvancer;
use marketsync_storage::reconcile::{Reconciler, StoreReconciler};
use marketsync_storage::snapshot::{
    database_path, highest_db_version, import_snapshot, retire_database, WarpFileName,
};
use marketsync_storage::sqlite::{Store, SCHEMA_VERSION};

use crate::api::{ApiContext, ApiLayer};
use crate::bulk_sync::BulkSync;
use crate::chain::{ChainClient, ChainFetcher, UnitStream};
use crate::processor::BlockProcessor;
use crate::queue::{BlockQueue, ErrorCallback};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::sequencer::Sequencer;
use crate::supervisor::Supervised;

/// Sync progress as reported to status endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncedBlockInfo {
    pub highest_synced_block: Option<u64>,
    pub upload_block_number: u64,
    pub chain_head: u64,
}

struct Running {
    store: Store,
    queue: Option<Arc<BlockQueue>>,
    pump: Option<JoinHandle<()>>,
    api_bound: bool,
}

pub struct Orchestrator {
    config: NodeConfig,
    chain: Arc<dyn ChainClient>,
    api: Option<Arc<dyn ApiLayer>>,
    clock: Arc<dyn Clock>,
    notifications: NotificationBus,
    sync_status: SyncStatus,
    inner: tokio::sync::Mutex<Option<Running>>,
    state: Mutex<NodeState>,
    shutdown_requested: AtomicBool,
}

impl Orchestrator {
    pub fn new(config: NodeConfig, chain: Arc<dyn ChainClient>) -> Self {
        let notifications = NotificationBus::new(config.notification_capacity);
        Self {
            config,
            chain,
            api: None,
            clock: Arc::new(BlockClock::new()),
            notifications,
            sync_status: SyncStatus::new(),
            inner: tokio::sync::Mutex::new(None),
            state: Mutex::new(NodeState::Stopped),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    pub fn with_api(mut self, api: Arc<dyn ApiLayer>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn notifications(&self) -> &NotificationBus {
        &self.notifications
    }

    pub fn sync_status(&self) -> &SyncStatus {
        &self.sync_status
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state().is_running()
    }

    /// The open store, while the node is running.
    pub async fn store(&self) -> Option<Store> {
        self.inner.lock().await.as_ref().map(|r| r.store.clone())
    }

    /// Path of the database file for the chain's network.
    pub fn database_path(&self) -> PathBuf {
        database_path(&self.config.database_dir, &self.chain.network_id(), SCHEMA_VERSION)
    }

    /// Start the node. Errors go to `on_error`, not to the caller.
    pub async fn start(&self, on_error: ErrorCallback) {
        if let Err(e) = self.try_start(on_error.clone()).await {
            if self.shutdown_requested.load(Ordering::SeqCst) {
                debug!(error = %e, "start abandoned during shutdown");
                return;
            }
            error!(error = %e, "node failed to start");
            on_error(e);
        }
    }

    async fn try_start(&self, on_error: ErrorCallback) -> Result<(), IndexerError> {
        if self.is_running() {
            return Err(IndexerError::Other("node is already running".into()));
        }
        self.shutdown_requested.store(false, Ordering::SeqCst);
        self.set_state(NodeState::Starting);
        self.config.validate()?;

        let network_id = self.chain.network_id();
        let addresses = self.chain.contract_addresses(&network_id)?;
        tokio::fs::create_dir_all(&self.config.database_dir).await?;
        let db_path = database_path(&self.config.database_dir, &network_id, SCHEMA_VERSION);
        let store = Store::open(&db_path, &network_id).await?;
        info!(network = %network_id, db = %db_path.display(), "database opened");
        *self.inner.lock().await = Some(Running {
            store: store.clone(),
            queue: None,
            pump: None,
            api_bound: false,
        });

        let processor = Arc::new(self.processor(store.clone()));
        let fetcher = ChainFetcher::new(
            self.chain.clone(),
            RetryPolicy::new(RetryConfig::from_node_config(&self.config)),
        );

        self.set_state(NodeState::BackfillRunning);
        let handoff = BulkSync::new(
            &fetcher,
            &processor,
            self.sync_status.clone(),
            self.notifications.clone(),
        )
        .blocks_per_chunk(self.config.blocks_per_chunk)
        .run(addresses.upload_block_number, &self.shutdown_requested)
        .await?;
        if self.stopping() {
            return Ok(());
        }

        self.set_state(NodeState::Reconciling);
        self.notifications.control(ControlMessage::BulkOrphansCheckStarted);
        let reconciled = StoreReconciler::new(store.clone()).reconcile().await?;
        self.notifications.publish_all(reconciled);
        self.notifications.control(ControlMessage::BulkOrphansCheckFinished);
        if self.stopping() {
            return Ok(());
        }

        let live_from = handoff + 1;
        let queue = Arc::new(BlockQueue::start(processor, on_error.clone()));
        let stream = self.chain.subscribe(live_from).await?;
        let pump = tokio::spawn(pump_live(stream, Sequencer::new(live_from), queue.clone(), on_error));
        let orphaned_pump = {
            let mut guard = self.inner.lock().await;
            if let Some(running) = guard.as_mut() {
                running.queue = Some(queue.clone());
                running.pump = Some(pump);
                None
            } else {
                Some(pump)
            }
        };
        if let Some(pump) = orphaned_pump {
            pump.abort();
            queue.stop().await;
            return Ok(());
        }
        info!(live_from, "live sync armed");

        if let Some(api) = &self.api {
            api.bind(ApiContext {
                store,
                notifications: self.notifications.clone(),
                sync_status: self.sync_status.clone(),
            })
            .await?;
            if let Some(running) = self.inner.lock().await.as_mut() {
                running.api_bound = true;
            }
        }

        if !self.stopping() {
            self.set_state(NodeState::Live);
            info!(network = %network_id, "node live");
        }
        Ok(())
    }

    /// Stop everything the node started. Each step is best effort.
    pub async fn shutdown(&self) {
        let running = self.inner.lock().await.take();
        if running.is_none() && self.state() == NodeState::Stopped {
            return;
        }
        self.shutdown_requested.store(true, Ordering::SeqCst);
        self.set_state(NodeState::ShuttingDown);
        info!("shutting down");

        if let Some(running) = running {
            if let Some(pump) = running.pump {
                pump.abort();
            }
            if let Some(queue) = running.queue {
                queue.stop().await;
            }
            if running.api_bound {
                if let Some(api) = &self.api {
                    if let Err(e) = api.close().await {
                        warn!(error = %e, "API layer did not close cleanly");
                    }
                }
            }
            running.store.close().await;
        }
        self.clock.reset();
        self.chain.disconnect().await;
        self.set_state(NodeState::Stopped);
        info!("node stopped");
    }

    /// Replace the database with a warp snapshot, stopping the node first.
    ///
    /// The network is taken from the file name. Returns the retired copy of
    /// the previous database.
    pub async fn warp_sync(&self, file: &Path) -> Result<Option<PathBuf>, IndexerError> {
        if self.is_running() {
            self.shutdown().await;
        }
        let name = WarpFileName::parse(file)?;
        let db_path = database_path(&self.config.database_dir, &name.network_id, SCHEMA_VERSION);
        tokio::fs::create_dir_all(&self.config.database_dir).await?;
        import_snapshot(&db_path, &name.network_id, SCHEMA_VERSION, file).await
    }

    pub async fn request_latest_synced_block(&self) -> Result<SyncedBlockInfo, IndexerError> {
        let store = self.store().await.ok_or(IndexerError::NotRunning)?;
        let network_id = self.chain.network_id();
        let addresses = self.chain.contract_addresses(&network_id)?;
        Ok(SyncedBlockInfo {
            highest_synced_block: store.highest_block().await?,
            upload_block_number: addresses.upload_block_number,
            chain_head: self.chain.current_block().await?,
        })
    }

    /// Move the current database aside so the next start begins empty.
    pub async fn reset_database(&self) -> Result<Option<PathBuf>, IndexerError> {
        if self.is_running() {
            self.shutdown().await;
        }
        retire_database(&self.database_path()).await
    }

    pub fn system_db_version(&self) -> u32 {
        SCHEMA_VERSION
    }

    /// Highest schema version among database files present for this network.
    pub async fn highest_user_db_version(&self) -> Result<Option<u32>, IndexerError> {
        highest_db_version(&self.config.database_dir, &self.chain.network_id()).await
    }

    fn processor(&self, store: Store) -> BlockProcessor {
        let reconciler = Arc::new(StoreReconciler::new(store.clone()));
        let processor = BlockProcessor::new(store, self.clock.clone(), self.notifications.clone(), reconciler)
            .with_advancer(StateAdvancer::new(self.config.designated_reporting_duration_secs));
        if self.config.warp_sync {
            processor.with_warp_export(self.config.database_dir.clone(), self.config.warp_export_interval)
        } else {
            processor
        }
    }

    fn stopping(&self) -> bool {
        let stopping = self.shutdown_requested.load(Ordering::SeqCst);
        if stopping {
            info!("shutdown requested during start");
        }
        stopping
    }

    fn set_state(&self, state: NodeState) {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let from = *guard;
        if from != state {
            debug!(%from, to = %state, "node state");
            *guard = state;
        }
    }
}

#[async_trait]
impl Supervised for Orchestrator {
    async fn start(&self, on_error: ErrorCallback) {
        Orchestrator::start(self, on_error).await
    }

    async fn shutdown(&self) {
        Orchestrator::shutdown(self).await
    }
}

/// Forward the live subscription through the sequencer into the queue.
async fn pump_live(
    mut stream: UnitStream,
    mut sequencer: Sequencer,
    queue: Arc<BlockQueue>,
    on_error: ErrorCallback,
) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(unit) => {
                for ready in sequencer.push(unit) {
                    if queue.push(ready).is_err() {
                        debug!("block queue closed, live input stops");
                        return;
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "live subscription failed");
                on_error(e);
                return;
            }
        }
    }
    debug!("live subscription ended");
}

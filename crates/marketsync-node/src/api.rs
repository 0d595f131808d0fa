//! Seam for the read-only API layer.
//!
//! The node does not serve queries itself. Whatever does (JSON-RPC over
//! WebSocket/HTTP) is bound once the node is live and closed on shutdown.

use async_trait::async_trait;

use marketsync_core::error::IndexerError;
use marketsync_core::notify::NotificationBus;
use marketsync_core::status::SyncStatus;
use marketsync_storage::sqlite::Store;

/// What an API layer gets to read.
#[derive(Debug, Clone)]
pub struct ApiContext {
    pub store: Store,
    pub notifications: NotificationBus,
    pub sync_status: SyncStatus,
}

#[async_trait]
pub trait ApiLayer: Send + Sync {
    async fn bind(&self, ctx: ApiContext) -> Result<(), IndexerError>;

    async fn close(&self) -> Result<(), IndexerError>;
}

//! Bounded restart loop around a node.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use marketsync_core::config::NodeConfig;
use marketsync_core::error::IndexerError;

use crate::queue::ErrorCallback;

/// Something the supervisor can start and stop.
#[async_trait]
pub trait Supervised: Send + Sync {
    /// Start; fatal errors, now or later, go to `on_error`.
    async fn start(&self, on_error: ErrorCallback);

    async fn shutdown(&self);
}

/// Restarts a fresh node after each fatal error, up to `max_restarts` times.
#[derive(Debug, Clone)]
pub struct Supervisor {
    pub max_restarts: u32,
    pub restart_delay: Duration,
}

impl Supervisor {
    pub fn new(max_restarts: u32, restart_delay: Duration) -> Self {
        Self {
            max_restarts,
            restart_delay,
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(
            config.max_system_retries,
            Duration::from_millis(config.restart_delay_ms),
        )
    }

    /// Run nodes built by `factory` until `shutdown` resolves or the restart
    /// budget is spent. The error that spent the budget is returned.
    pub async fn run<S, F, Sh>(&self, mut factory: F, shutdown: Sh) -> Result<(), IndexerError>
    where
        S: Supervised + 'static,
        F: FnMut() -> Arc<S>,
        Sh: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut restarts = 0u32;
        loop {
            let node = factory();
            let (tx, mut rx) = mpsc::unbounded_channel::<IndexerError>();
            let on_error: ErrorCallback = Arc::new(move |e| {
                let _ = tx.send(e);
            });
            let starter = {
                let node = node.clone();
                tokio::spawn(async move { node.start(on_error).await })
            };

            // A node that dropped every error handle can only be stopped by the signal.
            let failure = tokio::select! {
                _ = &mut shutdown => None,
                Some(e) = rx.recv() => Some(e),
            };
            let Some(e) = failure else {
                info!("shutdown signal received");
                node.shutdown().await;
                let _ = starter.await;
                return Ok(());
            };

            error!(restarts, max_restarts = self.max_restarts, error = %e, "node failed");
            node.shutdown().await;
            let _ = starter.await;
            if restarts >= self.max_restarts {
                error!(restarts, "restart budget exhausted");
                return Err(e);
            }
            restarts += 1;
            warn!(
                attempt = restarts,
                delay_ms = self.restart_delay.as_millis() as u64,
                "restarting node"
            );

            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown signal received while waiting to restart");
                    return Ok(());
                }
                _ = tokio::time::sleep(self.restart_delay) => {}
            }
        }
    }
}

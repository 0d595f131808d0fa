//! Fluent builder API for creating sync nodes.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use marketsync_node::{ChainClient, NodeBuilder, Orchestrator};
//!
//! fn node(chain: Arc<dyn ChainClient>) -> Orchestrator {
//!     NodeBuilder::new()
//!         .database_dir("/var/lib/marketsync")
//!         .blocks_per_chunk(500)
//!         .warp_sync(true)
//!         .build(chain)
//!         .expect("valid config")
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use marketsync_core::clock::Clock;
use marketsync_core::config::NodeConfig;
use marketsync_core::error::IndexerError;

use crate::api::ApiLayer;
use crate::chain::ChainClient;
use crate::orchestrator::Orchestrator;

/// Fluent builder for [`NodeConfig`] and [`Orchestrator`].
#[derive(Default)]
pub struct NodeBuilder {
    config: NodeConfig,
    api: Option<Arc<dyn ApiLayer>>,
    clock: Option<Arc<dyn Clock>>,
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing config (e.g. [`NodeConfig::from_env`]).
    pub fn from_config(config: NodeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    /// Directory for the database file and warp snapshots.
    pub fn database_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.database_dir = dir.into();
        self
    }

    pub fn warp_sync(mut self, enabled: bool) -> Self {
        self.config.warp_sync = enabled;
        self
    }

    /// Export a snapshot every `n` blocks when warp sync is on.
    pub fn warp_export_interval(mut self, n: u64) -> Self {
        self.config.warp_export_interval = n;
        self
    }

    /// Set the number of blocks fetched per bulk-sync chunk.
    pub fn blocks_per_chunk(mut self, n: u64) -> Self {
        self.config.blocks_per_chunk = n;
        self
    }

    pub fn max_request_retries(mut self, n: u32) -> Self {
        self.config.max_request_retries = n;
        self
    }

    pub fn retry_initial_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_initial_backoff_ms = ms;
        self
    }

    pub fn max_system_retries(mut self, n: u32) -> Self {
        self.config.max_system_retries = n;
        self
    }

    pub fn restart_delay_ms(mut self, ms: u64) -> Self {
        self.config.restart_delay_ms = ms;
        self
    }

    pub fn designated_reporting_duration_secs(mut self, secs: i64) -> Self {
        self.config.designated_reporting_duration_secs = secs;
        self
    }

    pub fn api(mut self, api: Arc<dyn ApiLayer>) -> Self {
        self.api = Some(api);
        self
    }

    /// Replace the block clock, e.g. with an `OverrideClock` in harnesses.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Build the `NodeConfig`.
    pub fn build_config(self) -> NodeConfig {
        self.config
    }

    /// Validate the config and build an orchestrator for `chain`.
    pub fn build(self, chain: Arc<dyn ChainClient>) -> Result<Orchestrator, IndexerError> {
        self.config.validate()?;
        let mut node = Orchestrator::new(self.config, chain);
        if let Some(api) = self.api {
            node = node.with_api(api);
        }
        if let Some(clock) = self.clock {
            node = node.with_clock(clock);
        }
        Ok(node)
    }
}

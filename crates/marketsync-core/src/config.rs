//! Node configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

/// Configuration for a sync node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Directory holding the database file and warp snapshots.
    pub database_dir: PathBuf,
    /// Export a warp snapshot every `warp_export_interval` blocks.
    pub warp_sync: bool,
    pub warp_export_interval: u64,
    /// Retries per chain request after the first attempt.
    pub max_request_retries: u32,
    /// Restarts the supervisor allows after fatal errors.
    pub max_system_retries: u32,
    /// Blocks fetched per bulk-sync chunk.
    pub blocks_per_chunk: u64,
    /// Delay between supervisor restarts (milliseconds).
    pub restart_delay_ms: u64,
    /// First delay after a failed range fetch (milliseconds); head polls
    /// start at a quarter of it.
    pub retry_initial_backoff_ms: u64,
    /// How long a designated reporter has after market end (seconds).
    pub designated_reporting_duration_secs: i64,
    /// Capacity of the notification broadcast channel.
    pub notification_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            database_dir: PathBuf::from("."),
            warp_sync: false,
            warp_export_interval: 100,
            max_request_retries: 3,
            max_system_retries: 3,
            blocks_per_chunk: 720,
            restart_delay_ms: 1_000,
            retry_initial_backoff_ms: 500,
            designated_reporting_duration_secs: 259_200,
            notification_capacity: 1_024,
        }
    }
}

impl NodeConfig {
    /// Build a config from process environment variables, falling back to defaults.
    ///
    /// | variable | field |
    /// |---|---|
    /// | `MARKETSYNC_DATABASE_DIR` | `database_dir` |
    /// | `IS_WARP_SYNC` | `warp_sync` (`"true"` enables) |
    /// | `WARP_EXPORT_INTERVAL` | `warp_export_interval` |
    /// | `MAX_REQUEST_RETRIES` | `max_request_retries` |
    /// | `MAX_SYSTEM_RETRIES` | `max_system_retries` |
    /// | `BLOCKS_PER_CHUNK` | `blocks_per_chunk` |
    /// | `RESTART_DELAY_MS` | `restart_delay_ms` |
    pub fn from_env() -> Result<Self, IndexerError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, IndexerError> {
        let mut config = Self::default();
        if let Some(dir) = lookup("MARKETSYNC_DATABASE_DIR") {
            config.database_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("IS_WARP_SYNC") {
            config.warp_sync = flag == "true";
        }
        parse_into(&lookup, "WARP_EXPORT_INTERVAL", &mut config.warp_export_interval)?;
        parse_into(&lookup, "MAX_REQUEST_RETRIES", &mut config.max_request_retries)?;
        parse_into(&lookup, "MAX_SYSTEM_RETRIES", &mut config.max_system_retries)?;
        parse_into(&lookup, "BLOCKS_PER_CHUNK", &mut config.blocks_per_chunk)?;
        parse_into(&lookup, "RESTART_DELAY_MS", &mut config.restart_delay_ms)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.blocks_per_chunk == 0 {
            return Err(IndexerError::Other("blocks_per_chunk must be at least 1".into()));
        }
        if self.warp_sync && self.warp_export_interval == 0 {
            return Err(IndexerError::Other(
                "warp_export_interval must be at least 1 when warp sync is enabled".into(),
            ));
        }
        Ok(())
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    slot: &mut T,
) -> Result<(), IndexerError> {
    if let Some(raw) = lookup(key) {
        *slot = raw
            .trim()
            .parse()
            .map_err(|_| IndexerError::Other(format!("invalid value for {key}: {raw:?}")))?;
    }
    Ok(())
}

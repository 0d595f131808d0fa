//! Chain-client seam.
//!
//! The node never talks JSON-RPC itself: a [`ChainClient`] delivers blocks
//! whose logs are already decoded into [`EventLog`]s. [`ChainFetcher`] wraps a
//! client with the retry policy, ordering and completeness checks the bulk
//! sync needs.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use marketsync_core::error::IndexerError;
use marketsync_core::types::{BlockSummary, BlockUnit, EventLog};

use crate::retry::{with_retry, ChainRequest, RetryPolicy};

/// Deployment facts for a network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAddresses {
    /// The genesis universe.
    pub universe: String,
    /// Block the contracts were deployed at; backfill of an empty store starts here.
    pub upload_block_number: u64,
}

/// A block together with its decoded logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockWithLogs {
    pub block: BlockSummary,
    #[serde(default)]
    pub logs: Vec<EventLog>,
}

/// Live stream of block units, in chain order.
pub type UnitStream = Pin<Box<dyn Stream<Item = Result<BlockUnit, IndexerError>> + Send>>;

/// Source of decoded chain data.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn network_id(&self) -> String;

    /// Number of the current chain head.
    async fn current_block(&self) -> Result<u64, IndexerError>;

    fn contract_addresses(&self, network_id: &str) -> Result<ContractAddresses, IndexerError>;

    /// Blocks in `[from, to]` with their logs, in any order.
    async fn blocks_with_logs(&self, from: u64, to: u64) -> Result<Vec<BlockWithLogs>, IndexerError>;

    /// Units from `from_block` onward, including removals on reorg.
    async fn subscribe(&self, from_block: u64) -> Result<UnitStream, IndexerError>;

    async fn disconnect(&self);
}

/// Retrying, ordering front for a [`ChainClient`].
pub struct ChainFetcher {
    client: Arc<dyn ChainClient>,
    retry: RetryPolicy,
}

impl ChainFetcher {
    pub fn new(client: Arc<dyn ChainClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    /// Fetch the current chain head number.
    pub async fn head_block_number(&self) -> Result<u64, IndexerError> {
        with_retry(&self.retry, ChainRequest::HeadPoll, || self.client.current_block()).await
    }

    /// Fetch exactly the blocks `[from, to]`, sorted by number.
    ///
    /// A reply with a missing, duplicated or out-of-range block is treated as
    /// a transient RPC failure and retried like one.
    pub async fn range(&self, from: u64, to: u64) -> Result<Vec<BlockWithLogs>, IndexerError> {
        if to < from {
            return Ok(vec![]);
        }
        with_retry(&self.retry, ChainRequest::RangeFetch, || async move {
            let mut blocks = self.client.blocks_with_logs(from, to).await?;
            blocks.sort_by_key(|b| b.block.number);
            check_contiguous(from, to, &blocks)?;
            Ok(blocks)
        })
        .await
    }
}

fn check_contiguous(from: u64, to: u64, blocks: &[BlockWithLogs]) -> Result<(), IndexerError> {
    let mut expected = from;
    for b in blocks {
        if b.block.number != expected {
            return Err(IndexerError::Rpc(format!(
                "incomplete range {from}..={to}: expected block {expected}, got {}",
                b.block.number
            )));
        }
        expected += 1;
    }
    if expected != to + 1 {
        return Err(IndexerError::Rpc(format!(
            "incomplete range {from}..={to}: missing blocks from {expected}"
        )));
    }
    Ok(())
}

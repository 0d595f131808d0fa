//! `marketsync replay` — drive the node from a JSON file of decoded blocks.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch};

use marketsync_core::error::IndexerError;
use marketsync_core::types::BlockUnit;
use marketsync_core::NodeConfig;
use marketsync_node::{
    BlockWithLogs, ChainClient, ContractAddresses, ErrorCallback, Orchestrator, Supervisor, UnitStream,
};

pub struct Deployment {
    pub network: String,
    pub upload_block: u64,
    pub universe: String,
}

/// Chain client over a recorded set of blocks.
///
/// A recording has no live tail: the subscription yields nothing and ends
/// when the node disconnects.
pub struct RecordedChain {
    network_id: String,
    addresses: ContractAddresses,
    blocks: BTreeMap<u64, BlockWithLogs>,
    disconnected: watch::Sender<bool>,
}

impl RecordedChain {
    pub fn new(deployment: Deployment, blocks: Vec<BlockWithLogs>) -> Self {
        Self {
            network_id: deployment.network,
            addresses: ContractAddresses {
                universe: deployment.universe,
                upload_block_number: deployment.upload_block,
            },
            blocks: blocks.into_iter().map(|b| (b.block.number, b)).collect(),
            disconnected: watch::channel(false).0,
        }
    }
}

#[async_trait]
impl ChainClient for RecordedChain {
    fn network_id(&self) -> String {
        self.network_id.clone()
    }

    async fn current_block(&self) -> Result<u64, IndexerError> {
        Ok(self
            .blocks
            .keys()
            .next_back()
            .copied()
            .unwrap_or_else(|| self.addresses.upload_block_number.saturating_sub(1)))
    }

    fn contract_addresses(&self, network_id: &str) -> Result<ContractAddresses, IndexerError> {
        if network_id != self.network_id {
            return Err(IndexerError::Other(format!(
                "recording is for network {}, not {network_id}",
                self.network_id
            )));
        }
        Ok(self.addresses.clone())
    }

    async fn blocks_with_logs(&self, from: u64, to: u64) -> Result<Vec<BlockWithLogs>, IndexerError> {
        Ok(self.blocks.range(from..=to).map(|(_, b)| b.clone()).collect())
    }

    async fn subscribe(&self, _from_block: u64) -> Result<UnitStream, IndexerError> {
        self.disconnected.send_replace(false);
        let mut rx = self.disconnected.subscribe();
        let stream = futures::stream::once(async move {
            let _ = rx.wait_for(|closed| *closed).await;
        })
        .filter_map(|()| async { None::<Result<BlockUnit, IndexerError>> });
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) {
        self.disconnected.send_replace(true);
    }
}

pub async fn run(config: NodeConfig, blocks: &Path, deployment: Deployment, follow: bool) -> Result<()> {
    let raw = tokio::fs::read_to_string(blocks)
        .await
        .with_context(|| format!("reading {}", blocks.display()))?;
    let blocks: Vec<BlockWithLogs> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", blocks.display()))?;
    config.validate()?;
    tracing::info!(blocks = blocks.len(), network = %deployment.network, "replaying blocks");

    let chain = Arc::new(RecordedChain::new(deployment, blocks));

    if follow {
        let supervisor = Supervisor::from_config(&config);
        let factory = move || Arc::new(Orchestrator::new(config.clone(), chain.clone()));
        supervisor
            .run(factory, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await
            .context("node gave up after repeated failures")?;
        return Ok(());
    }

    let node = Orchestrator::new(config, chain);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let on_error: ErrorCallback = Arc::new(move |e| {
        let _ = tx.send(e);
    });
    node.start(on_error).await;
    if let Ok(e) = rx.try_recv() {
        node.shutdown().await;
        return Err(e).context("replay failed");
    }

    let info = node.request_latest_synced_block().await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    node.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use marketsync_core::types::BlockSummary;

    fn recording() -> RecordedChain {
        let blocks = (10..=12)
            .map(|n| BlockWithLogs {
                block: BlockSummary {
                    number: n,
                    hash: format!("0x{n:x}"),
                    parent_hash: format!("0x{:x}", n - 1),
                    timestamp: Some(n as i64 * 15),
                },
                logs: vec![],
            })
            .collect();
        RecordedChain::new(
            Deployment {
                network: "1".into(),
                upload_block: 10,
                universe: "0xu".into(),
            },
            blocks,
        )
    }

    #[tokio::test]
    async fn serves_the_recorded_range() {
        let chain = recording();
        assert_eq!(chain.current_block().await.unwrap(), 12);
        let numbers: Vec<u64> = chain
            .blocks_with_logs(11, 20)
            .await
            .unwrap()
            .iter()
            .map(|b| b.block.number)
            .collect();
        assert_eq!(numbers, vec![11, 12]);
        assert!(chain.contract_addresses("4").is_err());
    }

    #[tokio::test]
    async fn subscription_ends_on_disconnect() {
        let chain = recording();
        let mut stream = chain.subscribe(13).await.unwrap();
        chain.disconnect().await;
        assert!(stream.next().await.is_none());

        let mut again = chain.subscribe(13).await.unwrap();
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(50), again.next())
                .await
                .is_err()
        );
    }
}

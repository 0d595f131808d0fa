//! In-memory [`ChainClient`] for tests and harnesses.
//!
//! Available under `cfg(test)` and the `test-utils` feature.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use marketsync_core::error::IndexerError;
use marketsync_core::types::{BlockDirection, BlockUnit};

use crate::chain::{BlockWithLogs, ChainClient, ContractAddresses, UnitStream};

/// Chain over a fixed set of blocks.
///
/// [`emit`](Self::emit) extends the chain and pushes the unit to live
/// subscribers; [`fail_next`](Self::fail_next) injects transient RPC errors.
pub struct ScriptedChain {
    network_id: String,
    addresses: ContractAddresses,
    blocks: Mutex<BTreeMap<u64, BlockWithLogs>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Result<BlockUnit, IndexerError>>>>,
    failures: AtomicU32,
    disconnected: AtomicBool,
}

impl ScriptedChain {
    pub fn new(network_id: impl Into<String>, addresses: ContractAddresses) -> Self {
        Self {
            network_id: network_id.into(),
            addresses,
            blocks: Mutex::new(BTreeMap::new()),
            subscribers: Mutex::new(Vec::new()),
            failures: AtomicU32::new(0),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Add historical blocks.
    pub fn with_blocks(self, blocks: impl IntoIterator<Item = BlockWithLogs>) -> Self {
        {
            let mut map = self.lock_blocks();
            for b in blocks {
                map.insert(b.block.number, b);
            }
        }
        self
    }

    /// Apply `unit` to the chain and deliver it to every live subscriber.
    pub fn emit(&self, unit: BlockUnit) {
        {
            let mut map = self.lock_blocks();
            match unit.direction {
                BlockDirection::Add => {
                    map.insert(
                        unit.block.number,
                        BlockWithLogs {
                            block: unit.block.clone(),
                            logs: unit.logs.clone(),
                        },
                    );
                }
                BlockDirection::Remove => {
                    map.remove(&unit.block.number);
                }
            }
        }
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(Ok(unit.clone())).is_ok());
    }

    /// Deliver an error to every live subscriber.
    pub fn emit_error(&self, error_message: &str) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(Err(IndexerError::Rpc(error_message.to_string()))).is_ok());
    }

    /// Fail the next `n` requests with a transient RPC error.
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    fn lock_blocks(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, BlockWithLogs>> {
        self.blocks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn take_failure(&self) -> Result<(), IndexerError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(IndexerError::Rpc("injected transient failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ChainClient for ScriptedChain {
    fn network_id(&self) -> String {
        self.network_id.clone()
    }

    async fn current_block(&self) -> Result<u64, IndexerError> {
        self.take_failure()?;
        let map = self.lock_blocks();
        Ok(map
            .keys()
            .next_back()
            .copied()
            .unwrap_or_else(|| self.addresses.upload_block_number.saturating_sub(1)))
    }

    fn contract_addresses(&self, network_id: &str) -> Result<ContractAddresses, IndexerError> {
        if network_id != self.network_id {
            return Err(IndexerError::Other(format!("no contracts deployed on network {network_id}")));
        }
        Ok(self.addresses.clone())
    }

    async fn blocks_with_logs(&self, from: u64, to: u64) -> Result<Vec<BlockWithLogs>, IndexerError> {
        self.take_failure()?;
        let map = self.lock_blocks();
        // Reverse order on purpose: callers must not rely on client ordering.
        Ok(map.range(from..=to).rev().map(|(_, b)| b.clone()).collect())
    }

    async fn subscribe(&self, from_block: u64) -> Result<UnitStream, IndexerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        self.disconnected.store(false, Ordering::SeqCst);

        let stream = futures::stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Some(Ok(unit))
                        if unit.direction == BlockDirection::Add && unit.block.number < from_block =>
                    {
                        continue
                    }
                    Some(item) => return Some((item, rx)),
                    None => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn disconnect(&self) {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

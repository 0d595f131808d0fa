//! Shared types for the sync pipeline.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::IndexerError;

// ─── BlockSummary ─────────────────────────────────────────────────────────────

/// The block header fields the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    /// Block number.
    pub number: u64,
    /// Block hash (`0x…`).
    pub hash: String,
    /// Parent block hash (`0x…`).
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    ///
    /// `None` only for malformed input from a misbehaving node; such a block
    /// is rejected before anything is written.
    pub timestamp: Option<i64>,
}

impl BlockSummary {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockSummary) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }

    /// The block timestamp, or `MalformedInput` if the node omitted it.
    pub fn require_timestamp(&self) -> Result<i64, IndexerError> {
        self.timestamp.ok_or_else(|| {
            IndexerError::MalformedInput(format!(
                "block {} ({}) has no timestamp",
                self.number, self.hash
            ))
        })
    }
}

// ─── Direction / phase ───────────────────────────────────────────────────────

/// Whether a block is being applied or reverted (reorg).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockDirection {
    Add,
    Remove,
}

impl fmt::Display for BlockDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// The phase a block is applied in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexPhase {
    /// Catching up to the chain head (bulk sync).
    Backfill,
    /// Following the chain tip in real-time.
    Live,
}

impl IndexPhase {
    /// Value of the `bulk_sync` column for blocks applied in this phase.
    pub fn is_bulk_sync(self) -> bool {
        matches!(self, Self::Backfill)
    }
}

// ─── EventLog ────────────────────────────────────────────────────────────────

/// A decoded event log, as delivered by the chain client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLog {
    /// Emitting contract's registry name (e.g. `"Augur"`).
    pub contract_name: String,
    /// Event name (e.g. `"MarketCreated"`).
    pub event_name: String,
    /// `true` when the log belongs to a block being reverted.
    #[serde(default)]
    pub removed: bool,
    pub block_number: u64,
    /// Light nodes have been seen returning `null` here.
    pub transaction_hash: Option<String>,
    #[serde(default)]
    pub log_index: u32,
    /// Decoded event fields.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// One unit of work for the block queue: a block, its logs and a direction.
#[derive(Debug, Clone)]
pub struct BlockUnit {
    pub direction: BlockDirection,
    pub block: BlockSummary,
    pub logs: Vec<EventLog>,
}

impl BlockUnit {
    pub fn add(block: BlockSummary, logs: Vec<EventLog>) -> Self {
        Self {
            direction: BlockDirection::Add,
            block,
            logs,
        }
    }

    pub fn remove(block: BlockSummary, logs: Vec<EventLog>) -> Self {
        Self {
            direction: BlockDirection::Remove,
            block,
            logs,
        }
    }
}

// ─── ReportingState ──────────────────────────────────────────────────────────

/// Lifecycle state of a market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReportingState {
    PreReporting,
    DesignatedReporting,
    OpenReporting,
    CrowdsourcingDispute,
    AwaitingNextWindow,
    AwaitingFinalization,
    Finalized,
}

impl ReportingState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PreReporting => "PRE_REPORTING",
            Self::DesignatedReporting => "DESIGNATED_REPORTING",
            Self::OpenReporting => "OPEN_REPORTING",
            Self::CrowdsourcingDispute => "CROWDSOURCING_DISPUTE",
            Self::AwaitingNextWindow => "AWAITING_NEXT_WINDOW",
            Self::AwaitingFinalization => "AWAITING_FINALIZATION",
            Self::Finalized => "FINALIZED",
        }
    }

    /// Edges the time-driven advancer may take.
    ///
    /// Log handlers (reports, disputes, finalization) move markets by on-chain
    /// fact and are not bound by this graph.
    pub fn can_advance_to(self, next: ReportingState) -> bool {
        use ReportingState::*;
        matches!(
            (self, next),
            (PreReporting, DesignatedReporting)
                | (DesignatedReporting, OpenReporting)
                | (AwaitingNextWindow, CrowdsourcingDispute)
                | (CrowdsourcingDispute, AwaitingFinalization)
                | (AwaitingNextWindow, AwaitingFinalization)
        )
    }
}

impl fmt::Display for ReportingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReportingState {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PRE_REPORTING" => Self::PreReporting,
            "DESIGNATED_REPORTING" => Self::DesignatedReporting,
            "OPEN_REPORTING" => Self::OpenReporting,
            "CROWDSOURCING_DISPUTE" => Self::CrowdsourcingDispute,
            "AWAITING_NEXT_WINDOW" => Self::AwaitingNextWindow,
            "AWAITING_FINALIZATION" => Self::AwaitingFinalization,
            "FINALIZED" => Self::Finalized,
            other => return Err(IndexerError::Storage(format!("unknown reporting state {other}"))),
        })
    }
}

// ─── FeeWindowState ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeWindowState {
    Upcoming,
    Current,
    Past,
}

impl FeeWindowState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upcoming => "UPCOMING",
            Self::Current => "CURRENT",
            Self::Past => "PAST",
        }
    }
}

impl FromStr for FeeWindowState {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "UPCOMING" => Self::Upcoming,
            "CURRENT" => Self::Current,
            "PAST" => Self::Past,
            other => return Err(IndexerError::Storage(format!("unknown fee window state {other}"))),
        })
    }
}

// ─── Orders ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Buy,
    Sell,
}

impl OrderType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
        }
    }
}

impl FromStr for OrderType {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "buy" => Ok(Self::Buy),
            "sell" => Ok(Self::Sell),
            other => Err(IndexerError::Storage(format!("unknown order type {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Open,
    Canceled,
}

impl OrderState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Canceled => "canceled",
        }
    }
}

impl FromStr for OrderState {
    type Err = IndexerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "canceled" => Ok(Self::Canceled),
            other => Err(IndexerError::Storage(format!("unknown order state {other}"))),
        }
    }
}

// ─── Payouts ─────────────────────────────────────────────────────────────────

/// Most outcomes a market can have; one payout column per outcome.
pub const MAX_OUTCOMES: usize = 8;

/// A proposed resolution: per-outcome payout numerators plus the invalid flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayoutSet {
    /// Decimal strings; chain values exceed `i64`.
    pub numerators: Vec<String>,
    #[serde(default)]
    pub invalid: bool,
}

impl PayoutSet {
    /// Stable identity of the payout within its market.
    pub fn key(&self) -> String {
        format!("{}:{}", self.numerators.join(","), u8::from(self.invalid))
    }

    /// Reject sets the payout columns cannot hold.
    pub fn validate(&self) -> Result<(), IndexerError> {
        if self.numerators.is_empty() || self.numerators.len() > MAX_OUTCOMES {
            return Err(IndexerError::MalformedInput(format!(
                "payout has {} numerators (1..={MAX_OUTCOMES} allowed)",
                self.numerators.len()
            )));
        }
        Ok(())
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn block(number: u64, hash: &str, parent: &str) -> BlockSummary {
        BlockSummary {
            number,
            hash: hash.into(),
            parent_hash: parent.into(),
            timestamp: Some((number * 12) as i64),
        }
    }

    #[test]
    fn block_extends_parent() {
        let parent = block(100, "0xaaa", "0x000");
        let child = block(101, "0xbbb", "0xaaa");
        assert!(child.extends(&parent));
        assert!(!parent.extends(&child));
    }

    #[test]
    fn missing_timestamp_is_malformed() {
        let mut b = block(7, "0x7", "0x6");
        b.timestamp = None;
        assert!(matches!(b.require_timestamp(), Err(IndexerError::MalformedInput(_))));
    }

    #[test]
    fn reporting_state_string_roundtrip() {
        for s in [
            ReportingState::PreReporting,
            ReportingState::CrowdsourcingDispute,
            ReportingState::Finalized,
        ] {
            assert_eq!(s.as_str().parse::<ReportingState>().unwrap(), s);
        }
        assert!("BOGUS".parse::<ReportingState>().is_err());
    }

    #[test]
    fn advancer_graph_is_forward_only() {
        use ReportingState::*;
        assert!(PreReporting.can_advance_to(DesignatedReporting));
        assert!(AwaitingNextWindow.can_advance_to(CrowdsourcingDispute));
        assert!(!DesignatedReporting.can_advance_to(PreReporting));
        assert!(!Finalized.can_advance_to(AwaitingFinalization));
        assert!(!PreReporting.can_advance_to(OpenReporting));
    }

    #[test]
    fn payout_key_distinguishes_invalid() {
        let a = PayoutSet {
            numerators: vec!["0".into(), "10000".into()],
            invalid: false,
        };
        let b = PayoutSet {
            invalid: true,
            ..a.clone()
        };
        assert_eq!(a.key(), "0,10000:0");
        assert_ne!(a.key(), b.key());
    }

    #[test]
    fn event_log_deserializes_camel_case() {
        let log: EventLog = serde_json::from_value(serde_json::json!({
            "contractName": "Augur",
            "eventName": "MarketCreated",
            "blockNumber": 12,
            "transactionHash": "0xabc",
            "payload": { "market": "0x1" }
        }))
        .unwrap();
        assert!(!log.removed);
        assert_eq!(log.block_number, 12);
        assert_eq!(log.transaction_hash.as_deref(), Some("0xabc"));
    }
}

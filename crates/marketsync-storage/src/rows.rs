//! Typed rows read back from the store.

use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use marketsync_core::error::IndexerError;
use marketsync_core::types::{FeeWindowState, OrderState, OrderType, ReportingState, MAX_OUTCOMES};

fn storage(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRow {
    pub block_number: u64,
    pub block_hash: String,
    pub parent_hash: String,
    pub timestamp: i64,
    pub bulk_sync: bool,
}

impl BlockRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        Ok(Self {
            block_number: row.try_get::<i64, _>("block_number").map_err(storage)? as u64,
            block_hash: row.try_get("block_hash").map_err(storage)?,
            parent_hash: row.try_get("parent_hash").map_err(storage)?,
            timestamp: row.try_get("timestamp").map_err(storage)?,
            bulk_sync: row.try_get("bulk_sync").map_err(storage)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransactionHashRow {
    pub transaction_hash: String,
    pub block_number: u64,
    pub removed: bool,
}

impl TransactionHashRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        Ok(Self {
            transaction_hash: row.try_get("transaction_hash").map_err(storage)?,
            block_number: row.try_get::<i64, _>("block_number").map_err(storage)? as u64,
            removed: row.try_get("removed").map_err(storage)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UniverseRow {
    pub universe: String,
    pub parent_universe: Option<String>,
    pub forked: bool,
}

impl UniverseRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        Ok(Self {
            universe: row.try_get("universe").map_err(storage)?,
            parent_universe: row.try_get("parent_universe").map_err(storage)?,
            forked: row.try_get("forked").map_err(storage)?,
        })
    }
}

/// A market joined with its current reporting state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MarketRow {
    pub market_id: String,
    pub universe: String,
    pub creator: String,
    pub num_outcomes: u32,
    pub end_time: i64,
    pub fee_window: Option<String>,
    /// `None` only between insert and the first state row.
    pub reporting_state: Option<ReportingState>,
    pub needs_migration: bool,
    pub forking: bool,
    pub liquidity: i64,
    pub block_number: u64,
}

impl MarketRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        let state: Option<String> = row.try_get("reporting_state").map_err(storage)?;
        Ok(Self {
            market_id: row.try_get("market_id").map_err(storage)?,
            universe: row.try_get("universe").map_err(storage)?,
            creator: row.try_get("creator").map_err(storage)?,
            num_outcomes: row.try_get::<i64, _>("num_outcomes").map_err(storage)? as u32,
            end_time: row.try_get("end_time").map_err(storage)?,
            fee_window: row.try_get("fee_window").map_err(storage)?,
            reporting_state: state.map(|s| s.parse()).transpose()?,
            needs_migration: row.try_get("needs_migration").map_err(storage)?,
            forking: row.try_get("forking").map_err(storage)?,
            liquidity: row.try_get("liquidity").map_err(storage)?,
            block_number: row.try_get::<i64, _>("block_number").map_err(storage)? as u64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeeWindowRow {
    pub fee_window: String,
    pub universe: String,
    pub start_time: i64,
    pub end_time: i64,
    pub state: FeeWindowState,
    pub block_number: u64,
}

impl FeeWindowRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        let state: String = row.try_get("state").map_err(storage)?;
        Ok(Self {
            fee_window: row.try_get("fee_window").map_err(storage)?,
            universe: row.try_get("universe").map_err(storage)?,
            start_time: row.try_get("start_time").map_err(storage)?,
            end_time: row.try_get("end_time").map_err(storage)?,
            state: state.parse()?,
            block_number: row.try_get::<i64, _>("block_number").map_err(storage)? as u64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CrowdsourcerRow {
    pub crowdsourcer: String,
    pub market_id: String,
    pub fee_window: String,
    pub payout_key: String,
    pub size: String,
    /// `None` until the fee window ends or the crowdsourcer fills.
    pub completed: Option<bool>,
    pub block_number: u64,
}

impl CrowdsourcerRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        Ok(Self {
            crowdsourcer: row.try_get("crowdsourcer").map_err(storage)?,
            market_id: row.try_get("market_id").map_err(storage)?,
            fee_window: row.try_get("fee_window").map_err(storage)?,
            payout_key: row.try_get("payout_key").map_err(storage)?,
            size: row.try_get("size").map_err(storage)?,
            completed: row.try_get("completed").map_err(storage)?,
            block_number: row.try_get::<i64, _>("block_number").map_err(storage)? as u64,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutRow {
    pub market_id: String,
    pub payout_key: String,
    /// `payout0..payout7`, trailing `None` for absent outcomes.
    pub numerators: Vec<Option<String>>,
    pub is_invalid: bool,
    pub initial_report: bool,
    pub tentative_winning: bool,
    pub winning: Option<bool>,
}

impl PayoutRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        let numerators = (0..MAX_OUTCOMES)
            .map(|i| row.try_get::<Option<String>, _>(format!("payout{i}").as_str()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(storage)?;
        Ok(Self {
            market_id: row.try_get("market_id").map_err(storage)?,
            payout_key: row.try_get("payout_key").map_err(storage)?,
            numerators,
            is_invalid: row.try_get("is_invalid").map_err(storage)?,
            initial_report: row.try_get("initial_report").map_err(storage)?,
            tentative_winning: row.try_get("tentative_winning").map_err(storage)?,
            winning: row.try_get("winning").map_err(storage)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderRow {
    pub order_id: String,
    pub market_id: String,
    pub outcome: u32,
    pub order_type: OrderType,
    pub price: i64,
    pub amount: i64,
    pub order_state: OrderState,
    pub orphaned: bool,
    pub block_number: u64,
    pub transaction_hash: String,
}

impl OrderRow {
    pub(crate) fn from_row(row: &SqliteRow) -> Result<Self, IndexerError> {
        let order_type: String = row.try_get("order_type").map_err(storage)?;
        let order_state: String = row.try_get("order_state").map_err(storage)?;
        Ok(Self {
            order_id: row.try_get("order_id").map_err(storage)?,
            market_id: row.try_get("market_id").map_err(storage)?,
            outcome: row.try_get::<i64, _>("outcome").map_err(storage)? as u32,
            order_type: order_type.parse()?,
            price: row.try_get("price").map_err(storage)?,
            amount: row.try_get("amount").map_err(storage)?,
            order_state: order_state.parse()?,
            orphaned: row.try_get("orphaned").map_err(storage)?,
            block_number: row.try_get::<i64, _>("block_number").map_err(storage)? as u64,
            transaction_hash: row.try_get("transaction_hash").map_err(storage)?,
        })
    }
}

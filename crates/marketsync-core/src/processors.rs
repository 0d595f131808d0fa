//! Add/remove handlers for every registered event.
//!
//! Each `*_add` turns a log into the mutations that apply it; each
//! `*_remove` produces the inverse for a log reverted by a reorg.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::IndexerError;
use crate::handler::HandlerContext;
use crate::mutation::{Mutation, NewCrowdsourcer, NewFeeWindow, NewMarket, NewOrder, WriteBatch};
use crate::notify::Notification;
use crate::types::{EventLog, OrderType, PayoutSet, ReportingState};

// ─── Payloads ─────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UniverseCreated {
    parent_universe: Option<String>,
    child_universe: String,
}

#[derive(Debug, Deserialize)]
struct UniverseForked {
    universe: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MarketCreated {
    universe: String,
    market: String,
    market_creator: String,
    num_outcomes: u32,
    end_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeeWindowCreated {
    universe: String,
    fee_window: String,
    start_time: i64,
    end_time: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InitialReportSubmitted {
    market: String,
    payout_numerators: Vec<String>,
    #[serde(default)]
    invalid: bool,
    next_fee_window: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrowdsourcerCreated {
    market: String,
    dispute_crowdsourcer: String,
    fee_window: String,
    payout_numerators: Vec<String>,
    #[serde(default)]
    invalid: bool,
    size: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CrowdsourcerCompleted {
    market: String,
    dispute_crowdsourcer: String,
    fee_window: String,
    next_fee_window: String,
}

#[derive(Debug, Deserialize)]
struct MarketFinalized {
    universe: String,
    market: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCreated {
    market: String,
    order_id: String,
    outcome: u32,
    order_type: OrderType,
    price: i64,
    amount: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderCanceled {
    order_id: String,
}

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn payload<T: DeserializeOwned>(log: &EventLog) -> Result<T, IndexerError> {
    serde_json::from_value(log.payload.clone()).map_err(|e| {
        IndexerError::MalformedInput(format!(
            "{}.{} payload at block {}: {e}",
            log.contract_name, log.event_name, log.block_number
        ))
    })
}

fn transaction_hash(log: &EventLog) -> Result<String, IndexerError> {
    log.transaction_hash.clone().ok_or_else(|| {
        IndexerError::MalformedInput(format!(
            "null transactionHash for {}.{} at block {}; the node may be running in light mode",
            log.contract_name, log.event_name, log.block_number
        ))
    })
}

/// Every applied log records its transaction hash first.
fn recorded(log: &EventLog) -> Result<WriteBatch, IndexerError> {
    Ok(WriteBatch::new().with(Mutation::InsertTransactionHash {
        block_number: log.block_number,
        transaction_hash: transaction_hash(log)?,
    }))
}

fn payout_set(numerators: Vec<String>, invalid: bool) -> Result<PayoutSet, IndexerError> {
    let payout = PayoutSet { numerators, invalid };
    payout.validate()?;
    Ok(payout)
}

// ─── Universes ────────────────────────────────────────────────────────────────

pub fn universe_created_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: UniverseCreated = payload(log)?;
    Ok(recorded(log)?.with(Mutation::InsertUniverse {
        universe: p.child_universe,
        parent_universe: p.parent_universe,
    }))
}

pub fn universe_created_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: UniverseCreated = payload(log)?;
    Ok(WriteBatch::new().with(Mutation::DeleteUniverse {
        universe: p.child_universe,
    }))
}

pub fn universe_forked_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: UniverseForked = payload(log)?;
    Ok(recorded(log)?.with(Mutation::SetUniverseForked {
        universe: p.universe,
        forked: true,
    }))
}

pub fn universe_forked_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: UniverseForked = payload(log)?;
    Ok(WriteBatch::new().with(Mutation::SetUniverseForked {
        universe: p.universe,
        forked: false,
    }))
}

// ─── Markets ──────────────────────────────────────────────────────────────────

pub fn market_created_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: MarketCreated = payload(log)?;
    Ok(recorded(log)?
        .with(Mutation::InsertMarket(NewMarket {
            market_id: p.market.clone(),
            universe: p.universe,
            creator: p.market_creator,
            num_outcomes: p.num_outcomes,
            end_time: p.end_time,
            block_number: log.block_number,
        }))
        .with(Mutation::SetMarketState {
            market_id: p.market,
            state: ReportingState::PreReporting,
            block_number: log.block_number,
        }))
}

pub fn market_created_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: MarketCreated = payload(log)?;
    Ok(WriteBatch::new().with(Mutation::DeleteMarket { market_id: p.market }))
}

pub fn market_finalized_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: MarketFinalized = payload(log)?;
    Ok(recorded(log)?
        .with(Mutation::SetMarketState {
            market_id: p.market.clone(),
            state: ReportingState::Finalized,
            block_number: log.block_number,
        })
        .notify(Notification::MarketState {
            universe: p.universe,
            market_id: p.market,
            reporting_state: ReportingState::Finalized,
            fee_window: None,
        }))
}

pub fn market_finalized_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: MarketFinalized = payload(log)?;
    Ok(WriteBatch::new()
        .with(Mutation::RevertMarketState {
            market_id: p.market,
            block_number: log.block_number,
        })
        .notify(Notification::Log {
            event: crate::handler::EventName::MarketFinalized,
            log: log.clone(),
        }))
}

// ─── Fee windows ──────────────────────────────────────────────────────────────

pub fn fee_window_created_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: FeeWindowCreated = payload(log)?;
    if p.end_time <= p.start_time {
        return Err(IndexerError::MalformedInput(format!(
            "fee window {} ends ({}) before it starts ({})",
            p.fee_window, p.end_time, p.start_time
        )));
    }
    Ok(recorded(log)?.with(Mutation::InsertFeeWindow(NewFeeWindow {
        fee_window: p.fee_window,
        universe: p.universe,
        start_time: p.start_time,
        end_time: p.end_time,
        block_number: log.block_number,
    })))
}

pub fn fee_window_created_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: FeeWindowCreated = payload(log)?;
    Ok(WriteBatch::new().with(Mutation::DeleteFeeWindow {
        fee_window: p.fee_window,
    }))
}

// ─── Reporting & disputes ─────────────────────────────────────────────────────

pub fn initial_report_submitted_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: InitialReportSubmitted = payload(log)?;
    let payout = payout_set(p.payout_numerators, p.invalid)?;
    Ok(recorded(log)?
        .with(Mutation::InsertPayout {
            market_id: p.market.clone(),
            payout,
            initial_report: true,
        })
        .with(Mutation::SetMarketState {
            market_id: p.market.clone(),
            state: ReportingState::AwaitingNextWindow,
            block_number: log.block_number,
        })
        .with(Mutation::SetMarketFeeWindow {
            market_id: p.market.clone(),
            fee_window: Some(p.next_fee_window),
        })
        .with(Mutation::RecomputeTentativeWinning { market_id: p.market }))
}

pub fn initial_report_submitted_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: InitialReportSubmitted = payload(log)?;
    Ok(WriteBatch::new()
        .with(Mutation::RevertMarketState {
            market_id: p.market.clone(),
            block_number: log.block_number,
        })
        .with(Mutation::SetMarketFeeWindow {
            market_id: p.market.clone(),
            fee_window: None,
        })
        .with(Mutation::DeleteInitialReportPayout {
            market_id: p.market.clone(),
        })
        .with(Mutation::RecomputeTentativeWinning { market_id: p.market }))
}

pub fn crowdsourcer_created_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: CrowdsourcerCreated = payload(log)?;
    let payout = payout_set(p.payout_numerators, p.invalid)?;
    Ok(recorded(log)?
        .with(Mutation::InsertPayout {
            market_id: p.market.clone(),
            payout: payout.clone(),
            initial_report: false,
        })
        .with(Mutation::InsertCrowdsourcer(NewCrowdsourcer {
            crowdsourcer: p.dispute_crowdsourcer,
            market_id: p.market,
            fee_window: p.fee_window,
            payout,
            size: p.size,
            block_number: log.block_number,
        })))
}

pub fn crowdsourcer_created_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: CrowdsourcerCreated = payload(log)?;
    let payout = payout_set(p.payout_numerators, p.invalid)?;
    Ok(WriteBatch::new()
        .with(Mutation::DeleteCrowdsourcer {
            crowdsourcer: p.dispute_crowdsourcer,
        })
        .with(Mutation::DeletePayoutIfUnreferenced {
            market_id: p.market,
            payout_key: payout.key(),
        }))
}

pub fn crowdsourcer_completed_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: CrowdsourcerCompleted = payload(log)?;
    Ok(recorded(log)?
        .with(Mutation::SetCrowdsourcerCompleted {
            crowdsourcer: p.dispute_crowdsourcer,
            completed: Some(true),
        })
        .with(Mutation::SetMarketState {
            market_id: p.market.clone(),
            state: ReportingState::AwaitingNextWindow,
            block_number: log.block_number,
        })
        .with(Mutation::SetMarketFeeWindow {
            market_id: p.market.clone(),
            fee_window: Some(p.next_fee_window),
        })
        .with(Mutation::RecomputeTentativeWinning { market_id: p.market }))
}

pub fn crowdsourcer_completed_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: CrowdsourcerCompleted = payload(log)?;
    Ok(WriteBatch::new()
        .with(Mutation::SetCrowdsourcerCompleted {
            crowdsourcer: p.dispute_crowdsourcer,
            completed: None,
        })
        .with(Mutation::RevertMarketState {
            market_id: p.market.clone(),
            block_number: log.block_number,
        })
        .with(Mutation::SetMarketFeeWindow {
            market_id: p.market.clone(),
            fee_window: Some(p.fee_window),
        })
        .with(Mutation::RecomputeTentativeWinning { market_id: p.market }))
}

// ─── Orders ───────────────────────────────────────────────────────────────────

pub fn order_created_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: OrderCreated = payload(log)?;
    let tx_hash = transaction_hash(log)?;
    Ok(recorded(log)?.with(Mutation::InsertOrder(NewOrder {
        order_id: p.order_id,
        market_id: p.market,
        outcome: p.outcome,
        order_type: p.order_type,
        price: p.price,
        amount: p.amount,
        block_number: log.block_number,
        transaction_hash: tx_hash,
    })))
}

pub fn order_created_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: OrderCreated = payload(log)?;
    Ok(WriteBatch::new().with(Mutation::DeleteOrder { order_id: p.order_id }))
}

pub fn order_canceled_add(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: OrderCanceled = payload(log)?;
    Ok(recorded(log)?.with(Mutation::SetOrderCanceled {
        order_id: p.order_id,
        canceled: true,
    }))
}

pub fn order_canceled_remove(log: &EventLog, _ctx: &HandlerContext) -> Result<WriteBatch, IndexerError> {
    let p: OrderCanceled = payload(log)?;
    Ok(WriteBatch::new().with(Mutation::SetOrderCanceled {
        order_id: p.order_id,
        canceled: false,
    }))
}

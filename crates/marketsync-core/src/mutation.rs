//! Typed write commands produced by log handlers.
//!
//! Handlers never touch the database. They return a [`WriteBatch`], and the
//! storage crate's executor applies every batch of a block inside that
//! block's transaction, so log effects commit together with advancer output.

use crate::notify::Notification;
use crate::types::{OrderType, PayoutSet, ReportingState};

#[derive(Debug, Clone, PartialEq)]
pub struct NewMarket {
    pub market_id: String,
    pub universe: String,
    pub creator: String,
    pub num_outcomes: u32,
    pub end_time: i64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewFeeWindow {
    pub fee_window: String,
    pub universe: String,
    pub start_time: i64,
    pub end_time: i64,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewCrowdsourcer {
    pub crowdsourcer: String,
    pub market_id: String,
    pub fee_window: String,
    pub payout: PayoutSet,
    pub size: String,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewOrder {
    pub order_id: String,
    pub market_id: String,
    pub outcome: u32,
    pub order_type: OrderType,
    pub price: i64,
    pub amount: i64,
    pub block_number: u64,
    pub transaction_hash: String,
}

/// One store mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Insert unless the hash is already recorded.
    InsertTransactionHash {
        block_number: u64,
        transaction_hash: String,
    },
    InsertUniverse {
        universe: String,
        parent_universe: Option<String>,
    },
    DeleteUniverse {
        universe: String,
    },
    SetUniverseForked {
        universe: String,
        forked: bool,
    },
    InsertMarket(NewMarket),
    /// Deletes the market with its state history and payouts.
    DeleteMarket {
        market_id: String,
    },
    /// Append a state-history row and point the market at it.
    SetMarketState {
        market_id: String,
        state: ReportingState,
        block_number: u64,
    },
    /// Drop the newest state row written at `block_number` and repoint.
    RevertMarketState {
        market_id: String,
        block_number: u64,
    },
    SetMarketFeeWindow {
        market_id: String,
        fee_window: Option<String>,
    },
    InsertFeeWindow(NewFeeWindow),
    DeleteFeeWindow {
        fee_window: String,
    },
    InsertCrowdsourcer(NewCrowdsourcer),
    DeleteCrowdsourcer {
        crowdsourcer: String,
    },
    SetCrowdsourcerCompleted {
        crowdsourcer: String,
        completed: Option<bool>,
    },
    /// Insert unless a payout with the same key exists for the market.
    InsertPayout {
        market_id: String,
        payout: PayoutSet,
        initial_report: bool,
    },
    /// Delete the payout unless a crowdsourcer or the initial report still references it.
    DeletePayoutIfUnreferenced {
        market_id: String,
        payout_key: String,
    },
    DeleteInitialReportPayout {
        market_id: String,
    },
    /// Tentative winner := payout of the latest completed crowdsourcer, else the initial report.
    RecomputeTentativeWinning {
        market_id: String,
    },
    InsertOrder(NewOrder),
    DeleteOrder {
        order_id: String,
    },
    SetOrderCanceled {
        order_id: String,
        canceled: bool,
    },
}

impl Mutation {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InsertTransactionHash { .. } => "insert_transaction_hash",
            Self::InsertUniverse { .. } => "insert_universe",
            Self::DeleteUniverse { .. } => "delete_universe",
            Self::SetUniverseForked { .. } => "set_universe_forked",
            Self::InsertMarket(_) => "insert_market",
            Self::DeleteMarket { .. } => "delete_market",
            Self::SetMarketState { .. } => "set_market_state",
            Self::RevertMarketState { .. } => "revert_market_state",
            Self::SetMarketFeeWindow { .. } => "set_market_fee_window",
            Self::InsertFeeWindow(_) => "insert_fee_window",
            Self::DeleteFeeWindow { .. } => "delete_fee_window",
            Self::InsertCrowdsourcer(_) => "insert_crowdsourcer",
            Self::DeleteCrowdsourcer { .. } => "delete_crowdsourcer",
            Self::SetCrowdsourcerCompleted { .. } => "set_crowdsourcer_completed",
            Self::InsertPayout { .. } => "insert_payout",
            Self::DeletePayoutIfUnreferenced { .. } => "delete_payout_if_unreferenced",
            Self::DeleteInitialReportPayout { .. } => "delete_initial_report_payout",
            Self::RecomputeTentativeWinning { .. } => "recompute_tentative_winning",
            Self::InsertOrder(_) => "insert_order",
            Self::DeleteOrder { .. } => "delete_order",
            Self::SetOrderCanceled { .. } => "set_order_canceled",
        }
    }
}

/// The deferred effect of one log: mutations plus notifications to publish
/// once the enclosing unit commits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    pub mutations: Vec<Mutation>,
    pub notifications: Vec<Notification>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mutation: Mutation) -> &mut Self {
        self.mutations.push(mutation);
        self
    }

    pub fn with(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn notify(mut self, notification: Notification) -> Self {
        self.notifications.push(notification);
        self
    }

    /// Append another batch, keeping order.
    pub fn extend(&mut self, other: WriteBatch) {
        self.mutations.extend(other.mutations);
        self.notifications.extend(other.notifications);
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty() && self.notifications.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }
}

//! Static log-handler registry and dispatcher.
//!
//! Every decoded log is resolved by its `(contract, event)` names to a
//! [`LogProcessor`]: a pair of plain functions, one applying the log and one
//! reverting it. Names outside the closed set below resolve to `None` and the
//! log is skipped, so new contract events never break an older indexer.

use std::fmt;

use serde::Serialize;

use crate::error::IndexerError;
use crate::mutation::WriteBatch;
use crate::notify::Notification;
use crate::processors;
use crate::types::EventLog;

/// Contracts whose events are indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Contract {
    Augur,
    Universe,
}

impl Contract {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "Augur" => Some(Self::Augur),
            "Universe" => Some(Self::Universe),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Augur => "Augur",
            Self::Universe => "Universe",
        }
    }
}

/// Events with a registered handler pair. Also used as the notification kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EventName {
    UniverseCreated,
    UniverseForked,
    MarketCreated,
    FeeWindowCreated,
    InitialReportSubmitted,
    DisputeCrowdsourcerCreated,
    DisputeCrowdsourcerCompleted,
    MarketFinalized,
    OrderCreated,
    OrderCanceled,
}

impl EventName {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "UniverseCreated" => Self::UniverseCreated,
            "UniverseForked" => Self::UniverseForked,
            "MarketCreated" => Self::MarketCreated,
            "FeeWindowCreated" => Self::FeeWindowCreated,
            "InitialReportSubmitted" => Self::InitialReportSubmitted,
            "DisputeCrowdsourcerCreated" => Self::DisputeCrowdsourcerCreated,
            "DisputeCrowdsourcerCompleted" => Self::DisputeCrowdsourcerCompleted,
            "MarketFinalized" => Self::MarketFinalized,
            "OrderCreated" => Self::OrderCreated,
            "OrderCanceled" => Self::OrderCanceled,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::UniverseCreated => "UniverseCreated",
            Self::UniverseForked => "UniverseForked",
            Self::MarketCreated => "MarketCreated",
            Self::FeeWindowCreated => "FeeWindowCreated",
            Self::InitialReportSubmitted => "InitialReportSubmitted",
            Self::DisputeCrowdsourcerCreated => "DisputeCrowdsourcerCreated",
            Self::DisputeCrowdsourcerCompleted => "DisputeCrowdsourcerCompleted",
            Self::MarketFinalized => "MarketFinalized",
            Self::OrderCreated => "OrderCreated",
            Self::OrderCanceled => "OrderCanceled",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Context shared by all handlers of one block.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub network_id: String,
    pub block_number: u64,
    /// Effective time the block is applied at.
    pub timestamp: i64,
}

pub type HandlerFn = fn(&EventLog, &HandlerContext) -> Result<WriteBatch, IndexerError>;

/// The add/remove handler pair for one event.
pub struct LogProcessor {
    pub add: HandlerFn,
    pub remove: HandlerFn,
    /// The handler publishes its own notification instead of the generic log one.
    pub no_auto_emit: bool,
}

impl fmt::Debug for LogProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogProcessor")
            .field("no_auto_emit", &self.no_auto_emit)
            .finish_non_exhaustive()
    }
}

macro_rules! processor {
    ($name:ident, $add:path, $remove:path) => {
        processor!($name, $add, $remove, false);
    };
    ($name:ident, $add:path, $remove:path, $no_auto_emit:expr) => {
        static $name: LogProcessor = LogProcessor {
            add: $add,
            remove: $remove,
            no_auto_emit: $no_auto_emit,
        };
    };
}

processor!(UNIVERSE_CREATED, processors::universe_created_add, processors::universe_created_remove);
processor!(UNIVERSE_FORKED, processors::universe_forked_add, processors::universe_forked_remove);
processor!(MARKET_CREATED, processors::market_created_add, processors::market_created_remove);
processor!(FEE_WINDOW_CREATED, processors::fee_window_created_add, processors::fee_window_created_remove);
processor!(
    INITIAL_REPORT_SUBMITTED,
    processors::initial_report_submitted_add,
    processors::initial_report_submitted_remove
);
processor!(
    CROWDSOURCER_CREATED,
    processors::crowdsourcer_created_add,
    processors::crowdsourcer_created_remove
);
processor!(
    CROWDSOURCER_COMPLETED,
    processors::crowdsourcer_completed_add,
    processors::crowdsourcer_completed_remove
);
processor!(
    MARKET_FINALIZED,
    processors::market_finalized_add,
    processors::market_finalized_remove,
    true
);
processor!(ORDER_CREATED, processors::order_created_add, processors::order_created_remove);
processor!(ORDER_CANCELED, processors::order_canceled_add, processors::order_canceled_remove);

/// Every registered `(contract, event)` pair.
pub const REGISTERED: &[(Contract, EventName)] = &[
    (Contract::Augur, EventName::UniverseCreated),
    (Contract::Augur, EventName::MarketCreated),
    (Contract::Augur, EventName::FeeWindowCreated),
    (Contract::Augur, EventName::InitialReportSubmitted),
    (Contract::Augur, EventName::DisputeCrowdsourcerCreated),
    (Contract::Augur, EventName::DisputeCrowdsourcerCompleted),
    (Contract::Augur, EventName::MarketFinalized),
    (Contract::Augur, EventName::OrderCreated),
    (Contract::Augur, EventName::OrderCanceled),
    (Contract::Universe, EventName::UniverseForked),
];

/// Look up the handler pair for a tag pair. Unregistered pairs yield `None`.
pub fn processor_for(contract: Contract, event: EventName) -> Option<&'static LogProcessor> {
    use Contract::*;
    use EventName::*;
    Some(match (contract, event) {
        (Augur, UniverseCreated) => &UNIVERSE_CREATED,
        (Augur, MarketCreated) => &MARKET_CREATED,
        (Augur, FeeWindowCreated) => &FEE_WINDOW_CREATED,
        (Augur, InitialReportSubmitted) => &INITIAL_REPORT_SUBMITTED,
        (Augur, DisputeCrowdsourcerCreated) => &CROWDSOURCER_CREATED,
        (Augur, DisputeCrowdsourcerCompleted) => &CROWDSOURCER_COMPLETED,
        (Augur, MarketFinalized) => &MARKET_FINALIZED,
        (Augur, OrderCreated) => &ORDER_CREATED,
        (Augur, OrderCanceled) => &ORDER_CANCELED,
        (Universe, UniverseForked) => &UNIVERSE_FORKED,
        _ => return None,
    })
}

/// Resolve a log by its string names.
pub fn resolve(log: &EventLog) -> Option<(EventName, &'static LogProcessor)> {
    let contract = Contract::parse(&log.contract_name)?;
    let event = EventName::parse(&log.event_name)?;
    processor_for(contract, event).map(|p| (event, p))
}

/// Run the handler selected by `log.removed` and return its deferred writes.
///
/// Returns `Ok(None)` for logs with no registered handler. Unless the handler
/// is `no_auto_emit`, the batch starts with a [`Notification::Log`].
pub fn dispatch(log: &EventLog, ctx: &HandlerContext) -> Result<Option<WriteBatch>, IndexerError> {
    let Some((event, processor)) = resolve(log) else {
        tracing::trace!(
            contract = %log.contract_name,
            event = %log.event_name,
            "no handler registered, skipping log"
        );
        return Ok(None);
    };

    let handler = if log.removed {
        processor.remove
    } else {
        processor.add
    };
    let mut batch = handler(log, ctx)?;

    if !processor.no_auto_emit {
        batch.notifications.insert(
            0,
            Notification::Log {
                event,
                log: log.clone(),
            },
        );
    }
    Ok(Some(batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::Mutation;
    use serde_json::json;

    fn ctx() -> HandlerContext {
        HandlerContext {
            network_id: "1".into(),
            block_number: 10,
            timestamp: 1_000,
        }
    }

    fn log(contract: &str, event: &str, removed: bool, payload: serde_json::Value) -> EventLog {
        EventLog {
            contract_name: contract.into(),
            event_name: event.into(),
            removed,
            block_number: 10,
            transaction_hash: Some("0xtx".into()),
            log_index: 0,
            payload,
        }
    }

    #[test]
    fn every_registered_pair_resolves() {
        for (contract, event) in REGISTERED {
            assert!(processor_for(*contract, *event).is_some(), "{contract:?}.{event}");
        }
        assert!(processor_for(Contract::Universe, EventName::MarketCreated).is_none());
    }

    #[test]
    fn unknown_names_are_skipped() {
        let l = log("Augur", "TokensMinted", false, json!({}));
        assert!(dispatch(&l, &ctx()).unwrap().is_none());
        let l = log("ZeroXTrade", "MarketCreated", false, json!({}));
        assert!(dispatch(&l, &ctx()).unwrap().is_none());
    }

    #[test]
    fn removed_flag_selects_remove_handler() {
        let payload = json!({ "orderId": "0xo" });
        let added = dispatch(&log("Augur", "OrderCanceled", false, payload.clone()), &ctx())
            .unwrap()
            .unwrap();
        let removed = dispatch(&log("Augur", "OrderCanceled", true, payload), &ctx())
            .unwrap()
            .unwrap();
        assert!(added.mutations.contains(&Mutation::SetOrderCanceled {
            order_id: "0xo".into(),
            canceled: true
        }));
        assert_eq!(
            removed.mutations,
            vec![Mutation::SetOrderCanceled {
                order_id: "0xo".into(),
                canceled: false
            }]
        );
    }

    #[test]
    fn auto_emit_prepends_log_notification() {
        let l = log("Augur", "OrderCanceled", false, json!({ "orderId": "0xo" }));
        let batch = dispatch(&l, &ctx()).unwrap().unwrap();
        assert_eq!(
            batch.notifications.first(),
            Some(&Notification::Log {
                event: EventName::OrderCanceled,
                log: l.clone()
            })
        );
    }

    #[test]
    fn no_auto_emit_handler_publishes_its_own_event() {
        let l = log("Augur", "MarketFinalized", false, json!({ "universe": "0xu", "market": "0xm" }));
        let batch = dispatch(&l, &ctx()).unwrap().unwrap();
        assert_eq!(batch.notifications.len(), 1);
        assert!(matches!(
            batch.notifications[0],
            Notification::MarketState { .. }
        ));
    }
}

//! Publish/subscribe channel for state-change and raw-log notifications.
//!
//! The orchestrator owns one [`NotificationBus`] and hands clones to the
//! components that publish. Subscribers (the API layer) hold a
//! `broadcast::Receiver` for as long as they are bound.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::handler::EventName;
use crate::types::{EventLog, ReportingState};

/// Lifecycle milestones of the node, consumed by status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlMessage {
    BulkSyncStarted,
    BulkSyncFinished,
    BulkOrphansCheckStarted,
    BulkOrphansCheckFinished,
}

/// A notification for external subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notification {
    /// A market changed reporting state.
    #[serde(rename_all = "camelCase")]
    MarketState {
        universe: String,
        market_id: String,
        reporting_state: ReportingState,
        #[serde(skip_serializing_if = "Option::is_none")]
        fee_window: Option<String>,
    },
    /// A registered log was applied or reverted.
    Log { event: EventName, log: EventLog },
    /// An open order can no longer be filled.
    #[serde(rename_all = "camelCase")]
    OrderOrphaned { market_id: String, order_id: String },
    /// The open-order liquidity of a market changed.
    #[serde(rename_all = "camelCase")]
    MarketLiquidity { market_id: String, liquidity: i64 },
    Control { message: ControlMessage },
}

/// Cloneable handle to the broadcast channel.
#[derive(Debug, Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Notification>,
}

impl NotificationBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all notifications published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    /// Publish to current subscribers. Having none is not an error.
    pub fn publish(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            tracing::trace!("notification dropped, no subscribers");
        }
    }

    pub fn publish_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for n in notifications {
            self.publish(n);
        }
    }

    pub fn control(&self, message: ControlMessage) {
        self.publish(Notification::Control { message });
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

//! marketsync-core — domain model for the market-state sync engine.
//!
//! # Architecture
//!
//! ```text
//! EventLog ─▶ handler::dispatch ─▶ processors::*_add / *_remove
//!                                        │
//!                                        ▼
//!                                  WriteBatch { mutations, notifications }
//!                                        │  (applied by marketsync-storage)
//!                                        ▼
//!                                  NotificationBus ─▶ subscribers
//! ```
//!
//! Nothing in this crate performs I/O; the storage and node crates do.

pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod mutation;
pub mod notify;
pub mod processors;
pub mod status;
pub mod types;

pub use clock::{BlockClock, Clock, OverrideClock};
pub use config::NodeConfig;
pub use error::IndexerError;
pub use handler::{dispatch, Contract, EventName, HandlerContext, LogProcessor};
pub use mutation::{Mutation, WriteBatch};
pub use notify::{ControlMessage, Notification, NotificationBus};
pub use status::{NodeState, SyncStatus};
pub use types::{
    BlockDirection, BlockSummary, BlockUnit, EventLog, FeeWindowState, IndexPhase, OrderState,
    OrderType, PayoutSet, ReportingState,
};

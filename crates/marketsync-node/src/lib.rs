//! marketsync-node — the sync pipeline around the store.
//!
//! ```text
//! ChainClient ─▶ BulkSync ──────────────┐
//!      │                                ▼
//!      └─▶ subscribe ─▶ Sequencer ─▶ BlockQueue ─▶ BlockProcessor ─▶ Store
//!                                                        │
//!                                                        ▼
//!                                                 NotificationBus ─▶ ApiLayer
//! ```
//!
//! [`Orchestrator`] wires these together; [`Supervisor`] restarts it after
//! fatal errors.

pub mod api;
pub mod builder;
pub mod bulk_sync;
pub mod chain;
pub mod orchestrator;
pub mod processor;
pub mod queue;
pub mod retry;
#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;
pub mod sequencer;
pub mod supervisor;

pub use api::{ApiContext, ApiLayer};
pub use builder::NodeBuilder;
pub use bulk_sync::BulkSync;
pub use chain::{BlockWithLogs, ChainClient, ChainFetcher, ContractAddresses, UnitStream};
pub use orchestrator::{Orchestrator, SyncedBlockInfo};
pub use processor::{BlockProcessor, UnitProcessor};
pub use queue::{BlockQueue, ErrorCallback};
pub use retry::{ChainRequest, RetryConfig, RetryPolicy};
#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedChain;
pub use sequencer::Sequencer;
pub use supervisor::{Supervised, Supervisor};

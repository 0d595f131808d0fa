//! marketsync-storage — the SQLite side of MarketSync.
//!
//! - [`sqlite`]: the [`Store`]: schema, typed reads, block writes
//! - [`apply`]: executes handler [`WriteBatch`](marketsync_core::WriteBatch)es
//! - [`advance`]: time-driven market and fee-window lifecycle passes
//! - [`reconcile`]: post-commit orphaned-order and liquidity passes
//! - [`snapshot`]: warp-sync export/import and database file management

pub mod advance;
pub mod apply;
pub mod reconcile;
pub mod rows;
pub mod snapshot;
pub mod sqlite;

pub use advance::StateAdvancer;
pub use reconcile::{Reconciler, StoreReconciler};
pub use snapshot::{export_snapshot, import_snapshot, WarpFileName};
pub use sqlite::{Store, SCHEMA_VERSION};

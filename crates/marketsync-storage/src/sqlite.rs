//! SQLite store for MarketSync.
//!
//! Holds the mirrored chain state (blocks, transaction hashes) and the derived
//! domain state (universes, markets and their state history, fee windows,
//! crowdsourcers, payouts, orders) in a single SQLite file, opened with `sqlx`
//! in WAL mode.
//!
//! # Usage
//! ```rust,no_run
//! use marketsync_storage::sqlite::Store;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = Store::open("./marketsync-1-1.db", "1").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = Store::in_memory("1").await?;
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::{debug, info};

use marketsync_core::error::IndexerError;
use marketsync_core::types::{BlockSummary, ReportingState};

use crate::rows::{
    BlockRow, CrowdsourcerRow, FeeWindowRow, MarketRow, OrderRow, PayoutRow, TransactionHashRow,
    UniverseRow,
};

/// Version of the table layout below. Part of database and snapshot file names.
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) fn storage(e: sqlx::Error) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS network_info (
        id             INTEGER PRIMARY KEY CHECK (id = 1),
        network_id     TEXT    NOT NULL,
        schema_version INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS blocks (
        block_number INTEGER PRIMARY KEY,
        block_hash   TEXT    NOT NULL,
        parent_hash  TEXT    NOT NULL,
        timestamp    INTEGER NOT NULL,
        bulk_sync    INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS transaction_hashes (
        transaction_hash TEXT    PRIMARY KEY,
        block_number     INTEGER NOT NULL,
        removed          INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_transaction_hashes_block ON transaction_hashes (block_number)",
    "CREATE TABLE IF NOT EXISTS universes (
        universe        TEXT    PRIMARY KEY,
        parent_universe TEXT,
        forked          INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS markets (
        market_id       TEXT    PRIMARY KEY,
        universe        TEXT    NOT NULL,
        creator         TEXT    NOT NULL,
        num_outcomes    INTEGER NOT NULL,
        end_time        INTEGER NOT NULL,
        fee_window      TEXT,
        market_state_id INTEGER,
        needs_migration INTEGER NOT NULL DEFAULT 0,
        forking         INTEGER NOT NULL DEFAULT 0,
        liquidity       INTEGER NOT NULL DEFAULT 0,
        block_number    INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS market_state (
        market_state_id INTEGER PRIMARY KEY AUTOINCREMENT,
        market_id       TEXT    NOT NULL,
        reporting_state TEXT    NOT NULL,
        block_number    INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_market_state_market ON market_state (market_id)",
    "CREATE TABLE IF NOT EXISTS fee_windows (
        fee_window   TEXT    PRIMARY KEY,
        universe     TEXT    NOT NULL,
        start_time   INTEGER NOT NULL,
        end_time     INTEGER NOT NULL,
        state        TEXT    NOT NULL,
        block_number INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS crowdsourcers (
        crowdsourcer TEXT    PRIMARY KEY,
        market_id    TEXT    NOT NULL,
        fee_window   TEXT    NOT NULL,
        payout_key   TEXT    NOT NULL,
        size         TEXT    NOT NULL,
        completed    INTEGER,
        block_number INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_crowdsourcers_fee_window ON crowdsourcers (fee_window)",
    "CREATE TABLE IF NOT EXISTS payouts (
        market_id         TEXT    NOT NULL,
        payout_key        TEXT    NOT NULL,
        payout0 TEXT, payout1 TEXT, payout2 TEXT, payout3 TEXT,
        payout4 TEXT, payout5 TEXT, payout6 TEXT, payout7 TEXT,
        is_invalid        INTEGER NOT NULL DEFAULT 0,
        initial_report    INTEGER NOT NULL DEFAULT 0,
        tentative_winning INTEGER NOT NULL DEFAULT 0,
        winning           INTEGER,
        PRIMARY KEY (market_id, payout_key)
    )",
    "CREATE TABLE IF NOT EXISTS orders (
        order_id         TEXT    PRIMARY KEY,
        market_id        TEXT    NOT NULL,
        outcome          INTEGER NOT NULL,
        order_type       TEXT    NOT NULL,
        price            INTEGER NOT NULL,
        amount           INTEGER NOT NULL,
        order_state      TEXT    NOT NULL,
        orphaned         INTEGER NOT NULL DEFAULT 0,
        block_number     INTEGER NOT NULL,
        transaction_hash TEXT    NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_orders_market ON orders (market_id)",
];

const MARKET_SELECT: &str = "SELECT m.market_id, m.universe, m.creator, m.num_outcomes, m.end_time,
            m.fee_window, s.reporting_state, m.needs_migration, m.forking, m.liquidity,
            m.block_number
     FROM markets m LEFT JOIN market_state s ON s.market_state_id = m.market_state_id";

/// The SQLite-backed store. Cloning shares the underlying pool.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    network_id: String,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (or create) the database file at `path` for `network_id`.
    ///
    /// Fails if the file was created for a different network.
    pub async fn open(path: impl AsRef<Path>, network_id: &str) -> Result<Self, IndexerError> {
        let path = path.as_ref();
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(false);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(storage)?;

        let store = Self {
            pool,
            network_id: network_id.to_string(),
            path: Some(path.to_path_buf()),
        };
        store.init_schema().await?;
        info!(path = %path.display(), network_id, "store opened");
        Ok(store)
    }

    /// Open an in-memory database. All data is lost when the store is dropped.
    pub async fn in_memory(network_id: &str) -> Result<Self, IndexerError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(storage)?;
        // One connection: every pooled connection would otherwise get its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(storage)?;

        let store = Self {
            pool,
            network_id: network_id.to_string(),
            path: None,
        };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(storage)?;
        }

        let existing = sqlx::query("SELECT network_id, schema_version FROM network_info WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        match existing {
            Some(row) => {
                let network: String = row.get("network_id");
                if network != self.network_id {
                    return Err(IndexerError::Storage(format!(
                        "database belongs to network {network}, not {}",
                        self.network_id
                    )));
                }
            }
            None => {
                sqlx::query("INSERT INTO network_info (id, network_id, schema_version) VALUES (1, ?, ?)")
                    .bind(&self.network_id)
                    .bind(SCHEMA_VERSION as i64)
                    .execute(&self.pool)
                    .await
                    .map_err(storage)?;
            }
        }
        debug!(network_id = %self.network_id, "schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn network_id(&self) -> &str {
        &self.network_id
    }

    /// File backing this store; `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Begin the transaction a single block unit runs in.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, IndexerError> {
        self.pool.begin().await.map_err(storage)
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    // ─── Blocks ──────────────────────────────────────────────────────────────────

    /// Highest stored block number, `None` for an empty store.
    pub async fn highest_block(&self) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query("SELECT MAX(block_number) AS highest FROM blocks")
            .fetch_one(&self.pool)
            .await
            .map_err(storage)?;
        let highest: Option<i64> = row.get("highest");
        Ok(highest.map(|n| n as u64))
    }

    pub async fn block(&self, number: u64) -> Result<Option<BlockRow>, IndexerError> {
        sqlx::query("SELECT * FROM blocks WHERE block_number = ?")
            .bind(number as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .as_ref()
            .map(BlockRow::from_row)
            .transpose()
    }

    pub async fn blocks(&self) -> Result<Vec<BlockRow>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM blocks ORDER BY block_number")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(BlockRow::from_row).collect()
    }

    pub async fn transaction_hash(&self, hash: &str) -> Result<Option<TransactionHashRow>, IndexerError> {
        sqlx::query("SELECT * FROM transaction_hashes WHERE transaction_hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .as_ref()
            .map(TransactionHashRow::from_row)
            .transpose()
    }

    pub async fn transaction_hashes(&self) -> Result<Vec<TransactionHashRow>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM transaction_hashes ORDER BY block_number, transaction_hash")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(TransactionHashRow::from_row).collect()
    }

    // ─── Domain reads ────────────────────────────────────────────────────────────

    pub async fn universe(&self, universe: &str) -> Result<Option<UniverseRow>, IndexerError> {
        sqlx::query("SELECT * FROM universes WHERE universe = ?")
            .bind(universe)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .as_ref()
            .map(UniverseRow::from_row)
            .transpose()
    }

    pub async fn market(&self, market_id: &str) -> Result<Option<MarketRow>, IndexerError> {
        sqlx::query(&format!("{MARKET_SELECT} WHERE m.market_id = ?"))
            .bind(market_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .as_ref()
            .map(MarketRow::from_row)
            .transpose()
    }

    pub async fn markets(&self) -> Result<Vec<MarketRow>, IndexerError> {
        let rows = sqlx::query(&format!("{MARKET_SELECT} ORDER BY m.market_id"))
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(MarketRow::from_row).collect()
    }

    /// Every state a market has been in, oldest first.
    pub async fn market_state_history(&self, market_id: &str) -> Result<Vec<ReportingState>, IndexerError> {
        let rows = sqlx::query(
            "SELECT reporting_state FROM market_state WHERE market_id = ? ORDER BY market_state_id",
        )
        .bind(market_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage)?;
        rows.iter()
            .map(|r| r.get::<String, _>("reporting_state").parse())
            .collect()
    }

    pub async fn fee_window(&self, fee_window: &str) -> Result<Option<FeeWindowRow>, IndexerError> {
        sqlx::query("SELECT * FROM fee_windows WHERE fee_window = ?")
            .bind(fee_window)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .as_ref()
            .map(FeeWindowRow::from_row)
            .transpose()
    }

    pub async fn crowdsourcer(&self, crowdsourcer: &str) -> Result<Option<CrowdsourcerRow>, IndexerError> {
        sqlx::query("SELECT * FROM crowdsourcers WHERE crowdsourcer = ?")
            .bind(crowdsourcer)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .as_ref()
            .map(CrowdsourcerRow::from_row)
            .transpose()
    }

    pub async fn payouts(&self, market_id: &str) -> Result<Vec<PayoutRow>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM payouts WHERE market_id = ? ORDER BY payout_key")
            .bind(market_id)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(PayoutRow::from_row).collect()
    }

    pub async fn order(&self, order_id: &str) -> Result<Option<OrderRow>, IndexerError> {
        sqlx::query("SELECT * FROM orders WHERE order_id = ?")
            .bind(order_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?
            .as_ref()
            .map(OrderRow::from_row)
            .transpose()
    }

    pub async fn orders(&self) -> Result<Vec<OrderRow>, IndexerError> {
        let rows = sqlx::query("SELECT * FROM orders ORDER BY order_id")
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(OrderRow::from_row).collect()
    }
}

// ─── Block writes (inside a unit's transaction) ───────────────────────────────

/// Insert or overwrite the row for `block.number`.
pub async fn upsert_block(
    conn: &mut SqliteConnection,
    block: &BlockSummary,
    timestamp: i64,
    bulk_sync: bool,
) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO blocks (block_number, block_hash, parent_hash, timestamp, bulk_sync)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT (block_number) DO UPDATE SET
            block_hash  = excluded.block_hash,
            parent_hash = excluded.parent_hash,
            timestamp   = excluded.timestamp,
            bulk_sync   = excluded.bulk_sync",
    )
    .bind(block.number as i64)
    .bind(&block.hash)
    .bind(&block.parent_hash)
    .bind(timestamp)
    .bind(bulk_sync)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(())
}

/// Flag the block's transaction hashes as removed and delete the block row.
pub async fn remove_block(conn: &mut SqliteConnection, number: u64) -> Result<(), IndexerError> {
    sqlx::query("UPDATE transaction_hashes SET removed = 1 WHERE block_number = ?")
        .bind(number as i64)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    sqlx::query("DELETE FROM blocks WHERE block_number = ?")
        .bind(number as i64)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

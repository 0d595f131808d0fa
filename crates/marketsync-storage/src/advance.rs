//! Time-driven market and fee-window lifecycle.
//!
//! [`StateAdvancer::advance`] runs once per added block, inside the block's
//! transaction and before any of its logs are applied. Each pass selects the
//! rows whose predicate holds at `now`; a row already moved on no longer
//! matches, so re-running a pass against advanced state changes nothing.
//!
//! Markets in a forked universe are never touched.

use sqlx::{Row, SqliteConnection};
use tracing::debug;

use marketsync_core::error::IndexerError;
use marketsync_core::mutation::Mutation;
use marketsync_core::notify::Notification;
use marketsync_core::types::{FeeWindowState, ReportingState};

use crate::apply::apply_mutation;
use crate::sqlite::storage;

/// Default time a designated reporter has after market end: 3 days.
pub const DEFAULT_DESIGNATED_REPORTING_DURATION_SECS: i64 = 3 * 24 * 60 * 60;

/// Result of recomputing fee-window states at one timestamp.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeeWindowChanges {
    /// Upcoming windows that became current.
    pub newly_active: Vec<String>,
    /// Windows that became past.
    pub expired: Vec<String>,
}

impl FeeWindowChanges {
    pub fn is_empty(&self) -> bool {
        self.newly_active.is_empty() && self.expired.is_empty()
    }
}

struct Candidate {
    market_id: String,
    universe: String,
    fee_window: Option<String>,
}

/// Runs the lifecycle passes.
#[derive(Debug, Clone)]
pub struct StateAdvancer {
    designated_reporting_duration_secs: i64,
}

impl Default for StateAdvancer {
    fn default() -> Self {
        Self::new(DEFAULT_DESIGNATED_REPORTING_DURATION_SECS)
    }
}

impl StateAdvancer {
    pub fn new(designated_reporting_duration_secs: i64) -> Self {
        Self {
            designated_reporting_duration_secs,
        }
    }

    /// Run every pass at effective time `now` for block `block_number`.
    ///
    /// Returns the market-state notifications to publish after commit.
    pub async fn advance(
        &self,
        conn: &mut SqliteConnection,
        now: i64,
        block_number: u64,
    ) -> Result<Vec<Notification>, IndexerError> {
        let mut notifications = Vec::new();

        // 1. Reaching end time.
        let reached = self
            .candidates(
                conn,
                "s.reporting_state = ? AND m.end_time < ?",
                ReportingState::PreReporting,
                now,
            )
            .await?;
        for market in reached {
            notifications.push(
                transition(conn, market, ReportingState::DesignatedReporting, block_number).await?,
            );
        }

        // 2. Designated reporter missed the deadline.
        let missed = self
            .candidates(
                conn,
                "s.reporting_state = ? AND m.end_time < ?",
                ReportingState::DesignatedReporting,
                now - self.designated_reporting_duration_secs,
            )
            .await?;
        for market in missed {
            notifications.push(transition(conn, market, ReportingState::OpenReporting, block_number).await?);
        }

        // 3. Fee windows.
        notifications.extend(self.advance_fee_windows(conn, now, block_number).await?);

        if !notifications.is_empty() {
            debug!(block_number, now, transitions = notifications.len(), "lifecycle advanced");
        }
        Ok(notifications)
    }

    async fn advance_fee_windows(
        &self,
        conn: &mut SqliteConnection,
        now: i64,
        block_number: u64,
    ) -> Result<Vec<Notification>, IndexerError> {
        let changes = update_fee_windows(conn, now).await?;
        if changes.is_empty() {
            return Ok(Vec::new());
        }
        let mut notifications = Vec::new();

        // a. Crowdsourcers that never filled before their window ended.
        for fee_window in &changes.expired {
            sqlx::query("UPDATE crowdsourcers SET completed = 0 WHERE completed IS NULL AND fee_window = ?")
                .bind(fee_window)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }

        // b. Markets whose dispute window ended without a new dispute.
        for fee_window in &changes.expired {
            let rows = sqlx::query(
                "SELECT m.market_id, m.universe, m.fee_window
                 FROM markets m
                 JOIN market_state s ON s.market_state_id = m.market_state_id
                 LEFT JOIN universes u ON u.universe = m.universe
                 WHERE m.fee_window = ?
                   AND s.reporting_state IN (?, ?)
                   AND m.forking = 0 AND m.needs_migration = 0
                   AND COALESCE(u.forked, 0) = 0
                 ORDER BY m.market_id",
            )
            .bind(fee_window)
            .bind(ReportingState::CrowdsourcingDispute.as_str())
            .bind(ReportingState::AwaitingNextWindow.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(storage)?;

            for row in rows {
                let market = candidate(&row);
                sqlx::query("UPDATE payouts SET winning = tentative_winning WHERE market_id = ?")
                    .bind(&market.market_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(storage)?;
                notifications.push(
                    transition(conn, market, ReportingState::AwaitingFinalization, block_number).await?,
                );
            }
        }

        // c. Markets waiting on a window that just opened.
        for fee_window in &changes.newly_active {
            let rows = sqlx::query(
                "SELECT m.market_id, m.universe, m.fee_window
                 FROM markets m
                 JOIN market_state s ON s.market_state_id = m.market_state_id
                 LEFT JOIN universes u ON u.universe = m.universe
                 WHERE m.fee_window = ?
                   AND s.reporting_state = ?
                   AND COALESCE(u.forked, 0) = 0
                 ORDER BY m.market_id",
            )
            .bind(fee_window)
            .bind(ReportingState::AwaitingNextWindow.as_str())
            .fetch_all(&mut *conn)
            .await
            .map_err(storage)?;

            for row in rows {
                let market = candidate(&row);
                notifications.push(
                    transition(conn, market, ReportingState::CrowdsourcingDispute, block_number).await?,
                );
            }
        }

        Ok(notifications)
    }

    async fn candidates(
        &self,
        conn: &mut SqliteConnection,
        predicate: &str,
        state: ReportingState,
        threshold: i64,
    ) -> Result<Vec<Candidate>, IndexerError> {
        let sql = format!(
            "SELECT m.market_id, m.universe, m.fee_window
             FROM markets m
             JOIN market_state s ON s.market_state_id = m.market_state_id
             LEFT JOIN universes u ON u.universe = m.universe
             WHERE {predicate} AND COALESCE(u.forked, 0) = 0
             ORDER BY m.market_id"
        );
        let rows = sqlx::query(&sql)
            .bind(state.as_str())
            .bind(threshold)
            .fetch_all(&mut *conn)
            .await
            .map_err(storage)?;
        Ok(rows.iter().map(candidate).collect())
    }
}

fn candidate(row: &sqlx::sqlite::SqliteRow) -> Candidate {
    Candidate {
        market_id: row.get("market_id"),
        universe: row.get("universe"),
        fee_window: row.get("fee_window"),
    }
}

async fn transition(
    conn: &mut SqliteConnection,
    market: Candidate,
    next: ReportingState,
    block_number: u64,
) -> Result<Notification, IndexerError> {
    apply_mutation(
        conn,
        &Mutation::SetMarketState {
            market_id: market.market_id.clone(),
            state: next,
            block_number,
        },
    )
    .await?;
    Ok(Notification::MarketState {
        universe: market.universe,
        market_id: market.market_id,
        reporting_state: next,
        fee_window: market.fee_window,
    })
}

/// Recompute fee-window states as of `now` and report what changed.
pub async fn update_fee_windows(conn: &mut SqliteConnection, now: i64) -> Result<FeeWindowChanges, IndexerError> {
    let newly_active: Vec<String> = sqlx::query(
        "SELECT fee_window FROM fee_windows
         WHERE state = ? AND start_time <= ? AND end_time > ?
         ORDER BY fee_window",
    )
    .bind(FeeWindowState::Upcoming.as_str())
    .bind(now)
    .bind(now)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage)?
    .iter()
    .map(|r| r.get("fee_window"))
    .collect();

    let expired: Vec<String> = sqlx::query(
        "SELECT fee_window FROM fee_windows
         WHERE state != ? AND end_time <= ?
         ORDER BY fee_window",
    )
    .bind(FeeWindowState::Past.as_str())
    .bind(now)
    .fetch_all(&mut *conn)
    .await
    .map_err(storage)?
    .iter()
    .map(|r| r.get("fee_window"))
    .collect();

    for (windows, state) in [
        (&newly_active, FeeWindowState::Current),
        (&expired, FeeWindowState::Past),
    ] {
        for fee_window in windows {
            sqlx::query("UPDATE fee_windows SET state = ? WHERE fee_window = ?")
                .bind(state.as_str())
                .bind(fee_window)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
    }

    Ok(FeeWindowChanges { newly_active, expired })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

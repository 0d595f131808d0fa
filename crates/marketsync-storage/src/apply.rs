//! Executor for handler write batches.
//!
//! Every [`Mutation`] maps to one or a few statements run on the connection
//! of the enclosing unit transaction. Nothing here commits.

use sqlx::{Row, SqliteConnection};
use tracing::trace;

use marketsync_core::error::IndexerError;
use marketsync_core::mutation::{Mutation, NewCrowdsourcer, NewFeeWindow, NewMarket, NewOrder, WriteBatch};
use marketsync_core::types::{FeeWindowState, OrderState, PayoutSet, MAX_OUTCOMES};

use crate::sqlite::storage;

/// Apply every mutation of `batch` in order.
pub async fn apply_batch(conn: &mut SqliteConnection, batch: &WriteBatch) -> Result<(), IndexerError> {
    for mutation in &batch.mutations {
        apply_mutation(conn, mutation).await?;
    }
    Ok(())
}

/// Apply a single mutation.
pub async fn apply_mutation(conn: &mut SqliteConnection, mutation: &Mutation) -> Result<(), IndexerError> {
    trace!(kind = mutation.kind(), "applying mutation");
    match mutation {
        Mutation::InsertTransactionHash {
            block_number,
            transaction_hash,
        } => {
            // A hash seen again after its block was reverted is revived at the new block.
            sqlx::query(
                "INSERT INTO transaction_hashes (transaction_hash, block_number, removed)
                 VALUES (?, ?, 0)
                 ON CONFLICT (transaction_hash) DO UPDATE SET
                    block_number = excluded.block_number,
                    removed      = 0
                 WHERE transaction_hashes.removed = 1",
            )
            .bind(transaction_hash)
            .bind(*block_number as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        }

        Mutation::InsertUniverse {
            universe,
            parent_universe,
        } => {
            sqlx::query(
                "INSERT INTO universes (universe, parent_universe, forked) VALUES (?, ?, 0)
                 ON CONFLICT (universe) DO NOTHING",
            )
            .bind(universe)
            .bind(parent_universe)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        }
        Mutation::DeleteUniverse { universe } => {
            sqlx::query("DELETE FROM universes WHERE universe = ?")
                .bind(universe)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
        Mutation::SetUniverseForked { universe, forked } => {
            sqlx::query("UPDATE universes SET forked = ? WHERE universe = ?")
                .bind(*forked)
                .bind(universe)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }

        Mutation::InsertMarket(market) => insert_market(conn, market).await?,
        Mutation::DeleteMarket { market_id } => {
            for sql in [
                "DELETE FROM market_state WHERE market_id = ?",
                "DELETE FROM payouts WHERE market_id = ?",
                "DELETE FROM markets WHERE market_id = ?",
            ] {
                sqlx::query(sql)
                    .bind(market_id)
                    .execute(&mut *conn)
                    .await
                    .map_err(storage)?;
            }
        }
        Mutation::SetMarketState {
            market_id,
            state,
            block_number,
        } => {
            let result = sqlx::query(
                "INSERT INTO market_state (market_id, reporting_state, block_number) VALUES (?, ?, ?)",
            )
            .bind(market_id)
            .bind(state.as_str())
            .bind(*block_number as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
            sqlx::query("UPDATE markets SET market_state_id = ? WHERE market_id = ?")
                .bind(result.last_insert_rowid())
                .bind(market_id)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
        Mutation::RevertMarketState {
            market_id,
            block_number,
        } => {
            sqlx::query(
                "DELETE FROM market_state WHERE market_state_id = (
                    SELECT MAX(market_state_id) FROM market_state
                    WHERE market_id = ? AND block_number = ?
                 )",
            )
            .bind(market_id)
            .bind(*block_number as i64)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
            sqlx::query(
                "UPDATE markets SET market_state_id = (
                    SELECT MAX(market_state_id) FROM market_state WHERE market_id = ?
                 ) WHERE market_id = ?",
            )
            .bind(market_id)
            .bind(market_id)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        }
        Mutation::SetMarketFeeWindow {
            market_id,
            fee_window,
        } => {
            sqlx::query("UPDATE markets SET fee_window = ? WHERE market_id = ?")
                .bind(fee_window)
                .bind(market_id)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }

        Mutation::InsertFeeWindow(window) => insert_fee_window(conn, window).await?,
        Mutation::DeleteFeeWindow { fee_window } => {
            sqlx::query("DELETE FROM fee_windows WHERE fee_window = ?")
                .bind(fee_window)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }

        Mutation::InsertCrowdsourcer(crowdsourcer) => insert_crowdsourcer(conn, crowdsourcer).await?,
        Mutation::DeleteCrowdsourcer { crowdsourcer } => {
            sqlx::query("DELETE FROM crowdsourcers WHERE crowdsourcer = ?")
                .bind(crowdsourcer)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
        Mutation::SetCrowdsourcerCompleted {
            crowdsourcer,
            completed,
        } => {
            sqlx::query("UPDATE crowdsourcers SET completed = ? WHERE crowdsourcer = ?")
                .bind(*completed)
                .bind(crowdsourcer)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }

        Mutation::InsertPayout {
            market_id,
            payout,
            initial_report,
        } => insert_payout(conn, market_id, payout, *initial_report).await?,
        Mutation::DeletePayoutIfUnreferenced {
            market_id,
            payout_key,
        } => {
            sqlx::query(
                "DELETE FROM payouts
                 WHERE market_id = ? AND payout_key = ? AND initial_report = 0
                   AND NOT EXISTS (
                       SELECT 1 FROM crowdsourcers c
                       WHERE c.market_id = payouts.market_id AND c.payout_key = payouts.payout_key
                   )",
            )
            .bind(market_id)
            .bind(payout_key)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
        }
        Mutation::DeleteInitialReportPayout { market_id } => {
            // Keep rows a crowdsourcer still points at; only drop the flag.
            sqlx::query(
                "UPDATE payouts SET initial_report = 0
                 WHERE market_id = ? AND initial_report = 1
                   AND EXISTS (
                       SELECT 1 FROM crowdsourcers c
                       WHERE c.market_id = payouts.market_id AND c.payout_key = payouts.payout_key
                   )",
            )
            .bind(market_id)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
            sqlx::query("DELETE FROM payouts WHERE market_id = ? AND initial_report = 1")
                .bind(market_id)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
        Mutation::RecomputeTentativeWinning { market_id } => {
            recompute_tentative_winning(conn, market_id).await?
        }

        Mutation::InsertOrder(order) => insert_order(conn, order).await?,
        Mutation::DeleteOrder { order_id } => {
            sqlx::query("DELETE FROM orders WHERE order_id = ?")
                .bind(order_id)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
        Mutation::SetOrderCanceled { order_id, canceled } => {
            let state = if *canceled {
                OrderState::Canceled
            } else {
                OrderState::Open
            };
            sqlx::query("UPDATE orders SET order_state = ? WHERE order_id = ?")
                .bind(state.as_str())
                .bind(order_id)
                .execute(&mut *conn)
                .await
                .map_err(storage)?;
        }
    }
    Ok(())
}

async fn insert_market(conn: &mut SqliteConnection, market: &NewMarket) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO markets (market_id, universe, creator, num_outcomes, end_time, block_number)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (market_id) DO NOTHING",
    )
    .bind(&market.market_id)
    .bind(&market.universe)
    .bind(&market.creator)
    .bind(market.num_outcomes as i64)
    .bind(market.end_time)
    .bind(market.block_number as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn insert_fee_window(conn: &mut SqliteConnection, window: &NewFeeWindow) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO fee_windows (fee_window, universe, start_time, end_time, state, block_number)
         VALUES (?, ?, ?, ?, ?, ?)
         ON CONFLICT (fee_window) DO NOTHING",
    )
    .bind(&window.fee_window)
    .bind(&window.universe)
    .bind(window.start_time)
    .bind(window.end_time)
    .bind(FeeWindowState::Upcoming.as_str())
    .bind(window.block_number as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn insert_crowdsourcer(
    conn: &mut SqliteConnection,
    crowdsourcer: &NewCrowdsourcer,
) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO crowdsourcers (crowdsourcer, market_id, fee_window, payout_key, size, completed, block_number)
         VALUES (?, ?, ?, ?, ?, NULL, ?)
         ON CONFLICT (crowdsourcer) DO NOTHING",
    )
    .bind(&crowdsourcer.crowdsourcer)
    .bind(&crowdsourcer.market_id)
    .bind(&crowdsourcer.fee_window)
    .bind(crowdsourcer.payout.key())
    .bind(&crowdsourcer.size)
    .bind(crowdsourcer.block_number as i64)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn insert_order(conn: &mut SqliteConnection, order: &NewOrder) -> Result<(), IndexerError> {
    sqlx::query(
        "INSERT INTO orders
            (order_id, market_id, outcome, order_type, price, amount, order_state, orphaned,
             block_number, transaction_hash)
         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
         ON CONFLICT (order_id) DO NOTHING",
    )
    .bind(&order.order_id)
    .bind(&order.market_id)
    .bind(order.outcome as i64)
    .bind(order.order_type.as_str())
    .bind(order.price)
    .bind(order.amount)
    .bind(OrderState::Open.as_str())
    .bind(order.block_number as i64)
    .bind(&order.transaction_hash)
    .execute(&mut *conn)
    .await
    .map_err(storage)?;
    Ok(())
}

async fn insert_payout(
    conn: &mut SqliteConnection,
    market_id: &str,
    payout: &PayoutSet,
    initial_report: bool,
) -> Result<(), IndexerError> {
    payout.validate()?;
    let columns: Vec<String> = (0..MAX_OUTCOMES).map(|i| format!("payout{i}")).collect();
    let placeholders = vec!["?"; MAX_OUTCOMES].join(", ");
    let sql = format!(
        "INSERT INTO payouts (market_id, payout_key, {}, is_invalid, initial_report)
         VALUES (?, ?, {placeholders}, ?, ?)
         ON CONFLICT (market_id, payout_key) DO UPDATE SET
            initial_report = MAX(payouts.initial_report, excluded.initial_report)",
        columns.join(", ")
    );

    let mut query = sqlx::query(&sql).bind(market_id).bind(payout.key());
    for i in 0..MAX_OUTCOMES {
        query = query.bind(payout.numerators.get(i).cloned());
    }
    query
        .bind(payout.invalid)
        .bind(initial_report)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;
    Ok(())
}

async fn recompute_tentative_winning(conn: &mut SqliteConnection, market_id: &str) -> Result<(), IndexerError> {
    sqlx::query("UPDATE payouts SET tentative_winning = 0 WHERE market_id = ?")
        .bind(market_id)
        .execute(&mut *conn)
        .await
        .map_err(storage)?;

    let disputed = sqlx::query(
        "SELECT payout_key FROM crowdsourcers
         WHERE market_id = ? AND completed = 1
         ORDER BY block_number DESC, rowid DESC
         LIMIT 1",
    )
    .bind(market_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage)?;

    let winner: Option<String> = match disputed {
        Some(row) => Some(row.get("payout_key")),
        None => sqlx::query("SELECT payout_key FROM payouts WHERE market_id = ? AND initial_report = 1")
            .bind(market_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(storage)?
            .map(|row| row.get("payout_key")),
    };

    if let Some(key) = winner {
        sqlx::query("UPDATE payouts SET tentative_winning = 1 WHERE market_id = ? AND payout_key = ?")
            .bind(market_id)
            .bind(key)
            .execute(&mut *conn)
            .await
            .map_err(storage)?;
    }
    Ok(())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite::Store;
    use marketsync_core::types::{OrderType, ReportingState};

    fn market(id: &str) -> Mutation {
        Mutation::InsertMarket(NewMarket {
            market_id: id.into(),
            universe: "0xu".into(),
            creator: "0xc".into(),
            num_outcomes: 2,
            end_time: 1_000,
            block_number: 1,
        })
    }

    fn payout(numerators: &[&str]) -> PayoutSet {
        PayoutSet {
            numerators: numerators.iter().map(|s| s.to_string()).collect(),
            invalid: false,
        }
    }

    async fn apply_all(store: &Store, mutations: Vec<Mutation>) {
        let mut tx = store.begin().await.unwrap();
        for m in &mutations {
            apply_mutation(&mut tx, m).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn set_state(state: ReportingState, block_number: u64) -> Mutation {
        Mutation::SetMarketState {
            market_id: "0xm".into(),
            state,
            block_number,
        }
    }

    #[tokio::test]
    async fn state_history_and_revert() {
        let store = Store::in_memory("1").await.unwrap();
        apply_all(
            &store,
            vec![
                market("0xm"),
                set_state(ReportingState::PreReporting, 1),
                set_state(ReportingState::AwaitingNextWindow, 7),
            ],
        )
        .await;
        assert_eq!(
            store.market("0xm").await.unwrap().unwrap().reporting_state,
            Some(ReportingState::AwaitingNextWindow)
        );

        apply_all(
            &store,
            vec![Mutation::RevertMarketState {
                market_id: "0xm".into(),
                block_number: 7,
            }],
        )
        .await;
        assert_eq!(
            store.market("0xm").await.unwrap().unwrap().reporting_state,
            Some(ReportingState::PreReporting)
        );
        assert_eq!(
            store.market_state_history("0xm").await.unwrap(),
            vec![ReportingState::PreReporting]
        );
    }

    #[tokio::test]
    async fn delete_market_drops_history_and_payouts() {
        let store = Store::in_memory("1").await.unwrap();
        apply_all(
            &store,
            vec![
                market("0xm"),
                set_state(ReportingState::PreReporting, 1),
                Mutation::InsertPayout {
                    market_id: "0xm".into(),
                    payout: payout(&["0", "100"]),
                    initial_report: true,
                },
                Mutation::DeleteMarket {
                    market_id: "0xm".into(),
                },
            ],
        )
        .await;
        assert!(store.market("0xm").await.unwrap().is_none());
        assert!(store.market_state_history("0xm").await.unwrap().is_empty());
        assert!(store.payouts("0xm").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tentative_winner_prefers_latest_completed_dispute() {
        let store = Store::in_memory("1").await.unwrap();
        let initial = payout(&["0", "100"]);
        let disputed = payout(&["100", "0"]);
        apply_all(
            &store,
            vec![
                market("0xm"),
                Mutation::InsertPayout {
                    market_id: "0xm".into(),
                    payout: initial.clone(),
                    initial_report: true,
                },
                Mutation::RecomputeTentativeWinning {
                    market_id: "0xm".into(),
                },
            ],
        )
        .await;
        let payouts = store.payouts("0xm").await.unwrap();
        assert!(payouts.iter().any(|p| p.payout_key == initial.key() && p.tentative_winning));

        apply_all(
            &store,
            vec![
                Mutation::InsertPayout {
                    market_id: "0xm".into(),
                    payout: disputed.clone(),
                    initial_report: false,
                },
                Mutation::InsertCrowdsourcer(NewCrowdsourcer {
                    crowdsourcer: "0xd".into(),
                    market_id: "0xm".into(),
                    fee_window: "0xf".into(),
                    payout: disputed.clone(),
                    size: "1000".into(),
                    block_number: 9,
                }),
                Mutation::SetCrowdsourcerCompleted {
                    crowdsourcer: "0xd".into(),
                    completed: Some(true),
                },
                Mutation::RecomputeTentativeWinning {
                    market_id: "0xm".into(),
                },
            ],
        )
        .await;
        let payouts = store.payouts("0xm").await.unwrap();
        let winners: Vec<_> = payouts.iter().filter(|p| p.tentative_winning).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].payout_key, disputed.key());
        assert_eq!(winners[0].numerators[0].as_deref(), Some("100"));
        assert_eq!(winners[0].numerators[2], None);
    }

    #[tokio::test]
    async fn initial_report_payout_survives_while_disputed() {
        let store = Store::in_memory("1").await.unwrap();
        let shared = payout(&["0", "100"]);
        apply_all(
            &store,
            vec![
                market("0xm"),
                Mutation::InsertPayout {
                    market_id: "0xm".into(),
                    payout: shared.clone(),
                    initial_report: true,
                },
                Mutation::InsertCrowdsourcer(NewCrowdsourcer {
                    crowdsourcer: "0xd".into(),
                    market_id: "0xm".into(),
                    fee_window: "0xf".into(),
                    payout: shared.clone(),
                    size: "1".into(),
                    block_number: 3,
                }),
                Mutation::DeleteInitialReportPayout {
                    market_id: "0xm".into(),
                },
            ],
        )
        .await;
        let payouts = store.payouts("0xm").await.unwrap();
        assert_eq!(payouts.len(), 1);
        assert!(!payouts[0].initial_report);

        apply_all(
            &store,
            vec![
                Mutation::DeleteCrowdsourcer {
                    crowdsourcer: "0xd".into(),
                },
                Mutation::DeletePayoutIfUnreferenced {
                    market_id: "0xm".into(),
                    payout_key: shared.key(),
                },
            ],
        )
        .await;
        assert!(store.payouts("0xm").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn transaction_hash_is_revived_after_removal() {
        let store = Store::in_memory("1").await.unwrap();
        let insert = |block_number| Mutation::InsertTransactionHash {
            block_number,
            transaction_hash: "0xt".into(),
        };
        apply_all(&store, vec![insert(5), insert(5)]).await;
        sqlx::query("UPDATE transaction_hashes SET removed = 1")
            .execute(store.pool())
            .await
            .unwrap();
        apply_all(&store, vec![insert(6)]).await;

        let row = store.transaction_hash("0xt").await.unwrap().unwrap();
        assert_eq!(row.block_number, 6);
        assert!(!row.removed);
    }

    #[tokio::test]
    async fn order_insert_then_delete() {
        let store = Store::in_memory("1").await.unwrap();
        let order = NewOrder {
            order_id: "0xo".into(),
            market_id: "0xm".into(),
            outcome: 0,
            order_type: OrderType::Buy,
            price: 25,
            amount: 4,
            block_number: 8,
            transaction_hash: "0xt".into(),
        };
        apply_all(
            &store,
            vec![Mutation::InsertOrder(order.clone()), Mutation::InsertOrder(order)],
        )
        .await;

        let rows = store.orders().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].order_state, OrderState::Open);
        assert_eq!((rows[0].price, rows[0].amount), (25, 4));
        assert_eq!(rows[0].block_number, 8);
        assert!(!rows[0].orphaned);

        apply_all(
            &store,
            vec![Mutation::DeleteOrder {
                order_id: "0xo".into(),
            }],
        )
        .await;
        assert!(store.order("0xo").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn order_cancel_and_restore() {
        let store = Store::in_memory("1").await.unwrap();
        apply_all(
            &store,
            vec![
                Mutation::InsertOrder(NewOrder {
                    order_id: "0xo".into(),
                    market_id: "0xm".into(),
                    outcome: 1,
                    order_type: OrderType::Sell,
                    price: 40,
                    amount: 3,
                    block_number: 2,
                    transaction_hash: "0xt".into(),
                }),
                Mutation::SetOrderCanceled {
                    order_id: "0xo".into(),
                    canceled: true,
                },
            ],
        )
        .await;
        assert_eq!(
            store.order("0xo").await.unwrap().unwrap().order_state,
            OrderState::Canceled
        );
        apply_all(
            &store,
            vec![Mutation::SetOrderCanceled {
                order_id: "0xo".into(),
                canceled: false,
            }],
        )
        .await;
        let order = store.order("0xo").await.unwrap().unwrap();
        assert_eq!(order.order_state, OrderState::Open);
        assert_eq!(order.order_type, OrderType::Sell);
    }
}

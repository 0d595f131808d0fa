//! Store-wide passes run after every committed unit.

use async_trait::async_trait;
use sqlx::Row;
use tracing::{debug, info};

use marketsync_core::error::IndexerError;
use marketsync_core::notify::Notification;
use marketsync_core::types::{OrderState, ReportingState};

use crate::sqlite::{storage, Store};

/// Post-commit reconciliation. Both passes are idempotent.
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// Flag open orders on finalized markets as orphaned.
    async fn check_orphaned_orders(&self) -> Result<Vec<Notification>, IndexerError>;

    /// Recompute open-order liquidity per market; report only changes.
    async fn update_market_liquidity(&self) -> Result<Vec<Notification>, IndexerError>;

    /// Run both passes, orphans first.
    async fn reconcile(&self) -> Result<Vec<Notification>, IndexerError> {
        let mut notifications = self.check_orphaned_orders().await?;
        notifications.extend(self.update_market_liquidity().await?);
        Ok(notifications)
    }
}

/// [`Reconciler`] over the SQLite store.
#[derive(Debug, Clone)]
pub struct StoreReconciler {
    store: Store,
}

impl StoreReconciler {
    pub fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Reconciler for StoreReconciler {
    async fn check_orphaned_orders(&self) -> Result<Vec<Notification>, IndexerError> {
        let mut tx = self.store.begin().await?;
        let rows = sqlx::query(
            "SELECT o.order_id, o.market_id
             FROM orders o
             JOIN markets m ON m.market_id = o.market_id
             JOIN market_state s ON s.market_state_id = m.market_state_id
             WHERE o.order_state = ? AND o.orphaned = 0 AND s.reporting_state = ?
             ORDER BY o.order_id",
        )
        .bind(OrderState::Open.as_str())
        .bind(ReportingState::Finalized.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut notifications = Vec::with_capacity(rows.len());
        for row in rows {
            let order_id: String = row.get("order_id");
            let market_id: String = row.get("market_id");
            sqlx::query("UPDATE orders SET orphaned = 1 WHERE order_id = ?")
                .bind(&order_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            notifications.push(Notification::OrderOrphaned { market_id, order_id });
        }
        tx.commit().await.map_err(storage)?;

        if !notifications.is_empty() {
            info!(count = notifications.len(), "orphaned orders flagged");
        }
        Ok(notifications)
    }

    async fn update_market_liquidity(&self) -> Result<Vec<Notification>, IndexerError> {
        let mut tx = self.store.begin().await?;
        let rows = sqlx::query(
            "SELECT m.market_id, m.liquidity,
                    (SELECT COALESCE(SUM(o.price * o.amount), 0) FROM orders o
                     WHERE o.market_id = m.market_id AND o.order_state = ? AND o.orphaned = 0
                    ) AS computed
             FROM markets m
             ORDER BY m.market_id",
        )
        .bind(OrderState::Open.as_str())
        .fetch_all(&mut *tx)
        .await
        .map_err(storage)?;

        let mut notifications = Vec::new();
        for row in rows {
            let market_id: String = row.get("market_id");
            let stored: i64 = row.get("liquidity");
            let computed: i64 = row.get("computed");
            if stored == computed {
                continue;
            }
            sqlx::query("UPDATE markets SET liquidity = ? WHERE market_id = ?")
                .bind(computed)
                .bind(&market_id)
                .execute(&mut *tx)
                .await
                .map_err(storage)?;
            debug!(market_id = %market_id, liquidity = computed, "market liquidity changed");
            notifications.push(Notification::MarketLiquidity {
                market_id,
                liquidity: computed,
            });
        }
        tx.commit().await.map_err(storage)?;
        Ok(notifications)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply_mutation;
    use marketsync_core::mutation::{Mutation, NewMarket, NewOrder};
    use marketsync_core::types::OrderType;

    async fn seed(store: &Store, mutations: Vec<Mutation>) {
        let mut tx = store.begin().await.unwrap();
        for m in &mutations {
            apply_mutation(&mut tx, m).await.unwrap();
        }
        tx.commit().await.unwrap();
    }

    fn order(id: &str, price: i64, amount: i64) -> Mutation {
        Mutation::InsertOrder(NewOrder {
            order_id: id.into(),
            market_id: "0xm".into(),
            outcome: 0,
            order_type: OrderType::Buy,
            price,
            amount,
            block_number: 2,
            transaction_hash: format!("0xtx{id}"),
        })
    }

    async fn setup() -> Store {
        let store = Store::in_memory("1").await.unwrap();
        seed(
            &store,
            vec![
                Mutation::InsertMarket(NewMarket {
                    market_id: "0xm".into(),
                    universe: "0xu".into(),
                    creator: "0xc".into(),
                    num_outcomes: 2,
                    end_time: 100,
                    block_number: 1,
                }),
                Mutation::SetMarketState {
                    market_id: "0xm".into(),
                    state: ReportingState::PreReporting,
                    block_number: 1,
                },
                order("a", 10, 2),
                order("b", 5, 4),
            ],
        )
        .await;
        store
    }

    #[tokio::test]
    async fn liquidity_reports_changes_only() {
        let store = setup().await;
        let reconciler = StoreReconciler::new(store.clone());

        let first = reconciler.update_market_liquidity().await.unwrap();
        assert_eq!(
            first,
            vec![Notification::MarketLiquidity {
                market_id: "0xm".into(),
                liquidity: 40
            }]
        );
        assert!(reconciler.update_market_liquidity().await.unwrap().is_empty());

        seed(
            &store,
            vec![Mutation::SetOrderCanceled {
                order_id: "b".into(),
                canceled: true,
            }],
        )
        .await;
        reconciler.update_market_liquidity().await.unwrap();
        assert_eq!(store.market("0xm").await.unwrap().unwrap().liquidity, 20);
    }

    #[tokio::test]
    async fn finalized_market_orphans_open_orders_once() {
        let store = setup().await;
        seed(
            &store,
            vec![
                Mutation::SetOrderCanceled {
                    order_id: "b".into(),
                    canceled: true,
                },
                Mutation::SetMarketState {
                    market_id: "0xm".into(),
                    state: ReportingState::Finalized,
                    block_number: 9,
                },
            ],
        )
        .await;
        let reconciler = StoreReconciler::new(store.clone());

        let out = reconciler.reconcile().await.unwrap();
        assert_eq!(
            out[0],
            Notification::OrderOrphaned {
                market_id: "0xm".into(),
                order_id: "a".into()
            }
        );
        assert!(store.order("a").await.unwrap().unwrap().orphaned);
        assert!(!store.order("b").await.unwrap().unwrap().orphaned);
        // Orphaned and canceled orders carry no liquidity.
        assert_eq!(store.market("0xm").await.unwrap().unwrap().liquidity, 0);

        assert!(reconciler.reconcile().await.unwrap().is_empty());
    }
}

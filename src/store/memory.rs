use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::domain::{OrderStatus, PendingOrder, TradeRecord};
use crate::error::Result;
use crate::store::OrderStore;

#[derive(Default)]
struct Inner {
    orders: HashMap<Uuid, PendingOrder>,
    trades: Vec<TradeRecord>,
}

/// In-memory order store.
///
/// Mirrors the Postgres store's conditional-update semantics with a single
/// mutex standing in for row-level atomicity. Used by tests and dry runs.
#[derive(Clone, Default)]
pub struct MemoryOrderStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of trade records, for assertions in tests
    pub async fn trade_count(&self) -> usize {
        self.inner.lock().await.trades.len()
    }
}

#[async_trait]
impl OrderStore for MemoryOrderStore {
    async fn save_order(&self, order: &PendingOrder) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<PendingOrder>> {
        let inner = self.inner.lock().await;
        Ok(inner.orders.get(&id).cloned())
    }

    async fn list_by_trader(&self, trader_id: &str) -> Result<Vec<PendingOrder>> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<_> = inner
            .orders
            .values()
            .filter(|o| o.trader_id == trader_id)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<PendingOrder>> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<_> = inner
            .orders
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn list_by_trader_and_status(
        &self,
        trader_id: &str,
        status: OrderStatus,
    ) -> Result<Vec<PendingOrder>> {
        let inner = self.inner.lock().await;
        let mut orders: Vec<_> = inner
            .orders
            .values()
            .filter(|o| o.trader_id == trader_id && o.status == status)
            .cloned()
            .collect();
        orders.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(orders)
    }

    async fn list_traders(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock().await;
        let mut traders: Vec<_> = inner
            .orders
            .values()
            .map(|o| o.trader_id.clone())
            .collect();
        traders.sort();
        traders.dedup();
        Ok(traders)
    }

    async fn count_pending(&self, trader_id: &str) -> Result<i64> {
        let now = Utc::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .orders
            .values()
            .filter(|o| {
                o.trader_id == trader_id
                    && matches!(o.status, OrderStatus::Pending | OrderStatus::Triggered)
                    && o.expires_at > now
            })
            .count() as i64)
    }

    async fn cancel_order(&self, id: Uuid, reason: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.orders.get_mut(&id) {
            Some(order) if !order.status.is_terminal() => {
                order.status = OrderStatus::Cancelled;
                order.cancel_reason = Some(reason.to_string());
                order.is_executing = false;
                order.claimed_at = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn try_claim(&self, id: Uuid) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.orders.get_mut(&id) {
            Some(order) if !order.is_executing && order.status == OrderStatus::Pending => {
                order.is_executing = true;
                order.execution_version += 1;
                order.claimed_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_claim(&self, id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(order) = inner.orders.get_mut(&id) {
            order.is_executing = false;
            order.claimed_at = None;
        }
        Ok(())
    }

    async fn mark_triggered(
        &self,
        id: Uuid,
        triggered_price: Decimal,
        triggered_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(order) = inner.orders.get_mut(&id) {
            if order.status == OrderStatus::Pending {
                order.status = OrderStatus::Triggered;
                order.triggered_price = Some(triggered_price);
                order.triggered_at = Some(triggered_at);
            }
        }
        Ok(())
    }

    async fn mark_filled(
        &self,
        id: Uuid,
        triggered_price: Decimal,
        filled_at: DateTime<Utc>,
        exchange_order_id: i64,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        match inner.orders.get_mut(&id) {
            Some(order)
                if matches!(order.status, OrderStatus::Pending | OrderStatus::Triggered) =>
            {
                order.status = OrderStatus::Filled;
                order.triggered_price = Some(triggered_price);
                order.triggered_at = Some(filled_at);
                order.filled_at = Some(filled_at);
                order.executed_at = Some(Utc::now());
                order.is_executing = false;
                order.claimed_at = None;
                order.exchange_order_id = Some(exchange_order_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_expired_orders(&self, trader_id: &str) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut count = 0;
        for order in inner.orders.values_mut() {
            if order.trader_id == trader_id
                && order.status == OrderStatus::Pending
                && order.expires_at < now
            {
                order.status = OrderStatus::Expired;
                order.cancel_reason = Some("Order expired without being triggered".to_string());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel_orders_older_than(&self, trader_id: &str, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let reason = format!("Order too old (>{}h)", max_age.num_hours());
        let mut inner = self.inner.lock().await;
        let mut count = 0;
        for order in inner.orders.values_mut() {
            if order.trader_id == trader_id
                && order.status == OrderStatus::Pending
                && order.created_at < cutoff
            {
                order.status = OrderStatus::Cancelled;
                order.cancel_reason = Some(reason.clone());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn cancel_oldest_over_cap(&self, trader_id: &str, keep: usize) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.inner.lock().await;
        let mut ids: Vec<(Uuid, DateTime<Utc>)> = inner
            .orders
            .values()
            .filter(|o| {
                o.trader_id == trader_id && o.status == OrderStatus::Pending && o.expires_at > now
            })
            .map(|o| (o.id, o.created_at))
            .collect();
        // Newest first; everything past `keep` gets cancelled
        ids.sort_by(|a, b| b.1.cmp(&a.1));

        let reason = format!("Exceeded max pending orders limit ({keep})");
        let mut count = 0;
        for (id, _) in ids.into_iter().skip(keep) {
            if let Some(order) = inner.orders.get_mut(&id) {
                order.status = OrderStatus::Cancelled;
                order.cancel_reason = Some(reason.clone());
                count += 1;
            }
        }
        Ok(count)
    }

    async fn reset_stuck_claims(&self, grace: Duration) -> Result<u64> {
        let cutoff = Utc::now() - grace;
        let mut inner = self.inner.lock().await;
        let mut count = 0;
        for order in inner.orders.values_mut() {
            if !order.is_executing || !order.claimed_at.is_some_and(|t| t < cutoff) {
                continue;
            }
            match order.status {
                OrderStatus::Pending => {
                    order.is_executing = false;
                    order.claimed_at = None;
                    count += 1;
                }
                OrderStatus::Triggered => {
                    order.status = OrderStatus::Cancelled;
                    order.cancel_reason =
                        Some("Execution interrupted between trigger and fill".to_string());
                    order.is_executing = false;
                    order.claimed_at = None;
                    count += 1;
                }
                _ => {}
            }
        }
        Ok(count)
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.orders.len();
        inner
            .orders
            .retain(|_, o| !(o.status.is_terminal() && o.created_at < cutoff));
        Ok((before - inner.orders.len()) as u64)
    }

    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner
            .trades
            .iter()
            .any(|t| t.pending_order_id == trade.pending_order_id)
        {
            return Ok(());
        }
        inner.trades.push(trade.clone());
        Ok(())
    }

    async fn list_trades_by_trader(&self, trader_id: &str, limit: i64) -> Result<Vec<TradeRecord>> {
        let inner = self.inner.lock().await;
        let mut trades: Vec<_> = inner
            .trades
            .iter()
            .filter(|t| t.trader_id == trader_id)
            .cloned()
            .collect();
        trades.sort_by(|a, b| b.entry_time.cmp(&a.entry_time));
        trades.truncate(limit as usize);
        Ok(trades)
    }
}

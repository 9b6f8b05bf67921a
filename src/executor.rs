//! Execution coordination for triggered orders
//!
//! Turns a trigger event into at most one exchange execution sequence. The
//! claim through the store is the sole defence against the push-feed path
//! and the fallback poller firing for the same order concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ExecutionConfig;
use crate::domain::{OrderRef, PendingOrder, TradeDirection, TradeRecord};
use crate::error::{Result, TripwireError};
use crate::exchange::ExchangeClient;
use crate::monitor::TriggerSink;
use crate::store::OrderStore;

/// Executes triggered orders exactly once, with in-event retry and
/// cross-cycle failure escalation.
pub struct ExecutionCoordinator {
    store: Arc<dyn OrderStore>,
    exchange: Arc<dyn ExchangeClient>,
    config: ExecutionConfig,
    /// Per-order failure count surviving across trigger events
    cycle_failures: Mutex<HashMap<Uuid, u32>>,
}

#[async_trait]
impl TriggerSink for ExecutionCoordinator {
    async fn on_trigger(&self, order: PendingOrder, price: Decimal) {
        let order_id = order.id;
        if let Err(e) = self.handle_trigger(order, price).await {
            error!(%order_id, error = %e, "trigger handling failed");
        }
    }
}

impl ExecutionCoordinator {
    pub fn new(
        store: Arc<dyn OrderStore>,
        exchange: Arc<dyn ExchangeClient>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            store,
            exchange,
            config,
            cycle_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Claim the order and run the execution sequence. A lost claim means
    /// another worker got there first; return silently.
    pub async fn handle_trigger(&self, order: PendingOrder, price: Decimal) -> Result<()> {
        if !self.store.try_claim(order.id).await? {
            debug!(order_id = %order.id, "order already claimed, skipping");
            return Ok(());
        }

        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            %price,
            "executing triggered order"
        );

        match self.execute_with_backoff(&order, price).await {
            Ok(order_ref) => self.finalize_fill(&order, price, order_ref).await,
            Err(e) if e.is_non_retryable() => {
                let reason = format!("Non-retryable execution error: {e}");
                error!(order_id = %order.id, symbol = %order.symbol, error = %e, "execution aborted");
                self.store.cancel_order(order.id, &reason).await?;
                self.cycle_failures.lock().await.remove(&order.id);
                Ok(())
            }
            Err(e) => {
                warn!(
                    order_id = %order.id,
                    symbol = %order.symbol,
                    error = %e,
                    "execution retries exhausted, releasing claim"
                );
                self.store.release_claim(order.id).await?;
                self.record_cycle_failure(order.id, &e).await
            }
        }
    }

    /// Record the fill. Trade insert and the FILLED transition are both
    /// idempotent, so a crash between them cannot double-book.
    async fn finalize_fill(
        &self,
        order: &PendingOrder,
        price: Decimal,
        order_ref: OrderRef,
    ) -> Result<()> {
        let now = Utc::now();
        let quantity = order_ref
            .quantity
            .unwrap_or_else(|| order.position_size / price);

        self.store.mark_triggered(order.id, price, now).await?;

        let trade = TradeRecord::from_fill(order, price, quantity);
        self.store.save_trade(&trade).await?;

        if self
            .store
            .mark_filled(order.id, price, now, order_ref.exchange_order_id)
            .await?
        {
            info!(
                order_id = %order.id,
                symbol = %order.symbol,
                %price,
                exchange_order_id = order_ref.exchange_order_id,
                "order filled"
            );
        }
        self.cycle_failures.lock().await.remove(&order.id);
        Ok(())
    }

    /// Up to max_retries total attempts within this trigger event, backing
    /// off exponentially between them (2s, 4s, 8s, ...). Non-retryable
    /// errors abort at once.
    async fn execute_with_backoff(
        &self,
        order: &PendingOrder,
        price: Decimal,
    ) -> Result<OrderRef> {
        let mut last_err = None;

        for attempt in 0..self.config.max_retries {
            if attempt > 0 {
                let delay = self.config.backoff_base_secs * (1u64 << (attempt - 1));
                info!(
                    order_id = %order.id,
                    attempt = attempt + 1,
                    max = self.config.max_retries,
                    delay_secs = delay,
                    "retrying execution after backoff"
                );
                tokio::time::sleep(tokio::time::Duration::from_secs(delay)).await;
            }

            match self.execute_once(order, price).await {
                Ok(order_ref) => {
                    if attempt > 0 {
                        info!(order_id = %order.id, attempt = attempt + 1, "execution succeeded on retry");
                    }
                    return Ok(order_ref);
                }
                Err(e) if e.is_non_retryable() => return Err(e),
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        attempt = attempt + 1,
                        max = self.config.max_retries,
                        error = %e,
                        "execution attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            TripwireError::Internal("execution failed without recorded error".to_string())
        }))
    }

    /// One full attempt: margin check, entry, protective orders
    async fn execute_once(&self, order: &PendingOrder, price: Decimal) -> Result<OrderRef> {
        let balance = self.exchange.get_balance().await?;

        // required = size/leverage + size*0.001 fee + 1% cushion on margin
        //          = size * (1.01/leverage + 0.001)
        let margin_factor = dec!(1.01) / Decimal::from(order.leverage) + dec!(0.001);
        let required = order.position_size * margin_factor;
        if balance.available < required {
            return Err(TripwireError::InsufficientMargin {
                required,
                available: balance.available,
            });
        }

        let direction = order.direction();
        let order_ref = self
            .exchange
            .open_position(&order.symbol, direction, order.position_size, order.leverage)
            .await?;

        let quantity = order_ref
            .quantity
            .unwrap_or_else(|| order.position_size / price);

        if let Err(e) = self
            .place_protective(order, direction, quantity, order.stop_loss, true)
            .await
        {
            error!(
                order_id = %order.id,
                symbol = %order.symbol,
                error = %e,
                "stop loss placement failed, closing position"
            );
            self.exchange.close_position(&order.symbol, direction).await?;
            return Err(e);
        }

        if let Err(e) = self
            .place_protective(order, direction, quantity, order.take_profit, false)
            .await
        {
            error!(
                order_id = %order.id,
                symbol = %order.symbol,
                error = %e,
                "take profit placement failed, closing position"
            );
            self.exchange.close_position(&order.symbol, direction).await?;
            return Err(e);
        }

        Ok(order_ref)
    }

    /// Protective order placement with a short linear-backoff retry
    async fn place_protective(
        &self,
        order: &PendingOrder,
        direction: TradeDirection,
        quantity: Decimal,
        price: Decimal,
        is_stop_loss: bool,
    ) -> Result<()> {
        let label = if is_stop_loss { "stop loss" } else { "take profit" };
        let mut last_err = None;

        for attempt in 0..self.config.protective_order_retries {
            if attempt > 0 {
                tokio::time::sleep(tokio::time::Duration::from_secs(attempt as u64)).await;
            }

            let result = if is_stop_loss {
                self.exchange
                    .set_stop_loss(&order.symbol, direction, quantity, price)
                    .await
            } else {
                self.exchange
                    .set_take_profit(&order.symbol, direction, quantity, price)
                    .await
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        order_id = %order.id,
                        attempt = attempt + 1,
                        error = %e,
                        "{label} placement attempt failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| {
            TripwireError::Internal(format!("{label} placement failed without recorded error"))
        }))
    }

    /// Escalate a failed trigger event. The order stays PENDING for later
    /// cycles until the failure budget is spent, then it is cancelled for
    /// good.
    async fn record_cycle_failure(&self, order_id: Uuid, err: &TripwireError) -> Result<()> {
        let count = {
            let mut failures = self.cycle_failures.lock().await;
            let count = failures.entry(order_id).or_insert(0);
            *count += 1;
            *count
        };

        if count >= self.config.max_cycle_failures {
            let reason = format!("Execution failed {count} times across cycles: {err}");
            if self.store.cancel_order(order_id, &reason).await? {
                info!(%order_id, failures = count, "order cancelled after repeated cycle failures");
            }
            self.cycle_failures.lock().await.remove(&order_id);
        } else {
            warn!(
                %order_id,
                failures = count,
                budget = self.config.max_cycle_failures,
                "execution failed this cycle, order stays pending"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Balance, IntentAction, OrderStatus, TradeIntent};
    use crate::exchange::MockExchangeClient;
    use crate::store::MemoryOrderStore;
    use chrono::Duration;

    fn long_order() -> PendingOrder {
        let intent = TradeIntent {
            symbol: "BTCUSDT".to_string(),
            action: IntentAction::OpenLong,
            position_size: dec!(500),
            leverage: 5,
            stop_loss: dec!(95),
            take_profit: dec!(130),
            confidence: 0.8,
            analysis_id: None,
        };
        PendingOrder::from_intent("trader-1", &intent, dec!(100), Duration::hours(24))
    }

    fn fast_config() -> ExecutionConfig {
        ExecutionConfig {
            max_retries: 2,
            backoff_base_secs: 0,
            max_cycle_failures: 3,
            protective_order_retries: 1,
            claim_grace_secs: 600,
        }
    }

    fn rich_balance() -> Balance {
        Balance {
            available: dec!(10000),
            equity: dec!(10000),
        }
    }

    fn happy_exchange() -> MockExchangeClient {
        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_get_balance()
            .returning(|| Ok(rich_balance()));
        exchange.expect_open_position().times(1).returning(|_, _, _, _| {
            Ok(OrderRef {
                exchange_order_id: 42,
                quantity: Some(dec!(0.005)),
            })
        });
        exchange
            .expect_set_stop_loss()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        exchange
            .expect_set_take_profit()
            .times(1)
            .returning(|_, _, _, _| Ok(()));
        exchange
    }

    #[tokio::test]
    async fn successful_execution_fills_and_records_trade() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = long_order();
        store.save_order(&order).await.unwrap();

        let coordinator =
            ExecutionCoordinator::new(store.clone(), Arc::new(happy_exchange()), fast_config());
        coordinator
            .handle_trigger(order.clone(), dec!(101))
            .await
            .unwrap();

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert!(!stored.is_executing);
        assert_eq!(stored.exchange_order_id, Some(42));
        assert_eq!(stored.triggered_price, Some(dec!(101)));
        assert_eq!(store.trade_count().await, 1);
    }

    #[tokio::test]
    async fn concurrent_triggers_execute_once() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = long_order();
        store.save_order(&order).await.unwrap();

        // times(1) on open_position is the assertion
        let coordinator = Arc::new(ExecutionCoordinator::new(
            store.clone(),
            Arc::new(happy_exchange()),
            fast_config(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = coordinator.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                coordinator.handle_trigger(order, dec!(101)).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Filled);
        assert_eq!(store.trade_count().await, 1);
    }

    #[tokio::test]
    async fn insufficient_margin_cancels_without_entry() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = long_order();
        store.save_order(&order).await.unwrap();

        let mut exchange = MockExchangeClient::new();
        exchange.expect_get_balance().returning(|| {
            Ok(Balance {
                available: dec!(10),
                equity: dec!(10),
            })
        });
        exchange.expect_open_position().never();

        let coordinator =
            ExecutionCoordinator::new(store.clone(), Arc::new(exchange), fast_config());
        coordinator
            .handle_trigger(order.clone(), dec!(101))
            .await
            .unwrap();

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(stored
            .cancel_reason
            .unwrap()
            .to_lowercase()
            .contains("insufficient margin"));
    }

    #[tokio::test]
    async fn retryable_failure_releases_claim_and_stays_pending() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = long_order();
        store.save_order(&order).await.unwrap();

        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_get_balance()
            .returning(|| Ok(rich_balance()));
        // Fails both in-event attempts
        exchange
            .expect_open_position()
            .times(2)
            .returning(|_, _, _, _| Err(TripwireError::Exchange("exchange timeout".to_string())));

        let coordinator =
            ExecutionCoordinator::new(store.clone(), Arc::new(exchange), fast_config());
        coordinator
            .handle_trigger(order.clone(), dec!(101))
            .await
            .unwrap();

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert!(!stored.is_executing);
        // Re-claimable on the next cycle
        assert!(store.try_claim(order.id).await.unwrap());
    }

    #[tokio::test]
    async fn retry_budget_counts_total_attempts() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = long_order();
        store.save_order(&order).await.unwrap();

        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_get_balance()
            .returning(|| Ok(rich_balance()));
        // max_retries is the total budget, not extra retries after the first
        exchange
            .expect_open_position()
            .times(3)
            .returning(|_, _, _, _| Err(TripwireError::Exchange("exchange timeout".to_string())));

        let mut config = fast_config();
        config.max_retries = 3;
        let coordinator = ExecutionCoordinator::new(store.clone(), Arc::new(exchange), config);
        coordinator
            .handle_trigger(order.clone(), dec!(101))
            .await
            .unwrap();

        assert_eq!(
            store.get_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn repeated_cycle_failures_cancel_permanently() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = long_order();
        store.save_order(&order).await.unwrap();

        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_get_balance()
            .returning(|| Ok(rich_balance()));
        exchange
            .expect_open_position()
            .returning(|_, _, _, _| Err(TripwireError::Exchange("exchange timeout".to_string())));

        let mut config = fast_config();
        config.max_cycle_failures = 2;
        let coordinator = ExecutionCoordinator::new(store.clone(), Arc::new(exchange), config);

        coordinator
            .handle_trigger(order.clone(), dec!(101))
            .await
            .unwrap();
        assert_eq!(
            store.get_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Pending
        );

        coordinator
            .handle_trigger(order.clone(), dec!(101))
            .await
            .unwrap();
        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(stored.cancel_reason.unwrap().contains("across cycles"));
    }

    #[tokio::test]
    async fn stop_loss_failure_closes_position() {
        let store = Arc::new(MemoryOrderStore::new());
        let order = long_order();
        store.save_order(&order).await.unwrap();

        let mut exchange = MockExchangeClient::new();
        exchange
            .expect_get_balance()
            .returning(|| Ok(rich_balance()));
        exchange.expect_open_position().returning(|_, _, _, _| {
            Ok(OrderRef {
                exchange_order_id: 42,
                quantity: Some(dec!(0.005)),
            })
        });
        exchange
            .expect_set_stop_loss()
            .returning(|_, _, _, _| Err(TripwireError::Exchange("exchange timeout".to_string())));
        exchange.expect_set_take_profit().never();
        exchange
            .expect_close_position()
            .times(2)
            .returning(|_, _| Ok(()));

        let coordinator =
            ExecutionCoordinator::new(store.clone(), Arc::new(exchange), fast_config());
        coordinator
            .handle_trigger(order.clone(), dec!(101))
            .await
            .unwrap();

        // Both in-event attempts opened and closed; order stays pending
        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(store.trade_count().await, 0);
    }
}

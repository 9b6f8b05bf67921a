//! Engine wiring and intent intake
//!
//! Owns the component graph (store, monitor, executor, sweeper) and the
//! intake path that turns AI trade intents into pending orders.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::dedup::{ReplacementDecision, ReplacementPolicy};
use crate::domain::{OrderStatus, PendingOrder, TradeIntent};
use crate::error::Result;
use crate::exchange::{ExchangeClient, MarketData, PriceFeed};
use crate::executor::ExecutionCoordinator;
use crate::cleanup::LifecycleSweeper;
use crate::monitor::{MonitorStatus, PriceMonitor};
use crate::store::OrderStore;
use crate::trigger::TriggerPriceCalculator;

/// Conditional order engine: intake, monitoring, execution, cleanup
pub struct Engine {
    store: Arc<dyn OrderStore>,
    market: Arc<dyn MarketData>,
    monitor: Arc<PriceMonitor>,
    sweeper: Arc<LifecycleSweeper>,
    calculator: TriggerPriceCalculator,
    policy: ReplacementPolicy,
    ttl: Duration,
    /// Serializes decide + cancel + insert per trader
    intake_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn OrderStore>,
        exchange: Arc<dyn ExchangeClient>,
        market: Arc<dyn MarketData>,
        feed: Arc<dyn PriceFeed>,
    ) -> Self {
        let executor = Arc::new(ExecutionCoordinator::new(
            store.clone(),
            exchange,
            config.execution.clone(),
        ));
        let monitor = Arc::new(PriceMonitor::new(
            feed,
            market.clone(),
            store.clone(),
            executor,
            config.monitor.clone(),
            config.orders.clone(),
        ));
        let sweeper = Arc::new(LifecycleSweeper::new(
            store.clone(),
            market.clone(),
            config.orders.clone(),
            config.cleanup.clone(),
            config.execution.clone(),
        ));

        Self {
            store,
            market,
            monitor,
            sweeper,
            calculator: TriggerPriceCalculator::new(config.trigger.clone()),
            policy: ReplacementPolicy::new(Duration::minutes(
                config.orders.recent_fill_window_minutes,
            )),
            ttl: Duration::hours(config.orders.ttl_hours),
            intake_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Start the monitor and cleanup loops and subscribe symbols of orders
    /// already pending in the store.
    pub async fn start(&self) -> Result<()> {
        self.monitor.start();
        self.sweeper.clone().start();

        let pending = self.store.list_by_status(OrderStatus::Pending).await?;
        for order in &pending {
            if let Err(e) = self.monitor.subscribe(&order.symbol).await {
                warn!(symbol = %order.symbol, error = %e, "startup subscribe failed");
            }
        }
        info!(pending = pending.len(), "engine started");
        Ok(())
    }

    pub fn stop(&self) {
        self.monitor.stop();
        self.sweeper.stop();
        info!("engine stop requested");
    }

    pub async fn monitor_status(&self) -> MonitorStatus {
        self.monitor.status().await
    }

    /// Turn a batch of intents into pending orders for one trader.
    ///
    /// Per intent: resolve the current price (degrading with a warning when
    /// unavailable), place the bounded trigger, consult the replacement
    /// policy against the symbol's existing order, then persist and
    /// subscribe. Returns the ids of the orders created.
    pub async fn submit_intents(
        &self,
        trader_id: &str,
        intents: &[TradeIntent],
    ) -> Result<Vec<Uuid>> {
        let lock = self.intake_lock(trader_id).await;
        let _guard = lock.lock().await;

        // Symbol -> blocking order: live orders plus recent fills
        let mut existing: HashMap<String, PendingOrder> = HashMap::new();
        let recent_fill_window = self.policy.recent_fill_window();
        for order in self.store.list_by_trader(trader_id).await? {
            match order.status {
                OrderStatus::Pending | OrderStatus::Triggered => {
                    existing.insert(order.symbol.clone(), order);
                }
                OrderStatus::Filled => {
                    let recent = order
                        .filled_at
                        .is_some_and(|t| Utc::now() - t < recent_fill_window);
                    if recent {
                        existing.insert(order.symbol.clone(), order);
                    }
                }
                _ => {}
            }
        }

        let mut created = Vec::new();
        for intent in intents {
            let current_price = match self.market.current_price(&intent.symbol).await {
                Ok(price) => price,
                Err(e) => {
                    warn!(
                        symbol = %intent.symbol,
                        error = %e,
                        "current price unavailable, trigger calculation degrades"
                    );
                    Decimal::ZERO
                }
            };

            let direction = intent.action.direction();
            let trigger_price = self.calculator.calculate_bounded(
                current_price,
                direction,
                intent.stop_loss,
                intent.take_profit,
            );

            match self
                .policy
                .decide(existing.get(&intent.symbol), intent.confidence, current_price)
            {
                ReplacementDecision::Accept => {}
                ReplacementDecision::Replace { reason } => {
                    let old = &existing[&intent.symbol];
                    info!(
                        symbol = %intent.symbol,
                        old_order_id = %old.id,
                        reason,
                        "replacing existing order"
                    );
                    if !self
                        .store
                        .cancel_order(old.id, &format!("Replaced: {reason}"))
                        .await?
                    {
                        warn!(old_order_id = %old.id, "replacement cancel hit terminal order");
                    }
                    existing.remove(&intent.symbol);
                }
                ReplacementDecision::Reject { reason } => {
                    info!(symbol = %intent.symbol, reason, "intent rejected, keeping existing order");
                    continue;
                }
            }

            let order = PendingOrder::from_intent(trader_id, intent, trigger_price, self.ttl);
            self.store.save_order(&order).await?;
            if let Err(e) = self.monitor.subscribe(&order.symbol).await {
                warn!(symbol = %order.symbol, error = %e, "subscribe for new order failed");
            }

            info!(
                order_id = %order.id,
                symbol = %order.symbol,
                %direction,
                %trigger_price,
                confidence = intent.confidence,
                "pending order created"
            );
            existing.insert(order.symbol.clone(), order.clone());
            created.push(order.id);
        }

        Ok(created)
    }

    async fn intake_lock(&self, trader_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.intake_locks.lock().await;
        locks
            .entry(trader_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IntentAction;
    use crate::exchange::{MockExchangeClient, MockMarketData, MockPriceFeed};
    use crate::store::MemoryOrderStore;
    use rust_decimal_macros::dec;

    fn intent(symbol: &str, confidence: f64) -> TradeIntent {
        TradeIntent {
            symbol: symbol.to_string(),
            action: IntentAction::OpenLong,
            position_size: dec!(500),
            leverage: 5,
            stop_loss: dec!(95),
            take_profit: dec!(130),
            confidence,
            analysis_id: Some("analysis-1".to_string()),
        }
    }

    fn engine_with(market: MockMarketData, store: Arc<MemoryOrderStore>) -> Engine {
        let mut feed = MockPriceFeed::new();
        feed.expect_subscribe().returning(|_| Ok(()));
        feed.expect_unsubscribe().returning(|_| Ok(()));

        Engine::new(
            EngineConfig::default_config("postgres://localhost/tripwire"),
            store,
            Arc::new(MockExchangeClient::new()),
            Arc::new(market),
            Arc::new(feed),
        )
    }

    fn priced_market(price: Decimal) -> MockMarketData {
        let mut market = MockMarketData::new();
        market.expect_current_price().returning(move |_| Ok(price));
        market
    }

    #[tokio::test]
    async fn intent_creates_pending_order_with_bounded_trigger() {
        let store = Arc::new(MemoryOrderStore::new());
        let engine = engine_with(priced_market(dec!(100)), store.clone());

        let created = engine
            .submit_intents("trader-1", &[intent("BTCUSDT", 0.8)])
            .await
            .unwrap();
        assert_eq!(created.len(), 1);

        let order = store.get_order(created[0]).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert!(order.trigger_price > order.stop_loss);
        assert!(order.trigger_price < order.take_profit);
        assert!(order.trigger_price < dec!(100));
        assert_eq!(order.analysis_id.as_deref(), Some("analysis-1"));
    }

    #[tokio::test]
    async fn higher_confidence_intent_replaces_existing() {
        let store = Arc::new(MemoryOrderStore::new());
        let engine = engine_with(priced_market(dec!(100)), store.clone());

        let first = engine
            .submit_intents("trader-1", &[intent("BTCUSDT", 0.6)])
            .await
            .unwrap();
        let second = engine
            .submit_intents("trader-1", &[intent("BTCUSDT", 0.9)])
            .await
            .unwrap();
        assert_eq!(second.len(), 1);

        let old = store.get_order(first[0]).await.unwrap().unwrap();
        assert_eq!(old.status, OrderStatus::Cancelled);
        let reason = old.cancel_reason.unwrap();
        assert!(reason.starts_with("Replaced:"));
        assert!(reason.contains("higher confidence"));

        let new = store.get_order(second[0]).await.unwrap().unwrap();
        assert_eq!(new.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn weaker_intent_is_rejected() {
        let store = Arc::new(MemoryOrderStore::new());
        let engine = engine_with(priced_market(dec!(100)), store.clone());

        let first = engine
            .submit_intents("trader-1", &[intent("BTCUSDT", 0.9)])
            .await
            .unwrap();
        let second = engine
            .submit_intents("trader-1", &[intent("BTCUSDT", 0.6)])
            .await
            .unwrap();
        assert!(second.is_empty());

        let kept = store.get_order(first[0]).await.unwrap().unwrap();
        assert_eq!(kept.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn recent_fill_blocks_new_intent() {
        let store = Arc::new(MemoryOrderStore::new());

        let seed = intent("BTCUSDT", 0.6);
        let mut filled = PendingOrder::from_intent("trader-1", &seed, dec!(100), Duration::hours(24));
        filled.status = OrderStatus::Filled;
        filled.filled_at = Some(Utc::now() - Duration::minutes(5));
        store.save_order(&filled).await.unwrap();

        let engine = engine_with(priced_market(dec!(100)), store.clone());
        let created = engine
            .submit_intents("trader-1", &[intent("BTCUSDT", 0.95)])
            .await
            .unwrap();
        assert!(created.is_empty());
    }

    #[tokio::test]
    async fn unavailable_price_degrades_to_stop_loss_trigger() {
        let store = Arc::new(MemoryOrderStore::new());
        let mut market = MockMarketData::new();
        market.expect_current_price().returning(|_| {
            Err(crate::error::TripwireError::MarketDataUnavailable(
                "BTCUSDT".to_string(),
            ))
        });

        let engine = engine_with(market, store.clone());
        let created = engine
            .submit_intents("trader-1", &[intent("BTCUSDT", 0.8)])
            .await
            .unwrap();
        assert_eq!(created.len(), 1);

        let order = store.get_order(created[0]).await.unwrap().unwrap();
        assert_eq!(order.trigger_price, order.stop_loss);
    }

    #[tokio::test]
    async fn batch_with_two_symbols_creates_both() {
        let store = Arc::new(MemoryOrderStore::new());
        let engine = engine_with(priced_market(dec!(100)), store.clone());

        let created = engine
            .submit_intents(
                "trader-1",
                &[intent("BTCUSDT", 0.8), intent("ETHUSDT", 0.7)],
            )
            .await
            .unwrap();
        assert_eq!(created.len(), 2);
        assert_eq!(store.count_pending("trader-1").await.unwrap(), 2);
    }
}

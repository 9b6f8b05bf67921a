//! Price monitoring background service
//!
//! Keeps a live price per subscribed symbol and raises trigger events:
//! - push-feed reader with reconnection
//! - fast trigger-check ticker independent of tick arrival
//! - slow resubscription sweep re-deriving symbols from PENDING orders
//! - out-of-band fallback poller in case the feed silently stalls

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures_util::FutureExt;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::config::{MonitorConfig, OrderPolicyConfig};
use crate::domain::{OrderStatus, PendingOrder, PriceTick};
use crate::error::Result;
use crate::exchange::{MarketData, PriceFeed};
use crate::store::OrderStore;

/// Receives orders whose trigger condition was observed. The monitor never
/// mutates order status itself; status transitions belong to the sink.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    async fn on_trigger(&self, order: PendingOrder, price: Decimal);
}

/// Callback invoked per price tick for a subscribed symbol
pub type PriceCallback = dyn Fn(&PriceTick) + Send + Sync;

/// Health snapshot, readable without blocking the monitor loops
#[derive(Debug, Clone, Default)]
pub struct MonitorStatus {
    pub connected: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reconnect_count: u32,
}

/// Ref-counted per-symbol subscription state
struct SymbolState {
    ref_count: u32,
    last_price: Option<Decimal>,
    last_update: Option<DateTime<Utc>>,
}

type SubscriptionMap = Arc<RwLock<HashMap<String, SymbolState>>>;
type CallbackMap = Arc<RwLock<HashMap<String, Vec<Arc<PriceCallback>>>>>;

/// Price monitoring service
pub struct PriceMonitor {
    feed: Arc<dyn PriceFeed>,
    market: Arc<dyn MarketData>,
    store: Arc<dyn OrderStore>,
    sink: Arc<dyn TriggerSink>,
    config: MonitorConfig,
    policy: OrderPolicyConfig,
    subscriptions: SubscriptionMap,
    callbacks: CallbackMap,
    running: Arc<AtomicBool>,
    status: Arc<RwLock<MonitorStatus>>,
}

impl PriceMonitor {
    pub fn new(
        feed: Arc<dyn PriceFeed>,
        market: Arc<dyn MarketData>,
        store: Arc<dyn OrderStore>,
        sink: Arc<dyn TriggerSink>,
        config: MonitorConfig,
        policy: OrderPolicyConfig,
    ) -> Self {
        Self {
            feed,
            market,
            store,
            sink,
            config,
            policy,
            subscriptions: Arc::new(RwLock::new(HashMap::new())),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            running: Arc::new(AtomicBool::new(false)),
            status: Arc::new(RwLock::new(MonitorStatus::default())),
        }
    }

    /// Increment the symbol's reference count, creating the feed
    /// subscription on first reference.
    pub async fn subscribe(&self, symbol: &str) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        if let Some(state) = subs.get_mut(symbol) {
            state.ref_count += 1;
            debug!(symbol, ref_count = state.ref_count, "subscription ref added");
            return Ok(());
        }

        self.feed.subscribe(symbol).await?;
        subs.insert(
            symbol.to_string(),
            SymbolState {
                ref_count: 1,
                last_price: None,
                last_update: None,
            },
        );
        info!(symbol, "subscribed to price feed");
        Ok(())
    }

    /// Decrement the symbol's reference count, tearing down the feed
    /// subscription when it reaches zero.
    pub async fn unsubscribe(&self, symbol: &str) -> Result<()> {
        let mut subs = self.subscriptions.write().await;
        let Some(state) = subs.get_mut(symbol) else {
            return Ok(());
        };
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 {
            subs.remove(symbol);
            self.feed.unsubscribe(symbol).await?;
            info!(symbol, "unsubscribed from price feed");
        }
        Ok(())
    }

    /// Register a per-tick callback for a symbol. Callbacks run detached
    /// from the feed loop; a slow or panicking callback cannot stall it.
    pub async fn register_callback(&self, symbol: &str, callback: Arc<PriceCallback>) {
        let mut callbacks = self.callbacks.write().await;
        callbacks.entry(symbol.to_string()).or_default().push(callback);
    }

    /// Last known price and whether it is fresh (age within the staleness
    /// threshold). The numeric value is returned even when stale.
    pub async fn get_price(&self, symbol: &str) -> Option<(Decimal, bool)> {
        let staleness = Duration::seconds(self.config.staleness_secs as i64);
        let subs = self.subscriptions.read().await;
        let state = subs.get(symbol)?;
        let price = state.last_price?;
        let fresh = state
            .last_update
            .is_some_and(|t| Utc::now() - t <= staleness);
        Some((price, fresh))
    }

    pub async fn status(&self) -> MonitorStatus {
        self.status.read().await.clone()
    }

    /// Start the feed reader, trigger-check, resubscription, and fallback
    /// poll loops.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("price monitor already running");
            return;
        }

        info!(
            trigger_check_ms = self.config.trigger_check_ms,
            resubscribe_secs = self.config.resubscribe_secs,
            fallback_poll_secs = self.config.fallback_poll_secs,
            "starting price monitor"
        );

        self.spawn_feed_loop();
        self.spawn_trigger_check_loop();
        self.spawn_resubscribe_loop();
        self.spawn_fallback_loop();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("price monitor stop requested");
    }

    fn spawn_feed_loop(&self) {
        let feed = self.feed.clone();
        let subscriptions = self.subscriptions.clone();
        let callbacks = self.callbacks.clone();
        let status = self.status.clone();
        let running = self.running.clone();
        let reconnect_delay = tokio::time::Duration::from_secs(self.config.reconnect_delay_secs);
        let max_attempts = self.config.max_reconnect_attempts;

        tokio::spawn(async move {
            let mut consecutive_failures = 0u32;

            while running.load(Ordering::SeqCst) {
                let mut rx = match feed.connect().await {
                    Ok(rx) => {
                        consecutive_failures = 0;
                        {
                            let mut s = status.write().await;
                            s.connected = true;
                            s.last_error = None;
                        }
                        // Restore subscriptions lost with the old connection
                        let symbols: Vec<String> =
                            subscriptions.read().await.keys().cloned().collect();
                        for symbol in symbols {
                            if let Err(e) = feed.subscribe(&symbol).await {
                                warn!(symbol, error = %e, "resubscribe after reconnect failed");
                            }
                        }
                        rx
                    }
                    Err(e) => {
                        consecutive_failures += 1;
                        error!(
                            error = %e,
                            attempt = consecutive_failures,
                            "price feed connect failed"
                        );
                        {
                            let mut s = status.write().await;
                            s.connected = false;
                            s.last_error = Some(e.to_string());
                        }
                        if consecutive_failures >= max_attempts {
                            error!("price feed reconnect attempts exhausted, feed loop stopping");
                            return;
                        }
                        tokio::time::sleep(reconnect_delay).await;
                        continue;
                    }
                };

                loop {
                    // Poll the stop flag once a second while waiting on ticks
                    let tick = tokio::select! {
                        tick = rx.recv() => tick,
                        _ = tokio::time::sleep(tokio::time::Duration::from_secs(1)) => {
                            if !running.load(Ordering::SeqCst) {
                                return;
                            }
                            continue;
                        }
                    };
                    match tick {
                        Some(tick) => {
                            Self::handle_tick(&subscriptions, &callbacks, &status, tick).await;
                        }
                        None => break,
                    }
                }

                if !running.load(Ordering::SeqCst) {
                    break;
                }

                warn!("price feed disconnected, reconnecting");
                {
                    let mut s = status.write().await;
                    s.connected = false;
                    s.reconnect_count += 1;
                }
                tokio::time::sleep(reconnect_delay).await;
            }

            info!("price feed loop stopped");
        });
    }

    fn spawn_trigger_check_loop(&self) {
        let store = self.store.clone();
        let sink = self.sink.clone();
        let subscriptions = self.subscriptions.clone();
        let running = self.running.clone();
        let policy = self.policy.clone();
        let interval_ms = self.config.trigger_check_ms;

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_millis(interval_ms));
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) =
                    Self::run_trigger_check(store.as_ref(), &sink, &subscriptions, &policy).await
                {
                    error!(error = %e, "trigger check cycle failed");
                }
            }
            info!("trigger check loop stopped");
        });
    }

    fn spawn_resubscribe_loop(&self) {
        let store = self.store.clone();
        let feed = self.feed.clone();
        let subscriptions = self.subscriptions.clone();
        let running = self.running.clone();
        let interval_secs = self.config.resubscribe_secs;

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) =
                    Self::run_resubscribe(store.as_ref(), feed.as_ref(), &subscriptions).await
                {
                    error!(error = %e, "resubscription sweep failed");
                }
            }
            info!("resubscription loop stopped");
        });
    }

    fn spawn_fallback_loop(&self) {
        let store = self.store.clone();
        let market = self.market.clone();
        let sink = self.sink.clone();
        let subscriptions = self.subscriptions.clone();
        let running = self.running.clone();
        let policy = self.policy.clone();
        let interval_secs = self.config.fallback_poll_secs;

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(interval_secs));
            while running.load(Ordering::SeqCst) {
                interval.tick().await;
                if let Err(e) = Self::run_fallback_poll(
                    store.as_ref(),
                    market.as_ref(),
                    &sink,
                    &subscriptions,
                    &policy,
                )
                .await
                {
                    error!(error = %e, "fallback poll failed");
                }
            }
            info!("fallback poll loop stopped");
        });
    }

    async fn handle_tick(
        subscriptions: &SubscriptionMap,
        callbacks: &CallbackMap,
        status: &RwLock<MonitorStatus>,
        tick: PriceTick,
    ) {
        {
            let mut subs = subscriptions.write().await;
            if let Some(state) = subs.get_mut(&tick.symbol) {
                state.last_price = Some(tick.price);
                state.last_update = Some(tick.timestamp);
            }
        }
        {
            let mut s = status.write().await;
            s.last_heartbeat = Some(Utc::now());
        }

        let symbol_callbacks: Vec<Arc<PriceCallback>> = {
            let cbs = callbacks.read().await;
            cbs.get(&tick.symbol).cloned().unwrap_or_default()
        };
        for callback in symbol_callbacks {
            let tick = tick.clone();
            tokio::spawn(async move {
                let result = std::panic::catch_unwind(AssertUnwindSafe(|| callback(&tick)));
                if result.is_err() {
                    error!(symbol = %tick.symbol, "price callback panicked");
                }
            });
        }
    }

    /// One pass over all PENDING orders against the latest known prices
    async fn run_trigger_check(
        store: &dyn OrderStore,
        sink: &Arc<dyn TriggerSink>,
        subscriptions: &SubscriptionMap,
        policy: &OrderPolicyConfig,
    ) -> Result<()> {
        let pending = store.list_by_status(OrderStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let prices: HashMap<String, Decimal> = {
            let subs = subscriptions.read().await;
            subs.iter()
                .filter_map(|(symbol, state)| state.last_price.map(|p| (symbol.clone(), p)))
                .collect()
        };

        for order in pending {
            let Some(price) = prices.get(&order.symbol).copied() else {
                continue;
            };
            let order_id = order.id;
            if let Err(e) = Self::evaluate_order(store, sink, order, price, policy).await {
                warn!(%order_id, error = %e, "order evaluation failed, continuing pass");
            }
        }
        Ok(())
    }

    /// Lifetime and deviation guards, then the trigger predicate. Triggered
    /// orders are handed to the sink on a detached task; status stays
    /// untouched here.
    async fn evaluate_order(
        store: &dyn OrderStore,
        sink: &Arc<dyn TriggerSink>,
        order: PendingOrder,
        price: Decimal,
        policy: &OrderPolicyConfig,
    ) -> Result<()> {
        let max_age = Duration::hours(policy.max_age_hours);
        if order.age() > max_age {
            let reason = format!("Order too old (>{}h)", policy.max_age_hours);
            if store.cancel_order(order.id, &reason).await? {
                info!(order_id = %order.id, symbol = %order.symbol, "cancelled overage order");
            }
            return Ok(());
        }

        let deviation = order.trigger_deviation(price);
        if deviation > policy.max_price_deviation {
            let reason = format!(
                "Price deviation too high: {:.2}% (current: {}, trigger: {}, max: {:.2}%)",
                deviation.to_f64().unwrap_or(0.0) * 100.0,
                price,
                order.trigger_price,
                policy.max_price_deviation.to_f64().unwrap_or(0.0) * 100.0,
            );
            if store.cancel_order(order.id, &reason).await? {
                info!(
                    order_id = %order.id,
                    symbol = %order.symbol,
                    %deviation,
                    "cancelled deviated order"
                );
            }
            return Ok(());
        }

        if order.is_trigger_hit(price) {
            info!(
                order_id = %order.id,
                symbol = %order.symbol,
                %price,
                trigger = %order.trigger_price,
                "trigger condition met"
            );
            let sink = sink.clone();
            tokio::spawn(async move {
                let result = AssertUnwindSafe(sink.on_trigger(order, price))
                    .catch_unwind()
                    .await;
                if result.is_err() {
                    error!("trigger handler panicked");
                }
            });
        }
        Ok(())
    }

    /// Re-derive the watch set from the store and subscribe anything the
    /// feed is missing. Heals subscriptions dropped by restarts or races.
    async fn run_resubscribe(
        store: &dyn OrderStore,
        feed: &dyn PriceFeed,
        subscriptions: &SubscriptionMap,
    ) -> Result<()> {
        let pending = store.list_by_status(OrderStatus::Pending).await?;
        let mut subs = subscriptions.write().await;
        for order in pending {
            if subs.contains_key(&order.symbol) {
                continue;
            }
            if let Err(e) = feed.subscribe(&order.symbol).await {
                warn!(symbol = %order.symbol, error = %e, "resubscribe failed");
                continue;
            }
            debug!(symbol = %order.symbol, "resubscribed missing symbol");
            subs.insert(
                order.symbol.clone(),
                SymbolState {
                    ref_count: 1,
                    last_price: None,
                    last_update: None,
                },
            );
        }
        Ok(())
    }

    /// Out-of-band redundancy: fetch prices synchronously and run the same
    /// evaluation, so triggers still fire if the push feed dies quietly.
    async fn run_fallback_poll(
        store: &dyn OrderStore,
        market: &dyn MarketData,
        sink: &Arc<dyn TriggerSink>,
        subscriptions: &SubscriptionMap,
        policy: &OrderPolicyConfig,
    ) -> Result<()> {
        let pending = store.list_by_status(OrderStatus::Pending).await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut by_symbol: HashMap<String, Vec<PendingOrder>> = HashMap::new();
        for order in pending {
            by_symbol.entry(order.symbol.clone()).or_default().push(order);
        }

        for (symbol, orders) in by_symbol {
            let price = match market.current_price(&symbol).await {
                Ok(price) => price,
                Err(e) => {
                    debug!(symbol, error = %e, "fallback price lookup failed");
                    continue;
                }
            };

            {
                let mut subs = subscriptions.write().await;
                if let Some(state) = subs.get_mut(&symbol) {
                    state.last_price = Some(price);
                    state.last_update = Some(Utc::now());
                }
            }

            for order in orders {
                let order_id = order.id;
                if let Err(e) = Self::evaluate_order(store, sink, order, price, policy).await {
                    warn!(%order_id, error = %e, "order evaluation failed, continuing pass");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{IntentAction, TradeIntent, TradeRecord};
    use crate::error::TripwireError;
    use crate::exchange::{MockMarketData, MockPriceFeed};
    use crate::store::MemoryOrderStore;
    use rust_decimal_macros::dec;
    use std::sync::atomic::AtomicU32;
    use tokio::sync::{mpsc, Mutex};
    use uuid::Uuid;

    struct RecordingSink {
        hits: Mutex<Vec<(Uuid, Decimal)>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TriggerSink for RecordingSink {
        async fn on_trigger(&self, order: PendingOrder, price: Decimal) {
            self.hits.lock().await.push((order.id, price));
        }
    }

    fn long_order(trigger: Decimal) -> PendingOrder {
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
        PendingOrder::from_intent("trader-1", &intent, trigger, Duration::hours(24))
    }

    fn monitor_with(feed: MockPriceFeed, store: Arc<dyn OrderStore>) -> PriceMonitor {
        let mut market = MockMarketData::new();
        market.expect_current_price().never();
        PriceMonitor::new(
            Arc::new(feed),
            Arc::new(market),
            store,
            RecordingSink::new(),
            MonitorConfig::default(),
            OrderPolicyConfig::default(),
        )
    }

    /// Feed whose first connection dies immediately, then stays up
    #[derive(Default)]
    struct FlakyFeed {
        connects: AtomicU32,
        subscribes: std::sync::Mutex<Vec<String>>,
        keep: Mutex<Option<mpsc::Sender<PriceTick>>>,
    }

    #[async_trait]
    impl PriceFeed for FlakyFeed {
        async fn connect(&self) -> Result<mpsc::Receiver<PriceTick>> {
            let (tx, rx) = mpsc::channel(8);
            if self.connects.fetch_add(1, Ordering::SeqCst) == 0 {
                drop(tx);
            } else {
                *self.keep.lock().await = Some(tx);
            }
            Ok(rx)
        }

        async fn subscribe(&self, symbol: &str) -> Result<()> {
            self.subscribes.lock().unwrap().push(symbol.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, _symbol: &str) -> Result<()> {
            Ok(())
        }
    }

    /// Store whose cancel always fails, counting the attempts
    struct CancelFailStore {
        inner: MemoryOrderStore,
        cancel_attempts: AtomicU32,
    }

    #[async_trait]
    impl OrderStore for CancelFailStore {
        async fn save_order(&self, order: &PendingOrder) -> Result<()> {
            self.inner.save_order(order).await
        }
        async fn get_order(&self, id: Uuid) -> Result<Option<PendingOrder>> {
            self.inner.get_order(id).await
        }
        async fn list_by_trader(&self, trader_id: &str) -> Result<Vec<PendingOrder>> {
            self.inner.list_by_trader(trader_id).await
        }
        async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<PendingOrder>> {
            self.inner.list_by_status(status).await
        }
        async fn list_by_trader_and_status(
            &self,
            trader_id: &str,
            status: OrderStatus,
        ) -> Result<Vec<PendingOrder>> {
            self.inner.list_by_trader_and_status(trader_id, status).await
        }
        async fn list_traders(&self) -> Result<Vec<String>> {
            self.inner.list_traders().await
        }
        async fn count_pending(&self, trader_id: &str) -> Result<i64> {
            self.inner.count_pending(trader_id).await
        }
        async fn cancel_order(&self, _id: Uuid, _reason: &str) -> Result<bool> {
            self.cancel_attempts.fetch_add(1, Ordering::SeqCst);
            Err(TripwireError::Internal("cancel failed".to_string()))
        }
        async fn try_claim(&self, id: Uuid) -> Result<bool> {
            self.inner.try_claim(id).await
        }
        async fn release_claim(&self, id: Uuid) -> Result<()> {
            self.inner.release_claim(id).await
        }
        async fn mark_triggered(
            &self,
            id: Uuid,
            triggered_price: Decimal,
            triggered_at: DateTime<Utc>,
        ) -> Result<()> {
            self.inner.mark_triggered(id, triggered_price, triggered_at).await
        }
        async fn mark_filled(
            &self,
            id: Uuid,
            triggered_price: Decimal,
            filled_at: DateTime<Utc>,
            exchange_order_id: i64,
        ) -> Result<bool> {
            self.inner
                .mark_filled(id, triggered_price, filled_at, exchange_order_id)
                .await
        }
        async fn mark_expired_orders(&self, trader_id: &str) -> Result<u64> {
            self.inner.mark_expired_orders(trader_id).await
        }
        async fn cancel_orders_older_than(&self, trader_id: &str, max_age: Duration) -> Result<u64> {
            self.inner.cancel_orders_older_than(trader_id, max_age).await
        }
        async fn cancel_oldest_over_cap(&self, trader_id: &str, keep: usize) -> Result<u64> {
            self.inner.cancel_oldest_over_cap(trader_id, keep).await
        }
        async fn reset_stuck_claims(&self, grace: Duration) -> Result<u64> {
            self.inner.reset_stuck_claims(grace).await
        }
        async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
            self.inner.purge_terminal_older_than(cutoff).await
        }
        async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
            self.inner.save_trade(trade).await
        }
        async fn list_trades_by_trader(
            &self,
            trader_id: &str,
            limit: i64,
        ) -> Result<Vec<TradeRecord>> {
            self.inner.list_trades_by_trader(trader_id, limit).await
        }
    }

    #[tokio::test]
    async fn subscribe_is_ref_counted() {
        let mut feed = MockPriceFeed::new();
        feed.expect_subscribe().times(1).returning(|_| Ok(()));
        feed.expect_unsubscribe().times(1).returning(|_| Ok(()));

        let monitor = monitor_with(feed, Arc::new(MemoryOrderStore::new()));
        monitor.subscribe("BTCUSDT").await.unwrap();
        monitor.subscribe("BTCUSDT").await.unwrap();

        monitor.unsubscribe("BTCUSDT").await.unwrap();
        // Still one reference held
        assert!(monitor.subscriptions.read().await.contains_key("BTCUSDT"));

        monitor.unsubscribe("BTCUSDT").await.unwrap();
        assert!(!monitor.subscriptions.read().await.contains_key("BTCUSDT"));
    }

    #[tokio::test]
    async fn tick_updates_price_and_freshness() {
        let mut feed = MockPriceFeed::new();
        feed.expect_subscribe().returning(|_| Ok(()));

        let monitor = monitor_with(feed, Arc::new(MemoryOrderStore::new()));
        monitor.subscribe("BTCUSDT").await.unwrap();

        assert_eq!(monitor.get_price("BTCUSDT").await, None);

        PriceMonitor::handle_tick(
            &monitor.subscriptions,
            &monitor.callbacks,
            &monitor.status,
            PriceTick {
                symbol: "BTCUSDT".to_string(),
                price: dec!(50000),
                timestamp: Utc::now(),
            },
        )
        .await;

        assert_eq!(monitor.get_price("BTCUSDT").await, Some((dec!(50000), true)));
    }

    #[tokio::test]
    async fn stale_price_reported_not_fresh() {
        let mut feed = MockPriceFeed::new();
        feed.expect_subscribe().returning(|_| Ok(()));

        let monitor = monitor_with(feed, Arc::new(MemoryOrderStore::new()));
        monitor.subscribe("BTCUSDT").await.unwrap();

        PriceMonitor::handle_tick(
            &monitor.subscriptions,
            &monitor.callbacks,
            &monitor.status,
            PriceTick {
                symbol: "BTCUSDT".to_string(),
                price: dec!(50000),
                timestamp: Utc::now() - Duration::seconds(120),
            },
        )
        .await;

        assert_eq!(
            monitor.get_price("BTCUSDT").await,
            Some((dec!(50000), false))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn callback_panic_does_not_stall_later_ticks() {
        let mut feed = MockPriceFeed::new();
        feed.expect_subscribe().returning(|_| Ok(()));

        let monitor = monitor_with(feed, Arc::new(MemoryOrderStore::new()));
        monitor.subscribe("BTCUSDT").await.unwrap();

        monitor
            .register_callback("BTCUSDT", Arc::new(|_tick: &PriceTick| panic!("bad callback")))
            .await;
        let seen = Arc::new(AtomicU32::new(0));
        let seen_cb = seen.clone();
        monitor
            .register_callback(
                "BTCUSDT",
                Arc::new(move |_tick: &PriceTick| {
                    seen_cb.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await;

        for price in [dec!(100), dec!(101), dec!(102)] {
            PriceMonitor::handle_tick(
                &monitor.subscriptions,
                &monitor.callbacks,
                &monitor.status,
                PriceTick::now("BTCUSDT", price),
            )
            .await;
        }

        // Callback dispatch is detached
        for _ in 0..50 {
            if seen.load(Ordering::SeqCst) == 3 {
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(
            monitor.get_price("BTCUSDT").await,
            Some((dec!(102), true))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn feed_reconnects_and_resubscribes() {
        let feed = Arc::new(FlakyFeed::default());
        let mut market = MockMarketData::new();
        market.expect_current_price().never();

        let mut config = MonitorConfig::default();
        config.reconnect_delay_secs = 0;

        let monitor = PriceMonitor::new(
            feed.clone(),
            Arc::new(market),
            Arc::new(MemoryOrderStore::new()),
            RecordingSink::new(),
            config,
            OrderPolicyConfig::default(),
        );
        monitor.subscribe("BTCUSDT").await.unwrap();
        monitor.start();

        let mut reconnected = false;
        for _ in 0..100 {
            let status = monitor.status().await;
            if status.reconnect_count >= 1 && status.connected {
                reconnected = true;
                break;
            }
            tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
        }
        monitor.stop();
        assert!(reconnected, "feed never reconnected");

        // Initial subscribe plus one restore per established connection
        let subscribed = feed
            .subscribes
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.as_str() == "BTCUSDT")
            .count();
        assert!(subscribed >= 3, "symbol not restored after reconnect: {subscribed}");
    }

    #[tokio::test]
    async fn failed_cancel_does_not_abort_trigger_pass() {
        let store = CancelFailStore {
            inner: MemoryOrderStore::new(),
            cancel_attempts: AtomicU32::new(0),
        };
        // Two orders far past the deviation limit; each cancel fails
        store.save_order(&long_order(dec!(100))).await.unwrap();
        store.save_order(&long_order(dec!(100))).await.unwrap();

        let subscriptions: SubscriptionMap = Arc::new(RwLock::new(HashMap::new()));
        subscriptions.write().await.insert(
            "BTCUSDT".to_string(),
            SymbolState {
                ref_count: 1,
                last_price: Some(dec!(130)),
                last_update: Some(Utc::now()),
            },
        );

        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn TriggerSink> = sink.clone();
        PriceMonitor::run_trigger_check(
            &store,
            &sink_dyn,
            &subscriptions,
            &OrderPolicyConfig::default(),
        )
        .await
        .unwrap();

        assert_eq!(store.cancel_attempts.load(Ordering::SeqCst), 2);
        assert!(sink.hits.lock().await.is_empty());
    }

    #[tokio::test]
    async fn trigger_hit_reaches_sink() {
        let store = MemoryOrderStore::new();
        let order = long_order(dec!(100));
        store.save_order(&order).await.unwrap();

        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn TriggerSink> = sink.clone();
        PriceMonitor::evaluate_order(
            &store,
            &sink_dyn,
            order.clone(),
            dec!(101),
            &OrderPolicyConfig::default(),
        )
        .await
        .unwrap();

        // Dispatch is detached
        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        let hits = sink.hits.lock().await;
        assert_eq!(hits.as_slice(), &[(order.id, dec!(101))]);
    }

    #[tokio::test]
    async fn below_trigger_does_not_fire() {
        let store = MemoryOrderStore::new();
        let order = long_order(dec!(100));
        store.save_order(&order).await.unwrap();

        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn TriggerSink> = sink.clone();
        PriceMonitor::evaluate_order(
            &store,
            &sink_dyn,
            order.clone(),
            dec!(99),
            &OrderPolicyConfig::default(),
        )
        .await
        .unwrap();

        tokio::time::sleep(tokio::time::Duration::from_millis(50)).await;
        assert!(sink.hits.lock().await.is_empty());
        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
    }

    #[tokio::test]
    async fn deviated_order_cancelled_instead_of_fired() {
        let store = MemoryOrderStore::new();
        // Short order: trigger 100, price at 130 is 30% past it
        let mut order = long_order(dec!(100));
        order.stop_loss = dec!(130);
        order.take_profit = dec!(80);
        store.save_order(&order).await.unwrap();

        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn TriggerSink> = sink.clone();
        PriceMonitor::evaluate_order(
            &store,
            &sink_dyn,
            order.clone(),
            dec!(130),
            &OrderPolicyConfig::default(),
        )
        .await
        .unwrap();

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(stored.cancel_reason.unwrap().contains("deviation"));
        assert!(sink.hits.lock().await.is_empty());
    }

    #[tokio::test]
    async fn overage_order_cancelled() {
        let store = MemoryOrderStore::new();
        let mut order = long_order(dec!(100));
        order.created_at = Utc::now() - Duration::hours(13);
        store.save_order(&order).await.unwrap();

        let sink = RecordingSink::new();
        let sink_dyn: Arc<dyn TriggerSink> = sink.clone();
        PriceMonitor::evaluate_order(
            &store,
            &sink_dyn,
            order.clone(),
            dec!(101),
            &OrderPolicyConfig::default(),
        )
        .await
        .unwrap();

        let stored = store.get_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(sink.hits.lock().await.is_empty());
    }
}

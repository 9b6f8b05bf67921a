//! Lifecycle cleanup background service
//!
//! Periodic per-trader sweep over pending orders:
//! - expire orders past their TTL
//! - cancel orders past the hard age limit
//! - cancel orders whose live price drifted too far from the trigger
//! - enforce the per-trader pending cap, newest retained
//! - cancel orders on symbols that keep failing price lookups
//! - deduplicate same-symbol orders
//! - purge terminal records past retention and recover stuck claims

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{CleanupConfig, ExecutionConfig, OrderPolicyConfig};
use crate::dedup;
use crate::domain::{OrderStatus, PendingOrder};
use crate::error::Result;
use crate::exchange::MarketData;
use crate::store::OrderStore;

/// Counters from one sweep pass, for logging and tests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: u64,
    pub overage_cancelled: u64,
    pub deviation_cancelled: u64,
    pub cap_cancelled: u64,
    pub symbol_cancelled: u64,
    pub duplicates_cancelled: u64,
    pub claims_reset: u64,
    pub purged: u64,
}

impl SweepReport {
    fn total(&self) -> u64 {
        self.expired
            + self.overage_cancelled
            + self.deviation_cancelled
            + self.cap_cancelled
            + self.symbol_cancelled
            + self.duplicates_cancelled
    }
}

/// Order lifecycle sweeper
pub struct LifecycleSweeper {
    store: Arc<dyn OrderStore>,
    market: Arc<dyn MarketData>,
    policy: OrderPolicyConfig,
    config: CleanupConfig,
    execution: ExecutionConfig,
    /// Consecutive price lookup failures per symbol
    symbol_failures: Mutex<HashMap<String, u32>>,
    running: Arc<AtomicBool>,
}

impl LifecycleSweeper {
    pub fn new(
        store: Arc<dyn OrderStore>,
        market: Arc<dyn MarketData>,
        policy: OrderPolicyConfig,
        config: CleanupConfig,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            store,
            market,
            policy,
            config,
            execution,
            symbol_failures: Mutex::new(HashMap::new()),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start the sweep loop
    pub fn start(self: Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("lifecycle sweeper already running");
            return;
        }

        info!(interval_secs = self.config.interval_secs, "starting lifecycle sweeper");

        let sweeper = self;
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(sweeper.config.interval_secs));
            while sweeper.running.load(Ordering::SeqCst) {
                interval.tick().await;
                match sweeper.run_sweep().await {
                    Ok(report) if report.total() > 0 || report.claims_reset > 0 => {
                        info!(?report, "cleanup sweep finished");
                    }
                    Ok(_) => debug!("cleanup sweep finished, nothing to do"),
                    Err(e) => error!(error = %e, "cleanup sweep failed"),
                }
            }
            info!("lifecycle sweeper stopped");
        });
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("lifecycle sweeper stop requested");
    }

    /// One full pass over all traders
    pub async fn run_sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();

        // A worker that died between claim and finalize must not pin its
        // order forever
        report.claims_reset = self
            .store
            .reset_stuck_claims(Duration::seconds(self.execution.claim_grace_secs as i64))
            .await?;
        if report.claims_reset > 0 {
            warn!(count = report.claims_reset, "reset stuck execution claims");
        }

        for trader_id in self.store.list_traders().await? {
            if let Err(e) = self.sweep_trader(&trader_id, &mut report).await {
                error!(trader_id, error = %e, "trader sweep failed");
            }
        }

        let cutoff = Utc::now() - Duration::days(self.config.retention_days);
        report.purged = self.store.purge_terminal_older_than(cutoff).await?;

        Ok(report)
    }

    async fn sweep_trader(&self, trader_id: &str, report: &mut SweepReport) -> Result<()> {
        report.expired += self.store.mark_expired_orders(trader_id).await?;

        report.overage_cancelled += self
            .store
            .cancel_orders_older_than(trader_id, Duration::hours(self.policy.max_age_hours))
            .await?;

        self.check_price_deviation(trader_id, report).await?;

        report.cap_cancelled += self
            .store
            .cancel_oldest_over_cap(trader_id, self.policy.max_pending_orders)
            .await?;

        report.duplicates_cancelled += dedup::clean_duplicates(self.store.as_ref(), trader_id).await?;

        Ok(())
    }

    /// Cancel orders whose live price drifted beyond the maximum from their
    /// trigger, and track symbols whose price lookups keep failing.
    async fn check_price_deviation(
        &self,
        trader_id: &str,
        report: &mut SweepReport,
    ) -> Result<()> {
        let pending = self
            .store
            .list_by_trader_and_status(trader_id, OrderStatus::Pending)
            .await?;
        if pending.is_empty() {
            return Ok(());
        }

        let mut by_symbol: HashMap<String, Vec<PendingOrder>> = HashMap::new();
        for order in pending {
            by_symbol.entry(order.symbol.clone()).or_default().push(order);
        }

        for (symbol, orders) in by_symbol {
            let price = match self.market.current_price(&symbol).await {
                Ok(price) => {
                    self.symbol_failures.lock().await.remove(&symbol);
                    price
                }
                Err(e) => {
                    let failures = {
                        let mut map = self.symbol_failures.lock().await;
                        let count = map.entry(symbol.clone()).or_insert(0);
                        *count += 1;
                        *count
                    };
                    warn!(symbol, failures, error = %e, "price lookup failed");

                    if failures >= self.config.max_symbol_failures {
                        let reason = format!(
                            "Invalid symbol or market data unavailable after {failures} attempts"
                        );
                        for order in &orders {
                            if self.store.cancel_order(order.id, &reason).await? {
                                report.symbol_cancelled += 1;
                            }
                        }
                        self.symbol_failures.lock().await.remove(&symbol);
                        info!(symbol, "cancelled orders on failing symbol");
                    }
                    continue;
                }
            };

            for order in orders {
                let deviation = order.trigger_deviation(price);
                if deviation > self.policy.max_price_deviation {
                    let reason = format!(
                        "Price deviation too high [{}]: {:.2}% (current: {}, trigger: {})",
                        order.direction(),
                        deviation.to_f64().unwrap_or(0.0) * 100.0,
                        price,
                        order.trigger_price,
                    );
                    if self.store.cancel_order(order.id, &reason).await? {
                        report.deviation_cancelled += 1;
                        info!(
                            order_id = %order.id,
                            symbol = %order.symbol,
                            %deviation,
                            "cancelled deviated order"
                        );
                    }
                }
            }
        }
        Ok(())
    }
}

mod memory;
mod postgres;

pub use memory::MemoryOrderStore;
pub use postgres::PostgresOrderStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::domain::{OrderStatus, PendingOrder, TradeRecord};
use crate::error::Result;

/// Durable store for pending orders and trade history.
///
/// The one non-negotiable primitive is `try_claim`: a single conditional
/// update that succeeds for exactly one concurrent caller. Everything else
/// is CRUD plus the bulk predicate updates the cleanup sweeper needs.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save_order(&self, order: &PendingOrder) -> Result<()>;

    async fn get_order(&self, id: Uuid) -> Result<Option<PendingOrder>>;

    async fn list_by_trader(&self, trader_id: &str) -> Result<Vec<PendingOrder>>;

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<PendingOrder>>;

    async fn list_by_trader_and_status(
        &self,
        trader_id: &str,
        status: OrderStatus,
    ) -> Result<Vec<PendingOrder>>;

    /// Distinct trader ids with at least one order, for the cleanup sweep.
    async fn list_traders(&self) -> Result<Vec<String>>;

    async fn count_pending(&self, trader_id: &str) -> Result<i64>;

    /// Transition a non-terminal order to CANCELLED with a reason.
    /// Returns false when the order was already terminal (or missing).
    async fn cancel_order(&self, id: Uuid, reason: &str) -> Result<bool>;

    /// Atomically claim the order for execution. Succeeds only while the row
    /// still satisfies `is_executing = false AND status = 'PENDING'`; the
    /// update sets the flag, stamps the claim time, and bumps
    /// execution_version. Exactly one of N concurrent callers wins.
    async fn try_claim(&self, id: Uuid) -> Result<bool>;

    /// Drop the executing flag without advancing status, so the order is
    /// re-evaluated on a later cycle.
    async fn release_claim(&self, id: Uuid) -> Result<()>;

    /// Record that the trigger condition was observed. Only called by the
    /// execution path, never by the monitor directly.
    async fn mark_triggered(
        &self,
        id: Uuid,
        triggered_price: Decimal,
        triggered_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Idempotent finalize: transition to FILLED, record fill details, and
    /// clear the executing flag. The predicate excludes terminal states, so
    /// a second call returns false and changes nothing.
    async fn mark_filled(
        &self,
        id: Uuid,
        triggered_price: Decimal,
        filled_at: DateTime<Utc>,
        exchange_order_id: i64,
    ) -> Result<bool>;

    /// Bulk: PENDING orders past expires_at become EXPIRED.
    async fn mark_expired_orders(&self, trader_id: &str) -> Result<u64>;

    /// Bulk: cancel PENDING orders older than max_age regardless of expiry.
    async fn cancel_orders_older_than(&self, trader_id: &str, max_age: Duration) -> Result<u64>;

    /// Enforce the per-trader cap: cancel the oldest PENDING orders so at
    /// most `keep` remain, newest retained.
    async fn cancel_oldest_over_cap(&self, trader_id: &str, keep: usize) -> Result<u64>;

    /// Recovery sweep for claims older than the grace period (a worker
    /// crashed mid-execution). PENDING rows get the flag cleared and are
    /// re-evaluated; TRIGGERED rows are cancelled with a reason, since the
    /// execution outcome is unknown and re-arming could double-execute.
    async fn reset_stuck_claims(&self, grace: Duration) -> Result<u64>;

    /// Retention: physically delete terminal orders created before cutoff.
    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Insert a trade history record. At most one record exists per pending
    /// order; a duplicate insert is a silent no-op.
    async fn save_trade(&self, trade: &TradeRecord) -> Result<()>;

    async fn list_trades_by_trader(&self, trader_id: &str, limit: i64) -> Result<Vec<TradeRecord>>;
}

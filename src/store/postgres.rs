use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use async_trait::async_trait;

use crate::domain::{OrderStatus, PendingOrder, TradeRecord};
use crate::error::{Result, TripwireError};
use crate::store::OrderStore;

/// PostgreSQL-backed order store
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const ORDER_COLUMNS: &str = "id, trader_id, symbol, analysis_id, target_price, trigger_price, \
     position_size, leverage, stop_loss, take_profit, confidence, status, \
     triggered_price, triggered_at, filled_at, executed_at, is_executing, \
     execution_version, claimed_at, created_at, expires_at, cancel_reason, \
     exchange_order_id";

fn row_to_order(row: &PgRow) -> Result<PendingOrder> {
    let status: String = row.get("status");
    let status = status
        .parse::<OrderStatus>()
        .map_err(TripwireError::Internal)?;
    let leverage: i32 = row.get("leverage");

    Ok(PendingOrder {
        id: row.get("id"),
        trader_id: row.get("trader_id"),
        symbol: row.get("symbol"),
        analysis_id: row.get("analysis_id"),
        target_price: row.get("target_price"),
        trigger_price: row.get("trigger_price"),
        position_size: row.get("position_size"),
        leverage: leverage as u32,
        stop_loss: row.get("stop_loss"),
        take_profit: row.get("take_profit"),
        confidence: row.get("confidence"),
        status,
        triggered_price: row.get("triggered_price"),
        triggered_at: row.get("triggered_at"),
        filled_at: row.get("filled_at"),
        executed_at: row.get("executed_at"),
        is_executing: row.get("is_executing"),
        execution_version: row.get("execution_version"),
        claimed_at: row.get("claimed_at"),
        created_at: row.get("created_at"),
        expires_at: row.get("expires_at"),
        cancel_reason: row.get("cancel_reason"),
        exchange_order_id: row.get("exchange_order_id"),
    })
}

fn row_to_trade(row: &PgRow) -> TradeRecord {
    let leverage: i32 = row.get("leverage");
    TradeRecord {
        id: row.get("id"),
        trader_id: row.get("trader_id"),
        symbol: row.get("symbol"),
        analysis_id: row.get("analysis_id"),
        pending_order_id: row.get("pending_order_id"),
        entry_price: row.get("entry_price"),
        quantity: row.get("quantity"),
        leverage: leverage as u32,
        confidence: row.get("confidence"),
        entry_time: row.get("entry_time"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    #[instrument(skip(self, order), fields(order_id = %order.id, symbol = %order.symbol))]
    async fn save_order(&self, order: &PendingOrder) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pending_orders (
                id, trader_id, symbol, analysis_id, target_price, trigger_price,
                position_size, leverage, stop_loss, take_profit, confidence, status,
                is_executing, execution_version, created_at, expires_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(order.id)
        .bind(&order.trader_id)
        .bind(&order.symbol)
        .bind(&order.analysis_id)
        .bind(order.target_price)
        .bind(order.trigger_price)
        .bind(order.position_size)
        .bind(order.leverage as i32)
        .bind(order.stop_loss)
        .bind(order.take_profit)
        .bind(order.confidence)
        .bind(order.status.as_str())
        .bind(order.is_executing)
        .bind(order.execution_version)
        .bind(order.created_at)
        .bind(order.expires_at)
        .execute(&self.pool)
        .await?;

        debug!("Pending order saved");
        Ok(())
    }

    async fn get_order(&self, id: Uuid) -> Result<Option<PendingOrder>> {
        let row = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM pending_orders WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_order).transpose()
    }

    async fn list_by_trader(&self, trader_id: &str) -> Result<Vec<PendingOrder>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM pending_orders
             WHERE trader_id = $1 ORDER BY created_at DESC"
        ))
        .bind(trader_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_order).collect()
    }

    async fn list_by_status(&self, status: OrderStatus) -> Result<Vec<PendingOrder>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM pending_orders
             WHERE status = $1 ORDER BY created_at DESC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_order).collect()
    }

    async fn list_by_trader_and_status(
        &self,
        trader_id: &str,
        status: OrderStatus,
    ) -> Result<Vec<PendingOrder>> {
        let rows = sqlx::query(&format!(
            "SELECT {ORDER_COLUMNS} FROM pending_orders
             WHERE trader_id = $1 AND status = $2 ORDER BY created_at DESC"
        ))
        .bind(trader_id)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_order).collect()
    }

    async fn list_traders(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT trader_id FROM pending_orders")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(|r| r.get("trader_id")).collect())
    }

    async fn count_pending(&self, trader_id: &str) -> Result<i64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count FROM pending_orders
            WHERE trader_id = $1
              AND status IN ('PENDING', 'TRIGGERED')
              AND expires_at > NOW()
            "#,
        )
        .bind(trader_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("count"))
    }

    async fn cancel_order(&self, id: Uuid, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'CANCELLED', cancel_reason = $2,
                is_executing = FALSE, claimed_at = NULL
            WHERE id = $1 AND status IN ('PENDING', 'TRIGGERED')
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn try_claim(&self, id: Uuid) -> Result<bool> {
        // The whole exactly-once guarantee rests on this single conditional
        // update. Zero rows affected means another worker already claimed.
        let result = sqlx::query(
            r#"
            UPDATE pending_orders
            SET is_executing = TRUE,
                execution_version = execution_version + 1,
                claimed_at = NOW()
            WHERE id = $1 AND is_executing = FALSE AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_claim(&self, id: Uuid) -> Result<()> {
        sqlx::query(
            "UPDATE pending_orders SET is_executing = FALSE, claimed_at = NULL WHERE id = $1",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_triggered(
        &self,
        id: Uuid,
        triggered_price: Decimal,
        triggered_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'TRIGGERED', triggered_price = $2, triggered_at = $3
            WHERE id = $1 AND status = 'PENDING'
            "#,
        )
        .bind(id)
        .bind(triggered_price)
        .bind(triggered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_filled(
        &self,
        id: Uuid,
        triggered_price: Decimal,
        filled_at: DateTime<Utc>,
        exchange_order_id: i64,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'FILLED', triggered_price = $2, triggered_at = $3,
                filled_at = $3, executed_at = NOW(),
                is_executing = FALSE, claimed_at = NULL,
                exchange_order_id = $4
            WHERE id = $1 AND status IN ('PENDING', 'TRIGGERED')
            "#,
        )
        .bind(id)
        .bind(triggered_price)
        .bind(filled_at)
        .bind(exchange_order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn mark_expired_orders(&self, trader_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'EXPIRED', cancel_reason = 'Order expired without being triggered'
            WHERE trader_id = $1 AND status = 'PENDING' AND expires_at < NOW()
            "#,
        )
        .bind(trader_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel_orders_older_than(&self, trader_id: &str, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now() - max_age;
        let reason = format!("Order too old (>{}h)", max_age.num_hours());
        let result = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'CANCELLED', cancel_reason = $3
            WHERE trader_id = $1 AND status = 'PENDING' AND created_at < $2
            "#,
        )
        .bind(trader_id)
        .bind(cutoff)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn cancel_oldest_over_cap(&self, trader_id: &str, keep: usize) -> Result<u64> {
        let reason = format!("Exceeded max pending orders limit ({keep})");
        let result = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'CANCELLED', cancel_reason = $3
            WHERE id IN (
                SELECT id FROM pending_orders
                WHERE trader_id = $1 AND status = 'PENDING' AND expires_at > NOW()
                ORDER BY created_at DESC
                OFFSET $2
            )
            "#,
        )
        .bind(trader_id)
        .bind(keep as i64)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn reset_stuck_claims(&self, grace: Duration) -> Result<u64> {
        let cutoff = Utc::now() - grace;
        let released = sqlx::query(
            r#"
            UPDATE pending_orders
            SET is_executing = FALSE, claimed_at = NULL
            WHERE is_executing = TRUE AND status = 'PENDING' AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        // A claim stuck in TRIGGERED means the worker died between trigger
        // and fill. The execution outcome is unknown, so the order is closed
        // out rather than re-armed.
        let cancelled = sqlx::query(
            r#"
            UPDATE pending_orders
            SET status = 'CANCELLED',
                cancel_reason = 'Execution interrupted between trigger and fill',
                is_executing = FALSE, claimed_at = NULL
            WHERE is_executing = TRUE AND status = 'TRIGGERED' AND claimed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(released + cancelled)
    }

    async fn purge_terminal_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM pending_orders
            WHERE status IN ('FILLED', 'CANCELLED', 'EXPIRED') AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn save_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_history (
                id, trader_id, symbol, analysis_id, pending_order_id,
                entry_price, quantity, leverage, confidence, entry_time, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (pending_order_id) DO NOTHING
            "#,
        )
        .bind(trade.id)
        .bind(&trade.trader_id)
        .bind(&trade.symbol)
        .bind(&trade.analysis_id)
        .bind(trade.pending_order_id)
        .bind(trade.entry_price)
        .bind(trade.quantity)
        .bind(trade.leverage as i32)
        .bind(trade.confidence)
        .bind(trade.entry_time)
        .bind(trade.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_trades_by_trader(&self, trader_id: &str, limit: i64) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, trader_id, symbol, analysis_id, pending_order_id,
                   entry_price, quantity, leverage, confidence, entry_time, created_at
            FROM trade_history
            WHERE trader_id = $1
            ORDER BY entry_time DESC
            LIMIT $2
            "#,
        )
        .bind(trader_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_trade).collect())
    }
}

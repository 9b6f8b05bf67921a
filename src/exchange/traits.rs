use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::mpsc;

use crate::domain::{Balance, OrderRef, PriceTick, TradeDirection};
use crate::error::Result;

/// Exchange-facing execution capability.
///
/// Per-exchange wire protocols live behind this seam; order-sync workers for
/// specific venues are adapters implementing it, not part of the engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn get_balance(&self) -> Result<Balance>;

    /// Open a leveraged position sized in quote currency.
    async fn open_position(
        &self,
        symbol: &str,
        direction: TradeDirection,
        size_usd: Decimal,
        leverage: u32,
    ) -> Result<OrderRef>;

    async fn set_stop_loss(
        &self,
        symbol: &str,
        direction: TradeDirection,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<()>;

    async fn set_take_profit(
        &self,
        symbol: &str,
        direction: TradeDirection,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<()>;

    /// Close an open position at market. Used as the safety exit when a
    /// protective order cannot be placed after entry.
    async fn close_position(&self, symbol: &str, direction: TradeDirection) -> Result<()>;
}

/// Synchronous market data lookup, used as the fallback path when the push
/// feed has no fresh price for a symbol.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarketData: Send + Sync {
    async fn current_price(&self, symbol: &str) -> Result<Decimal>;
}

/// Push-based price feed.
///
/// `connect` yields the tick stream; the monitor owns reconnection, so a
/// closed channel means the connection dropped and `connect` will be called
/// again after a backoff.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PriceFeed: Send + Sync {
    async fn connect(&self) -> Result<mpsc::Receiver<PriceTick>>;

    async fn subscribe(&self, symbol: &str) -> Result<()>;

    async fn unsubscribe(&self, symbol: &str) -> Result<()>;
}

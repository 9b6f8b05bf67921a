use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single price update from the push feed
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: String,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn now(symbol: &str, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            timestamp: Utc::now(),
        }
    }
}

/// Account balance snapshot from the exchange
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Balance {
    /// Free margin available for new positions
    pub available: Decimal,
    /// Total account equity
    pub equity: Decimal,
}

/// Reference to an order accepted by the exchange
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub exchange_order_id: i64,
    /// Executed quantity in base units, when the exchange reports it
    pub quantity: Option<Decimal>,
}

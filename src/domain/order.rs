use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trade direction, inferred from the relative ordering of stop-loss and
/// take-profit. The AI never states a side explicitly: a stop below the
/// target means the position profits from rising prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeDirection {
    Long,
    Short,
}

impl TradeDirection {
    /// stop_loss < take_profit implies long; the inverse implies short.
    pub fn infer(stop_loss: Decimal, take_profit: Decimal) -> Self {
        if stop_loss < take_profit {
            TradeDirection::Long
        } else {
            TradeDirection::Short
        }
    }
}

impl std::fmt::Display for TradeDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeDirection::Long => write!(f, "LONG"),
            TradeDirection::Short => write!(f, "SHORT"),
        }
    }
}

/// Opening action requested by an intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentAction {
    OpenLong,
    OpenShort,
}

impl IntentAction {
    pub fn direction(&self) -> TradeDirection {
        match self {
            IntentAction::OpenLong => TradeDirection::Long,
            IntentAction::OpenShort => TradeDirection::Short,
        }
    }
}

/// Pending order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    /// Waiting for the trigger condition
    Pending,
    /// Trigger condition met, execution in flight or complete
    Triggered,
    /// Executed on the exchange
    Filled,
    /// Cancelled (replaced, deviated, failed, capped)
    Cancelled,
    /// Expired without being triggered
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Triggered => "TRIGGERED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Expired => "EXPIRED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(OrderStatus::Pending),
            "TRIGGERED" => Ok(OrderStatus::Triggered),
            "FILLED" => Ok(OrderStatus::Filled),
            "CANCELLED" => Ok(OrderStatus::Cancelled),
            "EXPIRED" => Ok(OrderStatus::Expired),
            other => Err(format!("unknown order status: {other}")),
        }
    }
}

/// Trading intent produced by the AI decision layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub symbol: String,
    pub action: IntentAction,
    /// Position size in quote currency (USD)
    pub position_size: Decimal,
    pub leverage: u32,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    /// Confidence score, 0.0 to 1.0
    pub confidence: f64,
    /// Analysis record that produced this intent, if any
    #[serde(default)]
    pub analysis_id: Option<String>,
}

/// A conditional order awaiting its price trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOrder {
    pub id: Uuid,
    pub trader_id: String,
    pub symbol: String,
    pub analysis_id: Option<String>,
    /// AI target price (take-profit)
    pub target_price: Decimal,
    /// Price at which the order becomes executable
    pub trigger_price: Decimal,
    /// Position size in quote currency (USD)
    pub position_size: Decimal,
    pub leverage: u32,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub confidence: f64,
    pub status: OrderStatus,
    pub triggered_price: Option<Decimal>,
    pub triggered_at: Option<DateTime<Utc>>,
    pub filled_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    /// Claim flag for exactly-once execution; valid only while PENDING
    pub is_executing: bool,
    /// Incremented on every successful claim
    pub execution_version: i64,
    /// When the current claim was taken; used by the recovery sweep
    pub claimed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub cancel_reason: Option<String>,
    pub exchange_order_id: Option<i64>,
}

impl PendingOrder {
    pub fn from_intent(trader_id: &str, intent: &TradeIntent, trigger_price: Decimal, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trader_id: trader_id.to_string(),
            symbol: intent.symbol.clone(),
            analysis_id: intent.analysis_id.clone(),
            target_price: intent.take_profit,
            trigger_price,
            position_size: intent.position_size,
            leverage: intent.leverage,
            stop_loss: intent.stop_loss,
            take_profit: intent.take_profit,
            confidence: intent.confidence,
            status: OrderStatus::Pending,
            triggered_price: None,
            triggered_at: None,
            filled_at: None,
            executed_at: None,
            is_executing: false,
            execution_version: 0,
            claimed_at: None,
            created_at: now,
            expires_at: now + ttl,
            cancel_reason: None,
            exchange_order_id: None,
        }
    }

    pub fn direction(&self) -> TradeDirection {
        TradeDirection::infer(self.stop_loss, self.take_profit)
    }

    pub fn age(&self) -> Duration {
        Utc::now() - self.created_at
    }

    /// Long triggers when price rises to the trigger; short when it falls to it.
    pub fn is_trigger_hit(&self, current_price: Decimal) -> bool {
        match self.direction() {
            TradeDirection::Long => current_price >= self.trigger_price,
            TradeDirection::Short => current_price <= self.trigger_price,
        }
    }

    /// Direction-aware distance from trigger as a fraction of the trigger
    /// price. Positive means the price has not yet reached the trigger.
    pub fn trigger_deviation(&self, current_price: Decimal) -> Decimal {
        if self.trigger_price.is_zero() {
            return Decimal::ZERO;
        }
        let deviation = match self.direction() {
            TradeDirection::Long => (current_price - self.trigger_price) / self.trigger_price,
            TradeDirection::Short => (self.trigger_price - current_price) / self.trigger_price,
        };
        deviation.abs()
    }
}

/// Trade history entry recorded once per fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Uuid,
    pub trader_id: String,
    pub symbol: String,
    pub analysis_id: Option<String>,
    pub pending_order_id: Uuid,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    pub confidence: f64,
    pub entry_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn from_fill(order: &PendingOrder, entry_price: Decimal, quantity: Decimal) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            trader_id: order.trader_id.clone(),
            symbol: order.symbol.clone(),
            analysis_id: order.analysis_id.clone(),
            pending_order_id: order.id,
            entry_price,
            quantity,
            leverage: order.leverage,
            confidence: order.confidence,
            entry_time: now,
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_order() -> PendingOrder {
        let intent = TradeIntent {
            symbol: "BTCUSDT".to_string(),
            action: IntentAction::OpenLong,
            position_size: dec!(500),
            leverage: 5,
            stop_loss: dec!(95),
            take_profit: dec!(115),
            confidence: 0.8,
            analysis_id: None,
        };
        PendingOrder::from_intent("trader-1", &intent, dec!(100), Duration::hours(24))
    }

    #[test]
    fn direction_inferred_from_stop_ordering() {
        assert_eq!(
            TradeDirection::infer(dec!(95), dec!(115)),
            TradeDirection::Long
        );
        assert_eq!(
            TradeDirection::infer(dec!(115), dec!(95)),
            TradeDirection::Short
        );
    }

    #[test]
    fn long_trigger_fires_at_or_above_trigger() {
        let order = long_order();
        assert!(!order.is_trigger_hit(dec!(99.99)));
        assert!(order.is_trigger_hit(dec!(100)));
        assert!(order.is_trigger_hit(dec!(101)));
    }

    #[test]
    fn short_trigger_fires_at_or_below_trigger() {
        let mut order = long_order();
        order.stop_loss = dec!(115);
        order.take_profit = dec!(95);
        assert!(order.is_trigger_hit(dec!(100)));
        assert!(order.is_trigger_hit(dec!(98)));
        assert!(!order.is_trigger_hit(dec!(100.5)));
    }

    #[test]
    fn deviation_is_absolute() {
        let order = long_order();
        assert_eq!(order.trigger_deviation(dec!(110)), dec!(0.1));
        assert_eq!(order.trigger_deviation(dec!(90)), dec!(0.1));
    }

    #[test]
    fn terminal_statuses() {
        assert!(!OrderStatus::Pending.is_terminal());
        assert!(!OrderStatus::Triggered.is_terminal());
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Cancelled.is_terminal());
        assert!(OrderStatus::Expired.is_terminal());
    }

    #[test]
    fn expiry_follows_creation() {
        let order = long_order();
        assert!(order.expires_at > order.created_at);
    }
}

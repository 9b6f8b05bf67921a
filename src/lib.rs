pub mod cleanup;
pub mod config;
pub mod dedup;
pub mod domain;
pub mod engine;
pub mod error;
pub mod exchange;
pub mod executor;
pub mod logging;
pub mod monitor;
pub mod store;
pub mod trigger;

pub use cleanup::{LifecycleSweeper, SweepReport};
pub use config::{
    CleanupConfig, DatabaseConfig, EngineConfig, ExecutionConfig, LoggingConfig, MonitorConfig,
    OrderPolicyConfig,
};
pub use dedup::{order_score, ReplacementDecision, ReplacementPolicy};
pub use domain::{
    Balance, IntentAction, OrderRef, OrderStatus, PendingOrder, PriceTick, TradeDirection,
    TradeIntent, TradeRecord,
};
pub use engine::Engine;
pub use error::{Result, TripwireError};
pub use exchange::{ExchangeClient, MarketData, PriceFeed};
pub use executor::ExecutionCoordinator;
pub use monitor::{MonitorStatus, PriceMonitor, TriggerSink};
pub use store::{MemoryOrderStore, OrderStore, PostgresOrderStore};
pub use trigger::{TradingStyle, TriggerMode, TriggerPriceCalculator, TriggerPriceConfig};

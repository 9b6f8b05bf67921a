mod traits;

pub use traits::{ExchangeClient, MarketData, PriceFeed};

#[cfg(test)]
pub use traits::{MockExchangeClient, MockMarketData, MockPriceFeed};

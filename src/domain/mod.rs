mod market;
mod order;

pub use market::{Balance, OrderRef, PriceTick};
pub use order::{
    IntentAction, OrderStatus, PendingOrder, TradeDirection, TradeIntent, TradeRecord,
};

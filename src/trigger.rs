use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use tracing::warn;

use crate::domain::TradeDirection;

/// How the trigger is placed relative to the current price
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// Enter at (a hair off) the current price
    CurrentPrice,
    /// Wait for a retrace against the trade direction
    Pullback,
    /// Wait for a move through the current price in the trade direction
    Breakout,
}

/// Trading style, scaling how far from current price the trigger sits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingStyle {
    Scalp,
    ShortTerm,
    Swing,
    LongTerm,
}

/// Ratios driving trigger placement. Loaded from config or built from a
/// style preset.
#[derive(Debug, Clone, Deserialize)]
pub struct TriggerPriceConfig {
    #[serde(default = "default_mode")]
    pub mode: TriggerMode,
    #[serde(default = "default_style")]
    pub style: TradingStyle,
    /// Retrace depth as a fraction of current price
    #[serde(default = "default_pullback_ratio")]
    pub pullback_ratio: Decimal,
    /// Breakout distance as a fraction of current price
    #[serde(default = "default_breakout_ratio")]
    pub breakout_ratio: Decimal,
    /// Additional cushion applied on top of the pullback ratio
    #[serde(default = "default_extra_buffer")]
    pub extra_buffer: Decimal,
}

fn default_mode() -> TriggerMode {
    TriggerMode::Pullback
}
fn default_style() -> TradingStyle {
    TradingStyle::Swing
}
fn default_pullback_ratio() -> Decimal {
    dec!(0.02)
}
fn default_breakout_ratio() -> Decimal {
    dec!(0.015)
}
fn default_extra_buffer() -> Decimal {
    dec!(0.005)
}

impl Default for TriggerPriceConfig {
    fn default() -> Self {
        Self::for_style(TradingStyle::Swing)
    }
}

impl TriggerPriceConfig {
    /// Preset ratios per trading style
    pub fn for_style(style: TradingStyle) -> Self {
        let (pullback_ratio, breakout_ratio, extra_buffer) = match style {
            TradingStyle::Scalp => (dec!(0.005), dec!(0.003), dec!(0.001)),
            TradingStyle::ShortTerm => (dec!(0.01), dec!(0.008), dec!(0.002)),
            TradingStyle::Swing => (dec!(0.02), dec!(0.015), dec!(0.005)),
            TradingStyle::LongTerm => (dec!(0.03), dec!(0.025), dec!(0.01)),
        };
        Self {
            mode: TriggerMode::Pullback,
            style,
            pullback_ratio,
            breakout_ratio,
            extra_buffer,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        let half = dec!(0.5);
        if self.pullback_ratio < Decimal::ZERO || self.pullback_ratio >= half {
            return Err("trigger.pullback_ratio must be in [0, 0.5)".to_string());
        }
        if self.breakout_ratio < Decimal::ZERO || self.breakout_ratio >= half {
            return Err("trigger.breakout_ratio must be in [0, 0.5)".to_string());
        }
        if self.extra_buffer < Decimal::ZERO || self.extra_buffer >= half {
            return Err("trigger.extra_buffer must be in [0, 0.5)".to_string());
        }
        Ok(())
    }
}

/// Trigger price placement.
///
/// Pure and total: bad inputs degrade to the stop-loss, then to a
/// conservative constant, and the caller logs rather than aborts.
#[derive(Debug, Clone)]
pub struct TriggerPriceCalculator {
    config: TriggerPriceConfig,
}

const MAX_DEVIATION: Decimal = dec!(0.5);
const FALLBACK_PRICE: Decimal = dec!(100);

impl TriggerPriceCalculator {
    pub fn new(config: TriggerPriceConfig) -> Self {
        Self { config }
    }

    /// Unconstrained placement from current price and mode, sanity-clamped
    /// to within 50% of current price.
    pub fn calculate(
        &self,
        current_price: Decimal,
        direction: TradeDirection,
        stop_loss: Decimal,
    ) -> Decimal {
        if current_price <= Decimal::ZERO {
            warn!(%current_price, "invalid current price, using fallback trigger");
            return self.fallback(stop_loss);
        }

        let trigger = match self.config.mode {
            TriggerMode::CurrentPrice => {
                let buffer = current_price * self.config.extra_buffer;
                match direction {
                    TradeDirection::Long => current_price - buffer,
                    TradeDirection::Short => current_price + buffer,
                }
            }
            TriggerMode::Pullback => {
                let offset =
                    current_price * (self.config.pullback_ratio + self.config.extra_buffer);
                match direction {
                    TradeDirection::Long => current_price - offset,
                    TradeDirection::Short => current_price + offset,
                }
            }
            TriggerMode::Breakout => {
                let offset = current_price * self.config.breakout_ratio;
                match direction {
                    TradeDirection::Long => current_price + offset,
                    TradeDirection::Short => current_price - offset,
                }
            }
        };

        self.sanity_clamp(trigger, current_price)
    }

    /// Style-based placement constrained to lie strictly between stop-loss
    /// and take-profit, and on the correct side of current price for the
    /// trade direction.
    pub fn calculate_bounded(
        &self,
        current_price: Decimal,
        direction: TradeDirection,
        stop_loss: Decimal,
        take_profit: Decimal,
    ) -> Decimal {
        if current_price <= Decimal::ZERO {
            warn!(%current_price, "invalid current price, using fallback trigger");
            return self.fallback(stop_loss);
        }
        if stop_loss <= Decimal::ZERO || take_profit <= Decimal::ZERO {
            warn!(%stop_loss, %take_profit, "invalid band, using unconstrained trigger");
            return self.calculate(current_price, direction, stop_loss);
        }

        let trigger = match direction {
            TradeDirection::Long => self.bounded_long(current_price, stop_loss, take_profit),
            TradeDirection::Short => self.bounded_short(current_price, stop_loss, take_profit),
        };

        self.validate_in_range(trigger, stop_loss, take_profit, direction)
    }

    // Long entry waits for a retrace: trigger below current, above SL,
    // below TP.
    fn bounded_long(&self, current: Decimal, stop_loss: Decimal, take_profit: Decimal) -> Decimal {
        let sl_distance = current - stop_loss;
        let midpoint = (stop_loss + take_profit) / dec!(2);

        let mut trigger = match self.config.style {
            TradingStyle::Scalp => current * dec!(0.985),
            TradingStyle::ShortTerm => {
                if midpoint < current {
                    midpoint
                } else {
                    current * dec!(0.98)
                }
            }
            TradingStyle::Swing => {
                if midpoint < current {
                    midpoint
                } else {
                    current * dec!(0.97)
                }
            }
            TradingStyle::LongTerm => {
                if midpoint < current {
                    midpoint
                } else {
                    current * dec!(0.95)
                }
            }
        };

        if trigger <= stop_loss {
            trigger = stop_loss + sl_distance * dec!(0.1);
        }
        if trigger >= take_profit {
            trigger = take_profit * dec!(0.95);
        }
        if trigger >= current {
            trigger = current * dec!(0.98);
        }
        trigger
    }

    // Short entry waits for a bounce: trigger above current, below SL,
    // above TP.
    fn bounded_short(&self, current: Decimal, stop_loss: Decimal, take_profit: Decimal) -> Decimal {
        let sl_distance = stop_loss - current;
        let midpoint = (stop_loss + take_profit) / dec!(2);

        let mut trigger = match self.config.style {
            TradingStyle::Scalp => current * dec!(1.015),
            TradingStyle::ShortTerm => {
                if midpoint > current {
                    midpoint
                } else {
                    current * dec!(1.02)
                }
            }
            TradingStyle::Swing => {
                if midpoint > current {
                    midpoint
                } else {
                    current * dec!(1.03)
                }
            }
            TradingStyle::LongTerm => {
                if midpoint > current {
                    midpoint
                } else {
                    current * dec!(1.05)
                }
            }
        };

        if trigger >= stop_loss {
            trigger = stop_loss - sl_distance * dec!(0.1);
        }
        if trigger <= take_profit {
            trigger = take_profit * dec!(1.05);
        }
        if trigger <= current {
            trigger = current * dec!(1.02);
        }
        trigger
    }

    // Final gate: a bounded trigger must sit strictly inside the band or it
    // falls back to the band midpoint.
    fn validate_in_range(
        &self,
        trigger: Decimal,
        stop_loss: Decimal,
        take_profit: Decimal,
        direction: TradeDirection,
    ) -> Decimal {
        let midpoint = (stop_loss + take_profit) / dec!(2);
        let in_range = match direction {
            TradeDirection::Long => trigger > stop_loss && trigger < take_profit,
            TradeDirection::Short => trigger < stop_loss && trigger > take_profit,
        };
        if in_range {
            trigger
        } else {
            warn!(%trigger, %stop_loss, %take_profit, "trigger outside band, using midpoint");
            midpoint
        }
    }

    fn sanity_clamp(&self, trigger: Decimal, current_price: Decimal) -> Decimal {
        let diff = (trigger - current_price) / current_price;
        if diff.abs() > MAX_DEVIATION {
            warn!(%trigger, %current_price, "trigger deviates over 50% from current, using current");
            current_price
        } else {
            trigger
        }
    }

    fn fallback(&self, stop_loss: Decimal) -> Decimal {
        if stop_loss > Decimal::ZERO {
            stop_loss
        } else {
            warn!("no usable price data, using conservative default trigger");
            FALLBACK_PRICE
        }
    }
}

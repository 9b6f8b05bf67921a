use std::collections::HashMap;

use chrono::{Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};

use crate::domain::{OrderStatus, PendingOrder};
use crate::error::Result;
use crate::store::OrderStore;

/// Composite order quality score: confidence weighted 70%, freshness 30%.
/// Freshness decays exponentially with a 2 hour window, so an old
/// high-confidence order can lose to a fresh slightly-weaker one.
pub fn order_score(confidence: f64, age: Duration) -> f64 {
    let age_minutes = age.num_seconds() as f64 / 60.0;
    0.7 * confidence + 0.3 * (-age_minutes / 120.0).exp()
}

/// Outcome of checking a new intent against the existing order for its symbol
#[derive(Debug, Clone, PartialEq)]
pub enum ReplacementDecision {
    /// No conflicting order; persist the new one
    Accept,
    /// Cancel the existing order with this reason, then persist the new one
    Replace { reason: String },
    /// Keep the existing order, drop the new intent
    Reject { reason: String },
}

const REPLACE_AGE_HOURS: i64 = 6;
const REPLACE_AGE_MIN_CONFIDENCE: f64 = 0.70;
const REPLACE_DEVIATION: Decimal = dec!(0.10);
const REPLACE_DEVIATION_MIN_CONFIDENCE: f64 = 0.75;

/// Per-symbol replacement policy applied on the intent intake path.
///
/// The caller serializes decide + cancel + insert per trader; the policy
/// itself is pure.
#[derive(Debug, Clone)]
pub struct ReplacementPolicy {
    recent_fill_window: Duration,
}

impl ReplacementPolicy {
    pub fn new(recent_fill_window: Duration) -> Self {
        Self { recent_fill_window }
    }

    pub fn recent_fill_window(&self) -> Duration {
        self.recent_fill_window
    }

    /// Judge a new intent against the symbol's existing order, if any.
    ///
    /// A FILLED order younger than the recent-fill window blocks the intent
    /// outright. Against a live order the new intent wins when any of these
    /// holds: higher confidence; the existing order is over 6h old and the
    /// new confidence is at least 0.70; the live price has drifted more than
    /// 10% from the existing trigger and the new confidence is at least 0.75.
    pub fn decide(
        &self,
        existing: Option<&PendingOrder>,
        new_confidence: f64,
        current_price: Decimal,
    ) -> ReplacementDecision {
        let Some(existing) = existing else {
            return ReplacementDecision::Accept;
        };

        match existing.status {
            OrderStatus::Filled => {
                let Some(filled_at) = existing.filled_at else {
                    return ReplacementDecision::Accept;
                };
                let since_fill = Utc::now() - filled_at;
                if since_fill < self.recent_fill_window {
                    ReplacementDecision::Reject {
                        reason: format!(
                            "recently filled order ({:.1} min ago)",
                            since_fill.num_seconds() as f64 / 60.0
                        ),
                    }
                } else {
                    ReplacementDecision::Accept
                }
            }
            OrderStatus::Pending | OrderStatus::Triggered => {
                self.decide_against_live(existing, new_confidence, current_price)
            }
            OrderStatus::Cancelled | OrderStatus::Expired => ReplacementDecision::Accept,
        }
    }

    fn decide_against_live(
        &self,
        existing: &PendingOrder,
        new_confidence: f64,
        current_price: Decimal,
    ) -> ReplacementDecision {
        let age = existing.age();
        let deviation = if current_price > Decimal::ZERO && existing.trigger_price > Decimal::ZERO {
            ((current_price - existing.trigger_price) / existing.trigger_price).abs()
        } else {
            Decimal::ZERO
        };

        if new_confidence > existing.confidence {
            return ReplacementDecision::Replace {
                reason: format!(
                    "higher confidence ({:.2}% > {:.2}%)",
                    new_confidence * 100.0,
                    existing.confidence * 100.0
                ),
            };
        }
        if age > Duration::hours(REPLACE_AGE_HOURS) && new_confidence >= REPLACE_AGE_MIN_CONFIDENCE {
            return ReplacementDecision::Replace {
                reason: format!(
                    "old order ({:.1}h) with decent confidence ({:.2}%)",
                    age.num_seconds() as f64 / 3600.0,
                    new_confidence * 100.0
                ),
            };
        }
        if deviation > REPLACE_DEVIATION && new_confidence >= REPLACE_DEVIATION_MIN_CONFIDENCE {
            return ReplacementDecision::Replace {
                reason: format!(
                    "price deviation {:.2}% with high confidence ({:.2}%)",
                    deviation.to_f64().unwrap_or(0.0) * 100.0,
                    new_confidence * 100.0
                ),
            };
        }

        ReplacementDecision::Reject {
            reason: format!(
                "existing order is better (confidence {:.2}%, age {:.1}h, deviation {:.2}%)",
                existing.confidence * 100.0,
                age.num_seconds() as f64 / 3600.0,
                deviation.to_f64().unwrap_or(0.0) * 100.0
            ),
        }
    }
}

/// Bulk duplicate sweep: for each symbol with multiple PENDING orders, keep
/// the highest-scoring one and cancel the rest. Returns the cancel count.
pub async fn clean_duplicates(store: &dyn OrderStore, trader_id: &str) -> Result<u64> {
    let pending = store
        .list_by_trader_and_status(trader_id, OrderStatus::Pending)
        .await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut groups: HashMap<&str, Vec<&PendingOrder>> = HashMap::new();
    for order in &pending {
        groups.entry(order.symbol.as_str()).or_default().push(order);
    }

    let mut cancelled = 0u64;
    for (symbol, orders) in groups {
        if orders.len() <= 1 {
            continue;
        }

        let Some(best) = orders
            .iter()
            .max_by(|a, b| {
                let sa = order_score(a.confidence, a.age());
                let sb = order_score(b.confidence, b.age());
                sa.partial_cmp(&sb).unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
        else {
            continue;
        };
        let best_score = order_score(best.confidence, best.age());

        for order in orders {
            if order.id == best.id {
                continue;
            }
            let score = order_score(order.confidence, order.age());
            let reason = format!("Duplicated by better order (score: {score:.2} vs {best_score:.2})");
            match store.cancel_order(order.id, &reason).await {
                Ok(true) => {
                    info!(
                        symbol,
                        order_id = %order.id,
                        score,
                        best_score,
                        "cancelled duplicate order"
                    );
                    cancelled += 1;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(symbol, order_id = %order.id, error = %e, "failed to cancel duplicate");
                }
            }
        }
    }

    Ok(cancelled)
}

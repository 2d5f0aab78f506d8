//! Pricing engine.
//!
//! Pricing is a pure function of the line items and the customer tier, so
//! the orchestrator can recompute it at any time without consulting
//! external state.

use serde::{Deserialize, Serialize};

use super::{CustomerTier, LineItem, Money, Order};
use crate::error::{OrderError, Result};

/// Discount granted to VIP customers, in percent of the raw amount.
pub const VIP_DISCOUNT_PERCENT: i64 = 10;

/// The priced amounts of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Sum of quantity * unit price over all items.
    pub raw_amount: Money,

    /// Tier discount, rounded down to whole cents.
    pub discount: Money,

    /// `raw_amount - discount`.
    pub final_amount: Money,
}

/// Prices an order.
pub fn price(order: &Order) -> Result<Quote> {
    quote(order.tier(), order.items())
}

/// Prices a set of line items for a customer tier.
///
/// Fails with [`OrderError::InvalidOrder`] when `items` is empty, when a
/// line has zero quantity or a negative unit price, when the raw amount is
/// not positive, or when the amount does not fit in an `i64` of cents.
pub fn quote(tier: CustomerTier, items: &[LineItem]) -> Result<Quote> {
    if items.is_empty() {
        return Err(OrderError::InvalidOrder("order has no items".to_string()));
    }

    let mut raw_amount = Money::zero();
    for item in items {
        if item.quantity == 0 {
            return Err(OrderError::InvalidOrder(format!(
                "item {} has zero quantity",
                item.sku
            )));
        }
        if item.unit_price.is_negative() {
            return Err(OrderError::InvalidOrder(format!(
                "item {} has negative unit price {}",
                item.sku, item.unit_price
            )));
        }
        raw_amount = item
            .line_total()
            .and_then(|total| raw_amount.checked_add(total))
            .ok_or_else(|| OrderError::InvalidOrder("order amount overflows".to_string()))?;
    }

    if !raw_amount.is_positive() {
        return Err(OrderError::InvalidOrder(format!(
            "raw amount must be positive, got {raw_amount}"
        )));
    }

    let discount = match tier {
        CustomerTier::Vip => raw_amount
            .checked_percent(VIP_DISCOUNT_PERCENT)
            .ok_or_else(|| OrderError::InvalidOrder("discount overflows".to_string()))?,
        CustomerTier::Regular => Money::zero(),
    };

    Ok(Quote {
        raw_amount,
        discount,
        final_amount: raw_amount - discount,
    })
}

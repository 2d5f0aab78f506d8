//! Order entity.

use chrono::{DateTime, Utc};
use common::{CustomerId, OrderId};
use serde::{Deserialize, Serialize};

use super::{CustomerTier, LineItem, Money, OrderStatus, Quote, pricing};
use crate::error::{OrderError, Result};

/// An order moving through the fulfillment saga.
///
/// Amounts are zero until [`Order::validate`] prices the order. Every status
/// change goes through [`Order::transition_to`], which enforces the state
/// machine and bumps the version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Unique order identifier.
    id: OrderId,

    /// Customer who placed the order.
    customer_id: CustomerId,

    /// Tier that decides the discount.
    tier: CustomerTier,

    /// Items in submission order.
    items: Vec<LineItem>,

    raw_amount: Money,
    discount: Money,
    final_amount: Money,

    /// Current status.
    status: OrderStatus,

    /// Incremented on every status transition.
    version: u64,

    /// Why pricing rejected the order, if it did.
    #[serde(default)]
    rejection_reason: Option<String>,

    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a new order in `Created` status.
    pub fn new(
        id: impl Into<OrderId>,
        customer_id: CustomerId,
        tier: CustomerTier,
        items: Vec<LineItem>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            customer_id,
            tier,
            items,
            raw_amount: Money::zero(),
            discount: Money::zero(),
            final_amount: Money::zero(),
            status: OrderStatus::Created,
            version: 0,
            rejection_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Prices the order and moves it to `Validated`, or to `Rejected` when
    /// pricing fails. The pricing error is returned in the latter case.
    pub fn validate(&mut self) -> Result<Quote> {
        match pricing::price(self) {
            Ok(quote) => {
                self.raw_amount = quote.raw_amount;
                self.discount = quote.discount;
                self.final_amount = quote.final_amount;
                self.transition_to(OrderStatus::Validated)?;
                Ok(quote)
            }
            Err(err) => {
                self.transition_to(OrderStatus::Rejected)?;
                self.rejection_reason = Some(err.to_string());
                Err(err)
            }
        }
    }

    /// Moves the order to `next` if the state machine allows it.
    pub fn transition_to(&mut self, next: OrderStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(OrderError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }

        self.status = next;
        self.version += 1;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Cancels an order that has no downstream side effects yet.
    pub fn cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(OrderError::NotCancellable {
                status: self.status,
            });
        }
        self.transition_to(OrderStatus::Cancelled)
    }
}

// Query methods
impl Order {
    /// Returns the order ID.
    pub fn id(&self) -> &OrderId {
        &self.id
    }

    /// Returns the customer ID.
    pub fn customer_id(&self) -> CustomerId {
        self.customer_id
    }

    /// Returns the customer tier.
    pub fn tier(&self) -> CustomerTier {
        self.tier
    }

    /// Returns the line items.
    pub fn items(&self) -> &[LineItem] {
        &self.items
    }

    /// Returns the raw amount, zero before validation.
    pub fn raw_amount(&self) -> Money {
        self.raw_amount
    }

    /// Returns the discount, zero before validation.
    pub fn discount(&self) -> Money {
        self.discount
    }

    /// Returns the final amount, zero before validation.
    pub fn final_amount(&self) -> Money {
        self.final_amount
    }

    /// Returns the current status.
    pub fn status(&self) -> OrderStatus {
        self.status
    }

    /// Returns the status version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns the rejection reason, if pricing failed.
    pub fn rejection_reason(&self) -> Option<&str> {
        self.rejection_reason.as_deref()
    }

    /// Returns when the order was created.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Returns when the order last changed status.
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Returns the total quantity of all items.
    pub fn total_quantity(&self) -> u64 {
        self.items.iter().map(|i| u64::from(i.quantity)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vip_order() -> Order {
        Order::new(
            "O1",
            CustomerId::new(),
            CustomerTier::Vip,
            vec![LineItem::new("A", 2, Money::from_dollars(10))],
        )
    }

    #[test]
    fn test_new_order_is_created() {
        let order = vip_order();
        assert_eq!(order.id().as_str(), "O1");
        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.version(), 0);
        assert_eq!(order.final_amount(), Money::zero());
        assert_eq!(order.total_quantity(), 2);
    }

    #[test]
    fn test_validate_prices_and_admits() {
        let mut order = vip_order();
        let quote = order.validate().unwrap();

        assert_eq!(order.status(), OrderStatus::Validated);
        assert_eq!(order.version(), 1);
        assert_eq!(order.raw_amount(), Money::from_dollars(20));
        assert_eq!(order.discount(), Money::from_dollars(2));
        assert_eq!(order.final_amount(), Money::from_dollars(18));
        assert_eq!(quote.final_amount, order.final_amount());
    }

    #[test]
    fn test_validate_rejects_zero_amount() {
        let mut order = Order::new(
            "O2",
            CustomerId::new(),
            CustomerTier::Regular,
            vec![LineItem::new("A", 1, Money::zero())],
        );

        let err = order.validate().unwrap_err();
        assert!(matches!(err, OrderError::InvalidOrder(_)));
        assert_eq!(order.status(), OrderStatus::Rejected);
        assert!(order.rejection_reason().is_some());
    }

    #[test]
    fn test_invalid_transition_leaves_order_untouched() {
        let mut order = vip_order();
        let err = order.transition_to(OrderStatus::Shipped).unwrap_err();

        assert_eq!(
            err,
            OrderError::InvalidTransition {
                from: OrderStatus::Created,
                to: OrderStatus::Shipped,
            }
        );
        assert_eq!(order.status(), OrderStatus::Created);
        assert_eq!(order.version(), 0);
    }

    #[test]
    fn test_version_bumps_per_transition() {
        let mut order = vip_order();
        order.validate().unwrap();
        order.transition_to(OrderStatus::ReservingInventory).unwrap();
        order.transition_to(OrderStatus::InventoryReserved).unwrap();
        assert_eq!(order.version(), 3);
        assert!(order.updated_at() >= order.created_at());
    }

    #[test]
    fn test_cancel_validated_order() {
        let mut order = vip_order();
        order.validate().unwrap();
        order.cancel().unwrap();
        assert_eq!(order.status(), OrderStatus::Cancelled);
    }

    #[test]
    fn test_cancel_terminal_order_fails() {
        let mut order = vip_order();
        order.cancel().unwrap();
        assert_eq!(
            order.cancel().unwrap_err(),
            OrderError::NotCancellable {
                status: OrderStatus::Cancelled
            }
        );
    }

    #[test]
    fn test_cancel_after_side_effects_needs_compensation() {
        let mut order = vip_order();
        order.validate().unwrap();
        order.transition_to(OrderStatus::ReservingInventory).unwrap();
        assert!(matches!(
            order.cancel(),
            Err(OrderError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut order = vip_order();
        order.validate().unwrap();
        let json = serde_json::to_string(&order).unwrap();
        let restored: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(order, restored);
    }
}

//! Property tests for the pricing law.

use common::CustomerId;
use domain::{
    CustomerTier, LineItem, Money, Order, OrderError, OrderStatus, VIP_DISCOUNT_PERCENT, quote,
};
use proptest::prelude::*;

fn line_item() -> impl Strategy<Value = LineItem> {
    ("[A-Z]{1,3}", 1u32..1_000, 0i64..1_000_000)
        .prop_map(|(sku, qty, cents)| LineItem::new(sku, qty, Money::from_cents(cents)))
}

fn tier() -> impl Strategy<Value = CustomerTier> {
    prop_oneof![Just(CustomerTier::Regular), Just(CustomerTier::Vip)]
}

proptest! {
    #[test]
    fn final_amount_is_raw_minus_discount(
        tier in tier(),
        items in prop::collection::vec(line_item(), 1..8),
    ) {
        let raw: i64 = items
            .iter()
            .map(|i| i.unit_price.cents() * i64::from(i.quantity))
            .sum();

        match quote(tier, &items) {
            Ok(q) => {
                prop_assert_eq!(q.raw_amount.cents(), raw);
                prop_assert_eq!(q.final_amount, q.raw_amount - q.discount);
                prop_assert!(q.final_amount.cents() >= 0);
                let expected_discount = match tier {
                    CustomerTier::Vip => raw * VIP_DISCOUNT_PERCENT / 100,
                    CustomerTier::Regular => 0,
                };
                prop_assert_eq!(q.discount.cents(), expected_discount);
            }
            Err(OrderError::InvalidOrder(_)) => prop_assert_eq!(raw, 0),
            Err(other) => prop_assert!(false, "unexpected error {other}"),
        }
    }

    #[test]
    fn pricing_is_pure(
        tier in tier(),
        items in prop::collection::vec(line_item(), 1..8),
    ) {
        prop_assert_eq!(quote(tier, &items), quote(tier, &items));
    }
}

#[test]
fn vip_order_o1_quotes_eighteen_dollars() {
    let mut order = Order::new(
        "O1",
        CustomerId::new(),
        CustomerTier::Vip,
        vec![LineItem::new("A", 2, Money::from_dollars(10))],
    );

    let q = order.validate().unwrap();
    assert_eq!(q.raw_amount, Money::from_dollars(20));
    assert_eq!(q.discount, Money::from_dollars(2));
    assert_eq!(q.final_amount, Money::from_dollars(18));
    assert_eq!(order.status(), OrderStatus::Validated);
}

#[test]
fn zero_amount_order_o2_is_rejected() {
    let mut order = Order::new(
        "O2",
        CustomerId::new(),
        CustomerTier::Regular,
        vec![LineItem::new("A", 1, Money::zero())],
    );

    assert!(matches!(order.validate(), Err(OrderError::InvalidOrder(_))));
    assert_eq!(order.status(), OrderStatus::Rejected);
}

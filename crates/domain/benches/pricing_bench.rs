use common::CustomerId;
use criterion::{Criterion, black_box, criterion_group, criterion_main};
use domain::{CustomerTier, LineItem, Money, Order, quote};

fn bench_quote_single_item(c: &mut Criterion) {
    let items = vec![LineItem::new("A", 2, Money::from_dollars(10))];

    c.bench_function("pricing/quote_single_item", |b| {
        b.iter(|| quote(black_box(CustomerTier::Vip), black_box(&items)).unwrap());
    });
}

fn bench_quote_100_items(c: &mut Criterion) {
    let items: Vec<LineItem> = (0..100)
        .map(|i| LineItem::new(format!("SKU-{i:03}"), (i % 5) + 1, Money::from_cents(999)))
        .collect();

    c.bench_function("pricing/quote_100_items", |b| {
        b.iter(|| quote(black_box(CustomerTier::Regular), black_box(&items)).unwrap());
    });
}

fn bench_validate_order(c: &mut Criterion) {
    let customer = CustomerId::new();

    c.bench_function("pricing/validate_order", |b| {
        b.iter(|| {
            let mut order = Order::new(
                "O1",
                customer,
                CustomerTier::Vip,
                vec![LineItem::new("A", 2, Money::from_dollars(10))],
            );
            order.validate().unwrap()
        });
    });
}

criterion_group!(
    benches,
    bench_quote_single_item,
    bench_quote_100_items,
    bench_validate_order
);
criterion_main!(benches);

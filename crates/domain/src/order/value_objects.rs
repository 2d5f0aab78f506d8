//! Value objects for the order domain.

use serde::{Deserialize, Serialize};

/// Stock keeping unit identifying a product.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sku(String);

impl Sku {
    /// Creates a new SKU from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the SKU as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Sku {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Sku {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for Sku {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for Sku {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Money amount represented in cents to avoid floating point issues.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Money {
    /// Amount in cents (e.g., 1000 = $10.00)
    cents: i64,
}

impl Money {
    /// Creates a new Money amount from cents.
    pub fn from_cents(cents: i64) -> Self {
        Self { cents }
    }

    /// Creates a new Money amount from a dollar value.
    pub fn from_dollars(dollars: i64) -> Self {
        Self {
            cents: dollars * 100,
        }
    }

    /// Returns zero money.
    pub fn zero() -> Self {
        Self { cents: 0 }
    }

    /// Returns the amount in cents.
    pub fn cents(&self) -> i64 {
        self.cents
    }

    /// Returns the dollar portion (whole number).
    pub fn dollars(&self) -> i64 {
        self.cents / 100
    }

    /// Returns the cents portion (remainder after dollars).
    pub fn cents_part(&self) -> i64 {
        self.cents.abs() % 100
    }

    /// Returns true if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.cents > 0
    }

    /// Returns true if the amount is negative.
    pub fn is_negative(&self) -> bool {
        self.cents < 0
    }

    /// Adds another amount, returning None on overflow.
    pub fn checked_add(&self, other: Money) -> Option<Money> {
        self.cents.checked_add(other.cents).map(Money::from_cents)
    }

    /// Multiplies by a quantity, returning None on overflow.
    pub fn checked_multiply(&self, quantity: u32) -> Option<Money> {
        self.cents
            .checked_mul(i64::from(quantity))
            .map(Money::from_cents)
    }

    /// Returns `percent`% of this amount, rounded toward zero to a whole
    /// cent, or None if the result does not fit.
    pub fn checked_percent(&self, percent: i64) -> Option<Money> {
        let cents = i128::from(self.cents) * i128::from(percent) / 100;
        i64::try_from(cents).ok().map(Money::from_cents)
    }
}

impl std::fmt::Display for Money {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.cents < 0 {
            write!(f, "-${}.{:02}", self.dollars().abs(), self.cents_part())
        } else {
            write!(f, "${}.{:02}", self.dollars(), self.cents_part())
        }
    }
}

impl std::ops::Add for Money {
    type Output = Money;

    fn add(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents + rhs.cents,
        }
    }
}

impl std::ops::Sub for Money {
    type Output = Money;

    fn sub(self, rhs: Self) -> Self::Output {
        Money {
            cents: self.cents - rhs.cents,
        }
    }
}

/// Customer loyalty tier, the only input to the discount rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CustomerTier {
    #[default]
    Regular,
    Vip,
}

impl CustomerTier {
    /// Returns the tier name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            CustomerTier::Regular => "Regular",
            CustomerTier::Vip => "VIP",
        }
    }
}

impl std::fmt::Display for CustomerTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A line in an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    /// The product being ordered.
    pub sku: Sku,

    /// Quantity ordered.
    pub quantity: u32,

    /// Price per unit.
    pub unit_price: Money,
}

impl LineItem {
    /// Creates a new line item.
    pub fn new(sku: impl Into<Sku>, quantity: u32, unit_price: Money) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            unit_price,
        }
    }

    /// Returns quantity * unit price, or None on overflow.
    pub fn line_total(&self) -> Option<Money> {
        self.unit_price.checked_multiply(self.quantity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sku_string_conversion() {
        let sku = Sku::new("SKU-001");
        assert_eq!(sku.as_str(), "SKU-001");

        let sku2: Sku = "SKU-002".into();
        assert_eq!(sku2.to_string(), "SKU-002");
    }

    #[test]
    fn test_money_from_dollars() {
        let money = Money::from_dollars(50);
        assert_eq!(money.cents(), 5000);
        assert_eq!(money.dollars(), 50);
        assert_eq!(money.cents_part(), 0);
    }

    #[test]
    fn test_money_display() {
        assert_eq!(Money::from_cents(1234).to_string(), "$12.34");
        assert_eq!(Money::from_cents(5).to_string(), "$0.05");
        assert_eq!(Money::from_cents(-1234).to_string(), "-$12.34");
    }

    #[test]
    fn test_money_percent_rounds_down() {
        let percent = |cents: i64| Money::from_cents(cents).checked_percent(10).unwrap().cents();
        assert_eq!(percent(2000), 200);
        assert_eq!(percent(999), 99);
        assert_eq!(percent(5), 0);
        assert_eq!(percent(i64::MAX), i64::MAX / 10);
        assert!(Money::from_cents(i64::MAX).checked_percent(200).is_none());
    }

    #[test]
    fn test_money_checked_arithmetic() {
        assert_eq!(
            Money::from_cents(1000).checked_multiply(3),
            Some(Money::from_cents(3000))
        );
        assert!(Money::from_cents(i64::MAX).checked_multiply(2).is_none());
        assert!(
            Money::from_cents(i64::MAX)
                .checked_add(Money::from_cents(1))
                .is_none()
        );
    }

    #[test]
    fn test_line_total() {
        let item = LineItem::new("A", 2, Money::from_dollars(10));
        assert_eq!(item.line_total(), Some(Money::from_dollars(20)));
    }

    #[test]
    fn test_tier_serialization() {
        let json = serde_json::to_string(&CustomerTier::Vip).unwrap();
        assert_eq!(json, "\"Vip\"");
        let tier: CustomerTier = serde_json::from_str("\"Regular\"").unwrap();
        assert_eq!(tier, CustomerTier::Regular);
    }

    #[test]
    fn test_line_item_serialization() {
        let item = LineItem::new("SKU-001", 2, Money::from_cents(999));
        let json = serde_json::to_string(&item).unwrap();
        let deserialized: LineItem = serde_json::from_str(&json).unwrap();
        assert_eq!(item, deserialized);
    }
}

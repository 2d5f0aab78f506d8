//! Order submissions and admission results.

use common::{CustomerId, OrderId};
use domain::{CustomerTier, LineItem, Money, Quote};
use serde::{Deserialize, Serialize};

/// An order as submitted for fulfillment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSubmission {
    /// Generated when absent.
    #[serde(default)]
    pub order_id: Option<OrderId>,
    #[serde(default)]
    pub customer_id: CustomerId,
    #[serde(default)]
    pub tier: CustomerTier,
    pub items: Vec<LineItem>,
}

impl OrderSubmission {
    /// Creates a submission for a new customer.
    pub fn new(order_id: impl Into<OrderId>, tier: CustomerTier, items: Vec<LineItem>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            customer_id: CustomerId::new(),
            tier,
            items,
        }
    }
}

/// Result of admitting an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Admission {
    pub order_id: OrderId,
    #[serde(flatten)]
    pub outcome: AdmissionOutcome,
}

impl Admission {
    /// Returns true if the saga was started.
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome, AdmissionOutcome::Accepted { .. })
    }
}

/// Whether the order was priced and accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status")]
pub enum AdmissionOutcome {
    Accepted {
        raw_amount: Money,
        discount: Money,
        final_amount: Money,
    },
    Rejected {
        reason: String,
    },
}

impl From<Quote> for AdmissionOutcome {
    fn from(quote: Quote) -> Self {
        AdmissionOutcome::Accepted {
            raw_amount: quote.raw_amount,
            discount: quote.discount,
            final_amount: quote.final_amount,
        }
    }
}

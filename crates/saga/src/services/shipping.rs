//! Shipping service: at most one active shipment per order.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, OrderId};
use messaging::{
    Envelope, EventBus, HandlerError, IdempotencyCheck, IdempotencyStore, Message,
    MessageHandler, ShippingFailure, topics,
};
use serde::{Deserialize, Serialize};
use store::{KeyValueStore, Repository, Version};
use tokio::sync::RwLock;

use crate::error::ServiceError;
use crate::services::FaultPlan;

const SHIPMENTS: &str = "shipments";

/// Outcome of a ship command, replayed for duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShipOutcome {
    Shipped { carrier_ref: String },
    Failed(ShippingFailure),
}

/// Status of a shipment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShipmentStatus {
    Created,
    /// Cancelled, or cancelled before it was ever created.
    Cancelled,
}

/// The shipment held for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shipment {
    pub shipment_key: OrderId,
    pub carrier_ref: Option<String>,
    pub status: ShipmentStatus,
    pub updated_at: DateTime<Utc>,
}

/// Store-backed shipping.
pub struct ShippingService<S> {
    shipments: Repository<S, Shipment>,
    idempotency: IdempotencyStore<S>,
    faults: FaultPlan,
    undeliverable: Arc<RwLock<HashSet<OrderId>>>,
}

impl<S: Clone> Clone for ShippingService<S> {
    fn clone(&self) -> Self {
        Self {
            shipments: self.shipments.clone(),
            idempotency: self.idempotency.clone(),
            faults: self.faults.clone(),
            undeliverable: Arc::clone(&self.undeliverable),
        }
    }
}

impl<S: KeyValueStore + Clone> ShippingService<S> {
    /// Creates a shipping service over the given store.
    pub fn new(store: S, idempotency: IdempotencyStore<S>) -> Self {
        Self {
            shipments: Repository::new(store, SHIPMENTS),
            idempotency,
            faults: FaultPlan::new(),
            undeliverable: Arc::new(RwLock::new(HashSet::new())),
        }
    }

    /// Returns the fault hooks of this service.
    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Makes every shipment for `order_id` fail as undeliverable.
    pub async fn fail_permanently_for(&self, order_id: impl Into<OrderId>) {
        self.undeliverable.write().await.insert(order_id.into());
    }

    /// Creates the shipment for `shipment_key`.
    #[tracing::instrument(skip(self))]
    pub async fn ship(
        &self,
        shipment_key: &OrderId,
        idempotency_key: &str,
    ) -> Result<ShipOutcome, ServiceError> {
        if self.faults.should_fail() {
            return Err(ServiceError::Unavailable("shipping is down".to_string()));
        }

        if self.idempotency.check_and_record(idempotency_key).await? == IdempotencyCheck::Duplicate
        {
            if let Some(outcome) = self.idempotency.outcome(idempotency_key).await? {
                tracing::debug!(?outcome, "replaying ship outcome");
                return Ok(outcome);
            }
            // Creating the shipment is keyed by order, so resuming is safe.
            tracing::debug!("resuming unfinished ship");
        }

        let outcome = if self.undeliverable.read().await.contains(shipment_key) {
            ShipOutcome::Failed(ShippingFailure::Undeliverable)
        } else {
            self.create_shipment(shipment_key).await?
        };
        self.idempotency
            .record_outcome(idempotency_key, &outcome)
            .await?;

        match &outcome {
            ShipOutcome::Shipped { carrier_ref } => {
                tracing::info!(%carrier_ref, "shipment created");
                metrics::counter!("shipments_created_total").increment(1);
            }
            ShipOutcome::Failed(reason) => {
                tracing::info!(%reason, "shipment failed");
                metrics::counter!("shipment_failures_total").increment(1);
            }
        }
        Ok(outcome)
    }

    async fn create_shipment(&self, shipment_key: &OrderId) -> Result<ShipOutcome, ServiceError> {
        loop {
            let (existing, version) = match self.shipments.load(shipment_key.as_str()).await? {
                Some((shipment, version)) => (Some(shipment), version),
                None => (None, Version::initial()),
            };

            match existing {
                Some(Shipment {
                    status: ShipmentStatus::Created,
                    carrier_ref: Some(carrier_ref),
                    ..
                }) => return Ok(ShipOutcome::Shipped { carrier_ref }),
                Some(Shipment {
                    status: ShipmentStatus::Cancelled,
                    ..
                }) => return Ok(ShipOutcome::Failed(ShippingFailure::ShipmentCancelled)),
                _ => {}
            }

            let carrier_ref = carrier_ref();
            let shipment = Shipment {
                shipment_key: shipment_key.clone(),
                carrier_ref: Some(carrier_ref.clone()),
                status: ShipmentStatus::Created,
                updated_at: Utc::now(),
            };
            match self
                .shipments
                .save(shipment_key.as_str(), version, &shipment)
                .await
            {
                Ok(_) => return Ok(ShipOutcome::Shipped { carrier_ref }),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Cancels the shipment for `shipment_key`.
    ///
    /// Cancelling an absent shipment leaves a cancelled record behind, so a
    /// ship command arriving later fails with `ShipmentCancelled`.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(
        &self,
        shipment_key: &OrderId,
        idempotency_key: &str,
    ) -> Result<(), ServiceError> {
        if self.faults.should_fail() {
            return Err(ServiceError::Unavailable("shipping is down".to_string()));
        }

        if self.idempotency.check_and_record(idempotency_key).await? == IdempotencyCheck::Duplicate
        {
            let recorded: Option<ShipmentStatus> = self.idempotency.outcome(idempotency_key).await?;
            if recorded.is_some() {
                return Ok(());
            }
            tracing::debug!("resuming unfinished cancel");
        }

        loop {
            let (mut shipment, version) = match self.shipments.load(shipment_key.as_str()).await? {
                Some((shipment, _)) if shipment.status == ShipmentStatus::Cancelled => {
                    return Ok(());
                }
                Some(found) => found,
                None => (
                    Shipment {
                        shipment_key: shipment_key.clone(),
                        carrier_ref: None,
                        status: ShipmentStatus::Created,
                        updated_at: Utc::now(),
                    },
                    Version::initial(),
                ),
            };

            shipment.status = ShipmentStatus::Cancelled;
            shipment.updated_at = Utc::now();
            match self
                .shipments
                .save(shipment_key.as_str(), version, &shipment)
                .await
            {
                Ok(_) => break,
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
        self.idempotency
            .record_outcome(idempotency_key, &ShipmentStatus::Cancelled)
            .await?;

        tracing::info!("shipment cancelled");
        metrics::counter!("shipments_cancelled_total").increment(1);
        Ok(())
    }

    /// Returns the shipment record for a key.
    pub async fn shipment(&self, shipment_key: &OrderId) -> Result<Option<Shipment>, ServiceError> {
        Ok(self
            .shipments
            .load(shipment_key.as_str())
            .await?
            .map(|(shipment, _)| shipment))
    }
}

fn carrier_ref() -> String {
    let id = MessageId::new().as_uuid().simple().to_string();
    format!("TRACK-{}", id[..12].to_uppercase())
}

/// Bus consumer of the shipping command topic.
pub struct ShippingConsumer<S> {
    service: ShippingService<S>,
    bus: Arc<dyn EventBus>,
}

impl<S> ShippingConsumer<S> {
    pub fn new(service: ShippingService<S>, bus: Arc<dyn EventBus>) -> Self {
        Self { service, bus }
    }
}

#[async_trait]
impl<S: KeyValueStore + Clone + 'static> MessageHandler for ShippingConsumer<S> {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let order_id = &envelope.correlation_id;

        let reply = match &envelope.payload {
            Message::ShipOrder { idempotency_key } => {
                match self.service.ship(order_id, idempotency_key).await {
                    Ok(ShipOutcome::Shipped { carrier_ref }) => Message::Shipped { carrier_ref },
                    Ok(ShipOutcome::Failed(reason)) => Message::ShippingFailed { reason },
                    Err(ServiceError::Unavailable(_)) => Message::ShippingFailed {
                        reason: ShippingFailure::ServiceUnavailable,
                    },
                    Err(e) => return Err(e.into()),
                }
            }
            Message::CancelShipment { idempotency_key } => {
                match self.service.cancel(order_id, idempotency_key).await {
                    Ok(()) => Message::ShipmentCancelled,
                    Err(ServiceError::Unavailable(reason)) => {
                        Message::ShipmentCancelFailed { reason }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            other => {
                return Err(HandlerError::permanent(format!(
                    "shipping does not handle {}",
                    other.message_type()
                )));
            }
        };

        if self.service.faults().should_drop_reply() {
            tracing::warn!(%order_id, reply = reply.message_type(), "shipping reply dropped");
            return Ok(());
        }

        self.bus
            .publish(topics::ORCHESTRATOR, envelope.reply(reply))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use store::InMemoryStore;

    fn service() -> ShippingService<InMemoryStore> {
        let store = InMemoryStore::new();
        let idempotency = IdempotencyStore::new(store.clone(), Duration::from_secs(3600));
        ShippingService::new(store, idempotency)
    }

    fn shipped_ref(outcome: ShipOutcome) -> String {
        match outcome {
            ShipOutcome::Shipped { carrier_ref } => carrier_ref,
            other => panic!("expected a shipment, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ship_assigns_carrier_ref() {
        let shipping = service();
        let order = OrderId::new("O1");

        let carrier_ref = shipped_ref(shipping.ship(&order, "O1:ship").await.unwrap());
        assert!(carrier_ref.starts_with("TRACK-"));

        let shipment = shipping.shipment(&order).await.unwrap().unwrap();
        assert_eq!(shipment.status, ShipmentStatus::Created);
        assert_eq!(shipment.carrier_ref, Some(carrier_ref));
    }

    #[tokio::test]
    async fn test_duplicate_ship_replays_same_ref() {
        let shipping = service();
        let order = OrderId::new("O1");

        let first = shipped_ref(shipping.ship(&order, "O1:ship").await.unwrap());
        let second = shipped_ref(shipping.ship(&order, "O1:ship").await.unwrap());
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_undeliverable_order_fails_permanently() {
        let shipping = service();
        shipping.fail_permanently_for("O1").await;

        let outcome = shipping.ship(&OrderId::new("O1"), "O1:ship").await.unwrap();
        assert_eq!(outcome, ShipOutcome::Failed(ShippingFailure::Undeliverable));
        assert!(shipping.shipment(&OrderId::new("O1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_then_ship_fails() {
        let shipping = service();
        let order = OrderId::new("O1");

        shipping
            .cancel(&order, "O1:cancel-shipment:compensation")
            .await
            .unwrap();
        let outcome = shipping.ship(&order, "O1:ship").await.unwrap();

        assert_eq!(
            outcome,
            ShipOutcome::Failed(ShippingFailure::ShipmentCancelled)
        );
    }

    #[tokio::test]
    async fn test_cancel_existing_shipment() {
        let shipping = service();
        let order = OrderId::new("O1");
        shipping.ship(&order, "O1:ship").await.unwrap();

        shipping
            .cancel(&order, "O1:cancel-shipment:compensation")
            .await
            .unwrap();
        shipping
            .cancel(&order, "O1:cancel-shipment:compensation")
            .await
            .unwrap();

        let shipment = shipping.shipment(&order).await.unwrap().unwrap();
        assert_eq!(shipment.status, ShipmentStatus::Cancelled);
        assert!(shipment.carrier_ref.is_some());
    }

    #[tokio::test]
    async fn test_outage_reports_unavailable() {
        let shipping = service();
        shipping.faults().set_outage(true);

        let err = shipping
            .ship(&OrderId::new("O1"), "O1:ship")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_cancel_resumes_when_no_outcome_was_recorded() {
        let store = InMemoryStore::new();
        let idempotency = IdempotencyStore::new(store.clone(), Duration::from_secs(3600));
        let shipping = ShippingService::new(store, idempotency.clone());
        let order = OrderId::new("O1");
        shipping.ship(&order, "O1:ship").await.unwrap();

        // A first delivery that stopped right after claiming the key.
        idempotency
            .check_and_record("O1:cancel-shipment:compensation")
            .await
            .unwrap();
        shipping
            .cancel(&order, "O1:cancel-shipment:compensation")
            .await
            .unwrap();

        let shipment = shipping.shipment(&order).await.unwrap().unwrap();
        assert_eq!(shipment.status, ShipmentStatus::Cancelled);
    }
}

//! Inventory service: stock ledger and reservations.
//!
//! Stock levels are records in the `stock` namespace, one per sku, changed
//! only through compare-and-set. Each stock record also keeps the quantity
//! held by every reservation, so taking stock for an order and giving it
//! back each happen at most once no matter how often they are retried.
//!
//! A reservation is written as `Pending` with its items before any stock is
//! taken. Skus are taken in sorted order; when one runs short, everything
//! already held goes back and the reservation ends `Rejected`. A reserve or
//! release interrupted by a store error leaves enough state behind to be
//! resumed by the next delivery of the same command.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use domain::{LineItem, Sku};
use messaging::{
    Envelope, EventBus, HandlerError, IdempotencyCheck, IdempotencyStore, InventoryRejection,
    Message, MessageHandler, topics,
};
use serde::{Deserialize, Serialize};
use store::{KeyValueStore, Repository, Version};

use crate::error::ServiceError;
use crate::services::FaultPlan;

const STOCK: &str = "stock";
const RESERVATIONS: &str = "reservations";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StockLevel {
    available: u64,
    #[serde(default)]
    holds: BTreeMap<OrderId, u32>,
}

/// Outcome of a reserve command, replayed for duplicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReserveOutcome {
    Reserved,
    Rejected(InventoryRejection),
}

/// Status of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Recorded, stock is being taken.
    Pending,
    Reserved,
    /// Not enough stock. Nothing is held.
    Rejected,
    Released,
}

/// Quantity of one sku held by a reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedItem {
    pub sku: Sku,
    pub quantity: u32,
}

/// Stock held for one order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_key: OrderId,
    pub items: Vec<ReservedItem>,
    pub status: ReservationStatus,
    pub updated_at: DateTime<Utc>,
}

/// Store-backed inventory.
pub struct InventoryService<S> {
    stock: Repository<S, StockLevel>,
    reservations: Repository<S, Reservation>,
    idempotency: IdempotencyStore<S>,
    faults: FaultPlan,
}

impl<S: Clone> Clone for InventoryService<S> {
    fn clone(&self) -> Self {
        Self {
            stock: self.stock.clone(),
            reservations: self.reservations.clone(),
            idempotency: self.idempotency.clone(),
            faults: self.faults.clone(),
        }
    }
}

impl<S: KeyValueStore + Clone> InventoryService<S> {
    /// Creates an inventory service over the given store.
    pub fn new(store: S, idempotency: IdempotencyStore<S>) -> Self {
        Self {
            stock: Repository::new(store.clone(), STOCK),
            reservations: Repository::new(store, RESERVATIONS),
            idempotency,
            faults: FaultPlan::new(),
        }
    }

    /// Returns the fault hooks of this service.
    pub fn faults(&self) -> &FaultPlan {
        &self.faults
    }

    /// Reserves every item for `reservation_key`.
    ///
    /// Once an outcome is recorded for `idempotency_key`, later calls replay
    /// it. A call that failed before recording one is resumed.
    #[tracing::instrument(skip(self, items), fields(items = items.len()))]
    pub async fn reserve(
        &self,
        reservation_key: &OrderId,
        items: &[LineItem],
        idempotency_key: &str,
    ) -> Result<ReserveOutcome, ServiceError> {
        if self.faults.should_fail() {
            return Err(ServiceError::Unavailable("inventory is down".to_string()));
        }

        if self.idempotency.check_and_record(idempotency_key).await? == IdempotencyCheck::Duplicate
        {
            if let Some(outcome) = self.idempotency.outcome(idempotency_key).await? {
                tracing::debug!(?outcome, "replaying reserve outcome");
                return Ok(outcome);
            }
            tracing::debug!("resuming unfinished reserve");
        }

        let outcome = self.apply_reservation(reservation_key, items).await?;
        self.idempotency
            .record_outcome(idempotency_key, &outcome)
            .await?;

        match outcome {
            ReserveOutcome::Reserved => {
                tracing::info!("inventory reserved");
                metrics::counter!("inventory_reservations_total").increment(1);
            }
            ReserveOutcome::Rejected(reason) => {
                tracing::info!(%reason, "reservation rejected");
                metrics::counter!("inventory_rejections_total").increment(1);
            }
        }
        Ok(outcome)
    }

    async fn apply_reservation(
        &self,
        reservation_key: &OrderId,
        items: &[LineItem],
    ) -> Result<ReserveOutcome, ServiceError> {
        let (mut reservation, mut version) =
            self.pending_reservation(reservation_key, items).await?;

        loop {
            match reservation.status {
                ReservationStatus::Reserved => return Ok(ReserveOutcome::Reserved),
                ReservationStatus::Rejected => {
                    return Ok(ReserveOutcome::Rejected(
                        InventoryRejection::InsufficientStock,
                    ));
                }
                ReservationStatus::Released => {
                    // Stock taken by a reserve racing the release goes back.
                    self.return_holds(reservation_key, &reservation.items)
                        .await?;
                    return Ok(ReserveOutcome::Rejected(
                        InventoryRejection::ReservationReleased,
                    ));
                }
                ReservationStatus::Pending => {}
            }

            let mut next = reservation.clone();
            next.status = if self.take_all(reservation_key, &next.items).await? {
                ReservationStatus::Reserved
            } else {
                tracing::debug!("insufficient stock, holds returned");
                ReservationStatus::Rejected
            };
            next.updated_at = Utc::now();

            match self
                .reservations
                .save(reservation_key.as_str(), version, &next)
                .await
            {
                Ok(saved) => {
                    reservation = next;
                    version = saved;
                }
                Err(e) if e.is_conflict() => {
                    (reservation, version) =
                        self.pending_reservation(reservation_key, items).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Loads the reservation, recording a pending one if there is none yet.
    async fn pending_reservation(
        &self,
        reservation_key: &OrderId,
        items: &[LineItem],
    ) -> Result<(Reservation, Version), ServiceError> {
        loop {
            if let Some(found) = self.reservations.load(reservation_key.as_str()).await? {
                return Ok(found);
            }

            let mut wanted: BTreeMap<&Sku, u32> = BTreeMap::new();
            for item in items {
                let quantity = wanted.entry(&item.sku).or_default();
                *quantity = quantity.saturating_add(item.quantity);
            }
            let reservation = Reservation {
                reservation_key: reservation_key.clone(),
                items: wanted
                    .into_iter()
                    .map(|(sku, quantity)| ReservedItem {
                        sku: sku.clone(),
                        quantity,
                    })
                    .collect(),
                status: ReservationStatus::Pending,
                updated_at: Utc::now(),
            };
            if self
                .reservations
                .insert_if_absent(reservation_key.as_str(), &reservation)
                .await?
            {
                return Ok((reservation, Version::first()));
            }
        }
    }

    /// Releases the reservation held for `reservation_key`.
    ///
    /// Releasing an absent or already released reservation succeeds. An
    /// absent reservation is recorded as released so a late reserve cannot
    /// take stock. Stock still held by a released reservation is returned
    /// on every call until none is left.
    #[tracing::instrument(skip(self))]
    pub async fn release(
        &self,
        reservation_key: &OrderId,
        idempotency_key: &str,
    ) -> Result<(), ServiceError> {
        if self.faults.should_fail() {
            return Err(ServiceError::Unavailable("inventory is down".to_string()));
        }

        if self.idempotency.check_and_record(idempotency_key).await? == IdempotencyCheck::Duplicate
        {
            let recorded: Option<ReservationStatus> =
                self.idempotency.outcome(idempotency_key).await?;
            if recorded.is_some() {
                return Ok(());
            }
            tracing::debug!("resuming unfinished release");
        }

        let returned = self.apply_release(reservation_key).await?;
        self.idempotency
            .record_outcome(idempotency_key, &ReservationStatus::Released)
            .await?;

        if returned {
            tracing::info!("inventory released");
            metrics::counter!("inventory_releases_total").increment(1);
        }
        Ok(())
    }

    /// Marks the reservation released and returns its holds. Returns true if
    /// any stock went back.
    async fn apply_release(&self, reservation_key: &OrderId) -> Result<bool, ServiceError> {
        loop {
            let Some((mut reservation, version)) =
                self.reservations.load(reservation_key.as_str()).await?
            else {
                let tombstone = Reservation {
                    reservation_key: reservation_key.clone(),
                    items: Vec::new(),
                    status: ReservationStatus::Released,
                    updated_at: Utc::now(),
                };
                if self
                    .reservations
                    .insert_if_absent(reservation_key.as_str(), &tombstone)
                    .await?
                {
                    tracing::debug!("no reservation to release, tombstone written");
                    return Ok(false);
                }
                continue;
            };

            if reservation.status != ReservationStatus::Released {
                reservation.status = ReservationStatus::Released;
                reservation.updated_at = Utc::now();
                match self
                    .reservations
                    .save(reservation_key.as_str(), version, &reservation)
                    .await
                {
                    Ok(_) => {}
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            return self
                .return_holds(reservation_key, &reservation.items)
                .await;
        }
    }

    /// Adds stock for a sku.
    pub async fn restock(&self, sku: &Sku, quantity: u32) -> Result<(), ServiceError> {
        loop {
            let (mut level, version) = self.stock_level(sku).await?;
            level.available = level.available.saturating_add(u64::from(quantity));

            match self.stock.save(sku.as_str(), version, &level).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the stock available for a sku.
    pub async fn available(&self, sku: &Sku) -> Result<u64, ServiceError> {
        Ok(self
            .stock
            .load(sku.as_str())
            .await?
            .map(|(level, _)| level.available)
            .unwrap_or(0))
    }

    /// Returns the reservation held for a key.
    pub async fn reservation(
        &self,
        reservation_key: &OrderId,
    ) -> Result<Option<Reservation>, ServiceError> {
        Ok(self
            .reservations
            .load(reservation_key.as_str())
            .await?
            .map(|(reservation, _)| reservation))
    }

    /// Holds every item. When one runs short, returns every hold and
    /// reports false.
    async fn take_all(
        &self,
        reservation_key: &OrderId,
        items: &[ReservedItem],
    ) -> Result<bool, ServiceError> {
        for item in items {
            if !self.hold(&item.sku, reservation_key, item.quantity).await? {
                self.return_holds(reservation_key, items).await?;
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn return_holds(
        &self,
        reservation_key: &OrderId,
        items: &[ReservedItem],
    ) -> Result<bool, ServiceError> {
        let mut returned = false;
        for item in items {
            returned |= self.unhold(&item.sku, reservation_key).await?;
        }
        Ok(returned)
    }

    /// Takes `quantity` for `holder` unless it already holds stock of this
    /// sku. Returns false if not enough is available.
    async fn hold(&self, sku: &Sku, holder: &OrderId, quantity: u32) -> Result<bool, ServiceError> {
        loop {
            let (mut level, version) = self.stock_level(sku).await?;
            if level.holds.contains_key(holder) {
                return Ok(true);
            }
            let Some(available) = level.available.checked_sub(u64::from(quantity)) else {
                return Ok(false);
            };
            level.available = available;
            level.holds.insert(holder.clone(), quantity);

            match self.stock.save(sku.as_str(), version, &level).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Gives back what `holder` holds of this sku. Returns false if it held
    /// nothing.
    async fn unhold(&self, sku: &Sku, holder: &OrderId) -> Result<bool, ServiceError> {
        loop {
            let (mut level, version) = self.stock_level(sku).await?;
            let Some(quantity) = level.holds.remove(holder) else {
                return Ok(false);
            };
            level.available = level.available.saturating_add(u64::from(quantity));

            match self.stock.save(sku.as_str(), version, &level).await {
                Ok(_) => return Ok(true),
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn stock_level(&self, sku: &Sku) -> Result<(StockLevel, Version), ServiceError> {
        Ok(self
            .stock
            .load(sku.as_str())
            .await?
            .unwrap_or_else(|| (StockLevel::default(), Version::initial())))
    }
}

/// Bus consumer of the inventory command topic.
pub struct InventoryConsumer<S> {
    service: InventoryService<S>,
    bus: Arc<dyn EventBus>,
}

impl<S> InventoryConsumer<S> {
    pub fn new(service: InventoryService<S>, bus: Arc<dyn EventBus>) -> Self {
        Self { service, bus }
    }
}

#[async_trait]
impl<S: KeyValueStore + Clone + 'static> MessageHandler for InventoryConsumer<S> {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let order_id = &envelope.correlation_id;

        let reply = match &envelope.payload {
            Message::ReserveInventory {
                items,
                idempotency_key,
            } => match self.service.reserve(order_id, items, idempotency_key).await {
                Ok(ReserveOutcome::Reserved) => Message::InventoryReserved,
                Ok(ReserveOutcome::Rejected(reason)) => Message::InventoryRejected { reason },
                Err(ServiceError::Unavailable(_)) => Message::InventoryRejected {
                    reason: InventoryRejection::ServiceUnavailable,
                },
                Err(e) => return Err(e.into()),
            },
            Message::ReleaseInventory { idempotency_key } => {
                match self.service.release(order_id, idempotency_key).await {
                    Ok(()) => Message::InventoryReleased,
                    Err(ServiceError::Unavailable(reason)) => {
                        Message::InventoryReleaseFailed { reason }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            other => {
                return Err(HandlerError::permanent(format!(
                    "inventory does not handle {}",
                    other.message_type()
                )));
            }
        };

        if self.service.faults().should_drop_reply() {
            tracing::warn!(%order_id, reply = reply.message_type(), "inventory reply dropped");
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
    use crate::test_support::FlakyStore;
    use domain::Money;
    use std::time::Duration;
    use store::InMemoryStore;

    fn service() -> InventoryService<InMemoryStore> {
        let store = InMemoryStore::new();
        let idempotency = IdempotencyStore::new(store.clone(), Duration::from_secs(3600));
        InventoryService::new(store, idempotency)
    }

    fn flaky_service() -> (InventoryService<FlakyStore>, FlakyStore) {
        let store = FlakyStore::default();
        let idempotency = IdempotencyStore::new(store.clone(), Duration::from_secs(3600));
        (InventoryService::new(store.clone(), idempotency), store)
    }

    fn items(entries: &[(&str, u32)]) -> Vec<LineItem> {
        entries
            .iter()
            .map(|(sku, qty)| LineItem::new(*sku, *qty, Money::from_dollars(1)))
            .collect()
    }

    #[tokio::test]
    async fn test_reserve_decrements_stock() {
        let inventory = service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();

        let outcome = inventory
            .reserve(&OrderId::new("O1"), &items(&[("A", 2)]), "O1:reserve")
            .await
            .unwrap();

        assert_eq!(outcome, ReserveOutcome::Reserved);
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 3);
        let reservation = inventory
            .reservation(&OrderId::new("O1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Reserved);
    }

    #[tokio::test]
    async fn test_duplicate_reserve_is_replayed() {
        let inventory = service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        let order = OrderId::new("O1");

        for _ in 0..3 {
            let outcome = inventory
                .reserve(&order, &items(&[("A", 2)]), "O1:reserve")
                .await
                .unwrap();
            assert_eq!(outcome, ReserveOutcome::Reserved);
        }

        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_multi_sku_is_all_or_nothing() {
        let inventory = service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        inventory.restock(&Sku::new("B"), 1).await.unwrap();

        let outcome = inventory
            .reserve(
                &OrderId::new("O1"),
                &items(&[("A", 2), ("B", 2)]),
                "O1:reserve",
            )
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReserveOutcome::Rejected(InventoryRejection::InsufficientStock)
        );
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 5);
        assert_eq!(inventory.available(&Sku::new("B")).await.unwrap(), 1);
        let reservation = inventory
            .reservation(&OrderId::new("O1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reservation.status, ReservationStatus::Rejected);
    }

    #[tokio::test]
    async fn test_release_restores_stock_once() {
        let inventory = service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        let order = OrderId::new("O1");
        inventory
            .reserve(&order, &items(&[("A", 2), ("A", 1)]), "O1:reserve")
            .await
            .unwrap();
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 2);

        inventory
            .release(&order, "O1:release:compensation")
            .await
            .unwrap();
        inventory
            .release(&order, "O1:release:compensation")
            .await
            .unwrap();

        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 5);
        let reservation = inventory.reservation(&order).await.unwrap().unwrap();
        assert_eq!(reservation.status, ReservationStatus::Released);
    }

    #[tokio::test]
    async fn test_release_before_reserve_blocks_late_reserve() {
        let inventory = service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        let order = OrderId::new("O9");

        inventory
            .release(&order, "O9:release:compensation")
            .await
            .unwrap();
        let outcome = inventory
            .reserve(&order, &items(&[("A", 2)]), "O9:reserve")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReserveOutcome::Rejected(InventoryRejection::ReservationReleased)
        );
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_outage_does_not_consume_key() {
        let inventory = service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        inventory.faults().fail_next(1);
        let order = OrderId::new("O1");

        let err = inventory
            .reserve(&order, &items(&[("A", 1)]), "O1:reserve")
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable(_)));

        let outcome = inventory
            .reserve(&order, &items(&[("A", 1)]), "O1:reserve")
            .await
            .unwrap();
        assert_eq!(outcome, ReserveOutcome::Reserved);
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_concurrent_reservations_never_oversell() {
        let inventory = service();
        inventory.restock(&Sku::new("A"), 3).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let inventory = inventory.clone();
            handles.push(tokio::spawn(async move {
                let order = OrderId::new(format!("O{n}"));
                let key = format!("O{n}:reserve");
                inventory
                    .reserve(&order, &items(&[("A", 1)]), &key)
                    .await
                    .unwrap()
            }));
        }

        let mut reserved = 0;
        for handle in handles {
            if handle.await.unwrap() == ReserveOutcome::Reserved {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 3);
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_release_interrupted_by_store_error_is_resumed() {
        let (inventory, store) = flaky_service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        let order = OrderId::new("O1");
        inventory
            .reserve(&order, &items(&[("A", 2)]), "O1:reserve")
            .await
            .unwrap();

        store.fail_next_write(STOCK, "A");
        assert!(
            inventory
                .release(&order, "O1:release:compensation")
                .await
                .is_err()
        );
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 3);

        inventory
            .release(&order, "O1:release:compensation")
            .await
            .unwrap();
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 5);

        inventory
            .release(&order, "O1:release:compensation")
            .await
            .unwrap();
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_reserve_interrupted_by_store_error_is_resumed() {
        let (inventory, store) = flaky_service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        inventory.restock(&Sku::new("B"), 5).await.unwrap();
        let order = OrderId::new("O1");
        let wanted = items(&[("A", 2), ("B", 1)]);

        store.fail_next_write(STOCK, "B");
        assert!(inventory.reserve(&order, &wanted, "O1:reserve").await.is_err());
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 3);

        let outcome = inventory.reserve(&order, &wanted, "O1:reserve").await.unwrap();
        assert_eq!(outcome, ReserveOutcome::Reserved);
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 3);
        assert_eq!(inventory.available(&Sku::new("B")).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_release_returns_stock_of_interrupted_reserve() {
        let (inventory, store) = flaky_service();
        inventory.restock(&Sku::new("A"), 5).await.unwrap();
        inventory.restock(&Sku::new("B"), 5).await.unwrap();
        let order = OrderId::new("O1");
        let wanted = items(&[("A", 2), ("B", 1)]);

        store.fail_next_write(STOCK, "B");
        assert!(inventory.reserve(&order, &wanted, "O1:reserve").await.is_err());

        inventory
            .release(&order, "O1:release:compensation")
            .await
            .unwrap();
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 5);
        assert_eq!(inventory.available(&Sku::new("B")).await.unwrap(), 5);

        let outcome = inventory.reserve(&order, &wanted, "O1:reserve").await.unwrap();
        assert_eq!(
            outcome,
            ReserveOutcome::Rejected(InventoryRejection::ReservationReleased)
        );
        assert_eq!(inventory.available(&Sku::new("A")).await.unwrap(), 5);
    }
}

//! Wiring of the orchestrator, the services and the bus into one running
//! fulfillment pipeline.

use std::sync::Arc;

use messaging::{
    DeadLetterSink, DelayQueue, EventBus, IdempotencyStore, InMemoryEventBus, RetryScheduler,
    SchedulerHandle, StoreDeadLetterSink, StoreDelayQueue, by_correlation_id, topics,
};
use store::KeyValueStore;

use crate::config::PipelineConfig;
use crate::error::Result;
use crate::orchestrator::Orchestrator;
use crate::services::{InventoryConsumer, InventoryService, ShippingConsumer, ShippingService};

/// A running pipeline.
pub struct Pipeline<S> {
    pub orchestrator: Arc<Orchestrator<S>>,
    pub inventory: InventoryService<S>,
    pub shipping: ShippingService<S>,
    pub bus: InMemoryEventBus,
    pub dead_letters: Arc<StoreDeadLetterSink<S>>,
    pub delay_queue: Arc<StoreDelayQueue<S>>,
    scheduler: Option<SchedulerHandle>,
}

impl<S: KeyValueStore + Clone + 'static> Pipeline<S> {
    /// Subscribes every consumer, sends outboxes left by a previous run and
    /// starts the retry scheduler.
    #[tracing::instrument(skip_all)]
    pub async fn start(store: S, config: PipelineConfig) -> Result<Self> {
        let dead_letters = Arc::new(StoreDeadLetterSink::new(store.clone()));
        let bus = InMemoryEventBus::new(
            config.bus.clone(),
            dead_letters.clone() as Arc<dyn DeadLetterSink>,
        );
        let shared_bus: Arc<dyn EventBus> = Arc::new(bus.clone());
        let delay_queue = Arc::new(StoreDelayQueue::new(store.clone()));
        let idempotency = IdempotencyStore::new(store.clone(), config.idempotency_retention);

        let inventory = InventoryService::new(store.clone(), idempotency.clone());
        let shipping = ShippingService::new(store.clone(), idempotency);
        let orchestrator = Arc::new(Orchestrator::new(
            store,
            shared_bus.clone(),
            delay_queue.clone() as Arc<dyn DelayQueue>,
            dead_letters.clone() as Arc<dyn DeadLetterSink>,
            config.saga.clone(),
        ));

        bus.subscribe(
            topics::INVENTORY_COMMANDS,
            by_correlation_id(),
            Arc::new(InventoryConsumer::new(inventory.clone(), shared_bus.clone())),
        )
        .await?;
        bus.subscribe(
            topics::SHIPPING_COMMANDS,
            by_correlation_id(),
            Arc::new(ShippingConsumer::new(shipping.clone(), shared_bus.clone())),
        )
        .await?;
        bus.subscribe(topics::ORCHESTRATOR, by_correlation_id(), orchestrator.clone())
            .await?;

        orchestrator.recover().await?;

        let scheduler = RetryScheduler::new(
            delay_queue.clone() as Arc<dyn DelayQueue>,
            shared_bus,
            config.scheduler_tick,
        )
        .spawn();

        tracing::info!("fulfillment pipeline started");
        Ok(Self {
            orchestrator,
            inventory,
            shipping,
            bus,
            dead_letters,
            delay_queue,
            scheduler: Some(scheduler),
        })
    }

    /// Stops the scheduler, then drains and closes the bus.
    pub async fn shutdown(mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop().await;
        }
        self.bus.shutdown().await;
        tracing::info!("fulfillment pipeline stopped");
    }
}

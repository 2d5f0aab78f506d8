//! Saga orchestrator for order fulfillment.
//!
//! The orchestrator consumes the orchestrator topic, one order at a time
//! (the bus partitions by order id). Every delivery follows the same
//! sequence:
//!
//! 1. Load the order's [`SagaRecord`]; envelopes already applied only flush
//!    the outbox.
//! 2. Apply the message: transition the order, decide the next commands,
//!    retries and dead letters, and queue them in the outbox.
//! 3. Persist the record with compare-and-set.
//! 4. Flush the outbox to the bus, the delay queue and the dead-letter sink.
//!
//! A crash between 3 and 4 leaves the messages in the stored outbox; they
//! are sent on the next delivery for the order or by [`Orchestrator::recover`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{MessageId, OrderId};
use domain::{Order, OrderError, OrderStatus};
use messaging::{
    DeadLetter, DeadLetterSink, DelayQueue, Envelope, EventBus, HandlerError, Message,
    MessageHandler, SagaStep, TransportError, topics,
};
use store::{KeyValueStore, Repository, Version};

use crate::admission::{Admission, AdmissionOutcome, OrderSubmission};
use crate::circuit_breaker::CircuitBreakers;
use crate::config::SagaConfig;
use crate::error::{Result, SagaError};
use crate::instance::{
    CompensationReason, Outgoing, SagaInstance, SagaRecord, SagaSnapshot, StepState,
    idempotency_key,
};

const SAGAS: &str = "sagas";

/// Drives every order through reservation and shipping, with retries,
/// circuit breaking and compensation.
pub struct Orchestrator<S> {
    sagas: Repository<S, SagaRecord>,
    bus: Arc<dyn EventBus>,
    delay_queue: Arc<dyn DelayQueue>,
    dead_letters: Arc<dyn DeadLetterSink>,
    breakers: CircuitBreakers,
    config: SagaConfig,
}

impl<S: KeyValueStore + Clone> Orchestrator<S> {
    /// Creates a new orchestrator.
    pub fn new(
        store: S,
        bus: Arc<dyn EventBus>,
        delay_queue: Arc<dyn DelayQueue>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: SagaConfig,
    ) -> Self {
        Self {
            sagas: Repository::new(store, SAGAS),
            bus,
            delay_queue,
            dead_letters,
            breakers: CircuitBreakers::new(config.breaker.clone()),
            config,
        }
    }

    /// Returns the per-service circuit breakers.
    pub fn breakers(&self) -> &CircuitBreakers {
        &self.breakers
    }

    pub fn config(&self) -> &SagaConfig {
        &self.config
    }

    /// Prices and admits an order.
    ///
    /// A priced order is persisted as `Validated` and its saga is started
    /// by a `StartSaga` message. An order that fails pricing is persisted as
    /// `Rejected` and nothing is published.
    #[tracing::instrument(skip(self, submission), fields(order_id = tracing::field::Empty))]
    pub async fn admit(&self, submission: OrderSubmission) -> Result<Admission> {
        let order_id = submission.order_id.unwrap_or_else(OrderId::generate);
        tracing::Span::current().record("order_id", tracing::field::display(&order_id));

        let now = Utc::now();
        let mut order = Order::new(
            order_id.clone(),
            submission.customer_id,
            submission.tier,
            submission.items,
        );
        let mut saga = SagaInstance::new(order_id.clone(), now);

        let outcome = match order.validate() {
            Ok(quote) => {
                saga.push(Outgoing::Publish {
                    topic: topics::ORCHESTRATOR.to_string(),
                    envelope: Envelope::new(order_id.clone(), Message::StartSaga),
                });
                AdmissionOutcome::from(quote)
            }
            Err(err) => AdmissionOutcome::Rejected {
                reason: err.to_string(),
            },
        };

        let mut record = SagaRecord { order, saga };
        if !self.sagas.insert_if_absent(order_id.as_str(), &record).await? {
            return Err(SagaError::DuplicateOrder(order_id));
        }

        match &outcome {
            AdmissionOutcome::Accepted { final_amount, .. } => {
                tracing::info!(%final_amount, "order admitted");
                metrics::counter!("saga_admissions_total").increment(1);
                if let Err(e) = self.flush(&mut record, Version::first()).await {
                    tracing::warn!(error = %e, "start message kept in the outbox");
                }
            }
            AdmissionOutcome::Rejected { reason } => {
                tracing::info!(%reason, "order rejected");
                metrics::counter!("saga_rejections_total").increment(1);
            }
        }

        Ok(Admission { order_id, outcome })
    }

    /// Requests cancellation of an order.
    ///
    /// The request travels through the orchestrator topic, so it is applied
    /// in order with the order's other messages.
    #[tracing::instrument(skip(self))]
    pub async fn request_cancel(&self, order_id: &OrderId) -> Result<()> {
        let (record, _) = self
            .sagas
            .load(order_id.as_str())
            .await?
            .ok_or_else(|| SagaError::OrderNotFound(order_id.clone()))?;

        let status = record.order.status();
        if status.is_terminal() {
            return Err(OrderError::NotCancellable { status }.into());
        }

        self.bus
            .publish(
                topics::ORCHESTRATOR,
                Envelope::new(order_id.clone(), Message::CancelOrder),
            )
            .await?;
        tracing::info!("cancellation requested");
        Ok(())
    }

    /// Returns the observable state of an order's saga.
    pub async fn snapshot(&self, order_id: &OrderId) -> Result<Option<SagaSnapshot>> {
        Ok(self
            .sagas
            .load(order_id.as_str())
            .await?
            .map(|(record, _)| record.snapshot()))
    }

    /// Returns the current state of an order.
    pub async fn order(&self, order_id: &OrderId) -> Result<Option<Order>> {
        Ok(self
            .sagas
            .load(order_id.as_str())
            .await?
            .map(|(record, _)| record.order))
    }

    /// Flushes every outbox left behind by an earlier process.
    ///
    /// Returns the number of sagas whose outbox was emptied.
    pub async fn recover(&self) -> Result<usize> {
        let mut recovered = 0;

        for (key, record) in self.sagas.list().await? {
            if record.saga.outbox().is_empty() {
                continue;
            }
            let Some((mut record, version)) = self.sagas.load(&key).await? else {
                continue;
            };
            match self.flush(&mut record, version).await {
                Ok(()) => recovered += 1,
                Err(e) => tracing::warn!(order_id = %key, error = %e, "outbox recovery failed"),
            }
        }

        if recovered > 0 {
            tracing::info!(recovered, "recovered pending outboxes");
        }
        Ok(recovered)
    }

    /// Applies one delivery of an orchestrator message.
    #[tracing::instrument(
        name = "saga.handle",
        skip(self, envelope),
        fields(
            order_id = %envelope.correlation_id,
            message_type = %envelope.message_type,
            delivery = envelope.attempt,
        )
    )]
    pub async fn handle_message(&self, envelope: &Envelope) -> Result<()> {
        let key = envelope.correlation_id.as_str();
        let Some((mut record, version)) = self.sagas.load(key).await? else {
            return Err(SagaError::OrderNotFound(envelope.correlation_id.clone()));
        };

        if record.saga.has_processed(envelope.id) {
            tracing::debug!("duplicate delivery");
            return self.flush(&mut record, version).await;
        }

        let now = Utc::now();
        let availability = availability(&record, &envelope.payload);
        self.apply(&mut record, envelope, now).await?;
        record.saga.mark_processed(envelope.id);

        let version = self.sagas.save(key, version, &record).await?;

        // Breakers only hear about deliveries that were saved.
        if let Some((step, available)) = availability {
            let breaker = self.breakers.for_step(step);
            if available {
                breaker.record_success().await;
            } else {
                breaker.record_failure().await;
            }
        }

        self.flush(&mut record, version).await
    }

    async fn apply(
        &self,
        record: &mut SagaRecord,
        envelope: &Envelope,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cause = envelope.id;

        match &envelope.payload {
            Message::StartSaga => self.on_start(record, cause, now).await,
            Message::CancelOrder => self.on_cancel(record, cause, now).await,
            Message::RetryDue { step, attempt } => {
                self.on_retry_due(record, *step, *attempt, cause, now).await
            }
            Message::ResponseTimeout { step, attempt } => {
                self.on_timeout(record, *step, *attempt, cause, now).await
            }
            reply => match reply.reply_step() {
                Some(step) => self.on_reply(record, step, reply, cause, now).await,
                None => Err(SagaError::UnexpectedMessage {
                    order_id: envelope.correlation_id.clone(),
                    message_type: envelope.message_type.clone(),
                }),
            },
        }
    }

    async fn on_start(
        &self,
        record: &mut SagaRecord,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if record.order.status() != OrderStatus::Validated {
            stale("saga already started");
            return Ok(());
        }

        record.order.transition_to(OrderStatus::ReservingInventory)?;
        tracing::info!("saga started");
        self.issue(record, SagaStep::ReserveInventory, cause, now)
            .await;
        Ok(())
    }

    async fn on_cancel(
        &self,
        record: &mut SagaRecord,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let status = record.order.status();

        match status {
            _ if status.can_cancel_directly() => {
                record.order.cancel()?;
                self.finish(record, now);
                Ok(())
            }
            OrderStatus::ReservingInventory | OrderStatus::InventoryReserved => {
                self.compensate(
                    record,
                    CompensationReason::Cancelled,
                    vec![SagaStep::ReleaseInventory],
                    cause,
                    now,
                )
                .await
            }
            OrderStatus::Shipping => {
                self.compensate(
                    record,
                    CompensationReason::Cancelled,
                    vec![SagaStep::CancelShipment, SagaStep::ReleaseInventory],
                    cause,
                    now,
                )
                .await
            }
            _ => {
                tracing::info!(%status, "cancellation ignored");
                Ok(())
            }
        }
    }

    async fn on_retry_due(
        &self,
        record: &mut SagaRecord,
        step: SagaStep,
        attempt: u32,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let Some(state) = record.saga.progress(step).map(|p| p.state.clone()) else {
            stale("retry for a step never started");
            return Ok(());
        };
        if !state.is_pending() || record.saga.attempts(step) != attempt {
            stale("retry superseded");
            return Ok(());
        }

        // The command of this attempt was never published.
        if let StepState::InFlight { .. } = state {
            let attempts = record
                .saga
                .record_failure(step, "command could not be published");
            if self.config.retry.is_exhausted(attempts) {
                return self.exhaust(record, step, cause, now).await;
            }
        }

        metrics::counter!("saga_retries_total", "step" => step.as_str()).increment(1);
        self.issue(record, step, cause, now).await;
        Ok(())
    }

    async fn on_timeout(
        &self,
        record: &mut SagaRecord,
        step: SagaStep,
        attempt: u32,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !record.saga.is_in_flight(step, attempt) {
            stale("timeout for an answered attempt");
            return Ok(());
        }

        record.saga.mark_outcome_unknown(step);
        metrics::counter!("saga_response_timeouts_total", "step" => step.as_str()).increment(1);

        let error = format!(
            "no reply within {}ms",
            self.config.response_timeout.as_millis()
        );
        self.retry_or_exhaust(record, step, error, cause, now).await
    }

    async fn on_reply(
        &self,
        record: &mut SagaRecord,
        step: SagaStep,
        reply: &Message,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if !record.saga.awaits_reply(step) {
            stale("reply for a step not in flight");
            return Ok(());
        }

        let unavailable = reports_unavailable(reply);

        match reply {
            Message::InventoryReserved => {
                record.saga.complete(step);
                record.order.transition_to(OrderStatus::InventoryReserved)?;
                tracing::info!("inventory reserved");

                record.order.transition_to(OrderStatus::Shipping)?;
                self.issue(record, SagaStep::ShipOrder, cause, now).await;
                Ok(())
            }
            Message::Shipped { carrier_ref } => {
                record.saga.complete(step);
                record.saga.set_carrier_ref(carrier_ref.clone());
                record.order.transition_to(OrderStatus::Shipped)?;
                self.finish(record, now);
                Ok(())
            }
            Message::InventoryReleased | Message::ShipmentCancelled => {
                record.saga.complete(step);
                tracing::info!(%step, "compensation confirmed");
                self.next_compensation(record, cause, now).await
            }
            Message::InventoryRejected { reason } if !unavailable => {
                record.saga.fail(step);
                record.saga.set_last_error(format!("{step}: {reason}"));
                self.compensate(record, CompensationReason::Failure, Vec::new(), cause, now)
                    .await
            }
            Message::ShippingFailed { reason } if !unavailable => {
                record.saga.fail(step);
                record.saga.set_last_error(format!("{step}: {reason}"));
                self.compensate(
                    record,
                    CompensationReason::Failure,
                    vec![SagaStep::ReleaseInventory],
                    cause,
                    now,
                )
                .await
            }
            Message::InventoryRejected { reason } => {
                self.retry_or_exhaust(record, step, reason.to_string(), cause, now)
                    .await
            }
            Message::ShippingFailed { reason } => {
                self.retry_or_exhaust(record, step, reason.to_string(), cause, now)
                    .await
            }
            Message::InventoryReleaseFailed { reason } | Message::ShipmentCancelFailed { reason } => {
                self.retry_or_exhaust(record, step, reason.clone(), cause, now)
                    .await
            }
            other => Err(SagaError::UnexpectedMessage {
                order_id: record.order.id().clone(),
                message_type: other.message_type().to_string(),
            }),
        }
    }

    /// Issues the next attempt of a step, unless its service's breaker is
    /// open, in which case the step is deferred without using an attempt.
    async fn issue(
        &self,
        record: &mut SagaRecord,
        step: SagaStep,
        cause: MessageId,
        now: DateTime<Utc>,
    ) {
        let order_id = record.order.id().clone();
        let breaker = self.breakers.for_step(step);

        if let Err(open) = breaker.try_acquire().await {
            let attempts = record.saga.attempts(step);
            let delay = self
                .config
                .retry
                .backoff(attempts.max(1))
                .max(open.retry_after);
            record.saga.set_last_error(format!("{step}: {open}"));
            self.schedule_retry(record, step, attempts, delay, cause, now);

            tracing::warn!(
                %step,
                service = %breaker.service(),
                delay_ms = delay.as_millis() as u64,
                "circuit open, step deferred"
            );
            metrics::counter!("saga_circuit_rejections_total", "service" => breaker.service().as_str())
                .increment(1);
            return;
        }

        let command = match record.saga.command(step) {
            Some(previous) => previous.redelivered(),
            None => Envelope::new(order_id.clone(), command_for(&record.order, step)).caused_by(cause),
        };
        let attempt = record.saga.start_attempt(step, command.clone());

        record.saga.push(Outgoing::Publish {
            topic: step.topic().to_string(),
            envelope: command,
        });
        record.saga.push(Outgoing::Schedule {
            due_at: after(now, self.config.response_timeout),
            topic: topics::ORCHESTRATOR.to_string(),
            envelope: Envelope::new(order_id, Message::ResponseTimeout { step, attempt })
                .caused_by(cause),
        });

        tracing::info!(%step, attempt, "command issued");
    }

    fn schedule_retry(
        &self,
        record: &mut SagaRecord,
        step: SagaStep,
        attempt: u32,
        delay: Duration,
        cause: MessageId,
        now: DateTime<Utc>,
    ) {
        let due_at = after(now, delay);
        record.saga.schedule_retry(step, due_at);
        record.saga.push(Outgoing::Schedule {
            due_at,
            topic: topics::ORCHESTRATOR.to_string(),
            envelope: Envelope::new(record.order.id().clone(), Message::RetryDue { step, attempt })
                .caused_by(cause),
        });
    }

    /// Records a transient failure and schedules a retry, or gives up on the
    /// step once its attempts are used up.
    async fn retry_or_exhaust(
        &self,
        record: &mut SagaRecord,
        step: SagaStep,
        error: String,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let attempts = record.saga.record_failure(step, error.clone());
        if self.config.retry.is_exhausted(attempts) {
            return self.exhaust(record, step, cause, now).await;
        }

        let delay = self.config.retry.backoff(attempts);
        self.schedule_retry(record, step, attempts, delay, cause, now);
        tracing::warn!(
            %step,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            %error,
            "step failed, retry scheduled"
        );
        Ok(())
    }

    async fn exhaust(
        &self,
        record: &mut SagaRecord,
        step: SagaStep,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        record.saga.fail(step);

        let attempts = record.saga.attempts(step);
        let envelope = match record.saga.command(step) {
            Some(command) => command.clone(),
            None => Envelope::new(record.order.id().clone(), command_for(&record.order, step)),
        };
        let letter = DeadLetter::new(
            step.topic(),
            envelope,
            format!("{step} failed after {attempts} attempts"),
            record.saga.failures(step).to_vec(),
        );
        record.saga.push(Outgoing::DeadLetter { letter });

        tracing::error!(%step, attempts, "retries exhausted, command dead-lettered");
        metrics::counter!("saga_dead_letters_total", "step" => step.as_str()).increment(1);

        match step {
            SagaStep::ReserveInventory => {
                self.compensate(
                    record,
                    CompensationReason::Failure,
                    vec![SagaStep::ReleaseInventory],
                    cause,
                    now,
                )
                .await
            }
            SagaStep::ShipOrder => {
                // An unanswered attempt may still have created the shipment.
                let steps = if record.saga.outcome_unknown(step) {
                    vec![SagaStep::CancelShipment, SagaStep::ReleaseInventory]
                } else {
                    vec![SagaStep::ReleaseInventory]
                };
                self.compensate(record, CompensationReason::Failure, steps, cause, now)
                    .await
            }
            SagaStep::ReleaseInventory | SagaStep::CancelShipment => {
                record.saga.flag_manual_intervention();
                self.next_compensation(record, cause, now).await
            }
        }
    }

    async fn compensate(
        &self,
        record: &mut SagaRecord,
        reason: CompensationReason,
        steps: Vec<SagaStep>,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        record.saga.abandon_forward_steps();
        record.order.transition_to(OrderStatus::Compensating)?;
        record.saga.begin_compensation(reason, steps);

        tracing::warn!(
            ?reason,
            pending = ?record.saga.pending_compensations(),
            "saga compensating"
        );
        self.next_compensation(record, cause, now).await
    }

    /// Issues the next compensation step, or ends the saga when none is
    /// left.
    async fn next_compensation(
        &self,
        record: &mut SagaRecord,
        cause: MessageId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(step) = record.saga.next_compensation() {
            self.issue(record, step, cause, now).await;
            return Ok(());
        }

        if record.saga.requires_manual_intervention() {
            tracing::error!("compensation incomplete, manual intervention required");
            metrics::counter!("saga_manual_interventions_total").increment(1);
            return Ok(());
        }

        let terminal = match record.saga.compensation_reason() {
            Some(CompensationReason::Cancelled) => OrderStatus::Cancelled,
            _ => OrderStatus::Failed,
        };
        record.order.transition_to(terminal)?;
        self.finish(record, now);
        Ok(())
    }

    fn finish(&self, record: &mut SagaRecord, now: DateTime<Utc>) {
        record.saga.finish(now);

        let duration = (now - record.saga.started_at())
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        metrics::histogram!("saga_duration_seconds").record(duration);

        match record.order.status() {
            OrderStatus::Shipped => {
                metrics::counter!("saga_completed_total").increment(1);
                tracing::info!(
                    carrier_ref = record.saga.carrier_ref().unwrap_or_default(),
                    duration,
                    "saga completed"
                );
            }
            OrderStatus::Cancelled => {
                metrics::counter!("saga_cancelled_total").increment(1);
                tracing::info!(duration, "saga cancelled");
            }
            status => {
                metrics::counter!("saga_failed_total").increment(1);
                tracing::warn!(
                    %status,
                    last_error = record.saga.last_error().unwrap_or_default(),
                    duration,
                    "saga failed"
                );
            }
        }
    }

    /// Sends the outbox. Publishes that fail are retried through the delay
    /// queue; whatever cannot be sent at all stays in the outbox.
    async fn flush(&self, record: &mut SagaRecord, version: Version) -> Result<()> {
        if record.saga.outbox().is_empty() {
            return Ok(());
        }

        let mut remaining = Vec::new();
        let mut failure = None;
        for outgoing in record.saga.take_outbox() {
            let Err(e) = self.send(&outgoing).await else {
                continue;
            };
            if self.defer(&outgoing).await {
                tracing::warn!(error = %e, "publish failed, deferred to the delay queue");
                continue;
            }
            remaining.push(outgoing);
            failure = Some(e);
        }

        record.saga.restore_outbox(remaining);
        if let Err(e) = self
            .sagas
            .save(record.order.id().as_str(), version, record)
            .await
        {
            tracing::debug!(error = %e, "flushed outbox not saved, it will be sent again");
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn send(&self, outgoing: &Outgoing) -> std::result::Result<(), TransportError> {
        match outgoing {
            Outgoing::Publish { topic, envelope } => {
                self.bus.publish(topic, envelope.clone()).await
            }
            Outgoing::Schedule {
                due_at,
                topic,
                envelope,
            } => {
                self.delay_queue
                    .schedule(*due_at, topic, envelope.clone())
                    .await
            }
            Outgoing::DeadLetter { letter } => {
                self.dead_letters.push(letter.clone()).await.map(|_| ())
            }
        }
    }

    /// Schedules a failed publish for later. A command is not republished
    /// as is: a `RetryDue` lets the saga decide whether the step still
    /// needs it.
    async fn defer(&self, outgoing: &Outgoing) -> bool {
        let Outgoing::Publish { topic, envelope } = outgoing else {
            return false;
        };
        let due_at = after(Utc::now(), self.config.retry.initial_backoff);

        let result = match envelope.payload.command_step() {
            Some(step) => {
                let retry = Envelope::new(
                    envelope.correlation_id.clone(),
                    Message::RetryDue {
                        step,
                        attempt: envelope.attempt,
                    },
                )
                .caused_by(envelope.id);
                self.delay_queue
                    .schedule(due_at, topics::ORCHESTRATOR, retry)
                    .await
            }
            None => {
                self.delay_queue
                    .schedule(due_at, topic, envelope.clone())
                    .await
            }
        };
        result.is_ok()
    }
}

#[async_trait]
impl<S: KeyValueStore + Clone + 'static> MessageHandler for Orchestrator<S> {
    async fn handle(&self, envelope: &Envelope) -> std::result::Result<(), HandlerError> {
        self.handle_message(envelope).await.map_err(|e| {
            tracing::warn!(
                order_id = %envelope.correlation_id,
                message_type = %envelope.message_type,
                error = %e,
                "orchestrator could not process message"
            );
            HandlerError::from(e)
        })
    }
}

fn command_for(order: &Order, step: SagaStep) -> Message {
    let idempotency_key = idempotency_key(order.id(), step);
    match step {
        SagaStep::ReserveInventory => Message::ReserveInventory {
            items: order.items().to_vec(),
            idempotency_key,
        },
        SagaStep::ShipOrder => Message::ShipOrder { idempotency_key },
        SagaStep::CancelShipment => Message::CancelShipment { idempotency_key },
        SagaStep::ReleaseInventory => Message::ReleaseInventory { idempotency_key },
    }
}

fn after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// True for replies saying the service could not do the work at all.
fn reports_unavailable(reply: &Message) -> bool {
    match reply {
        Message::InventoryRejected { reason } => reason.is_retryable(),
        Message::ShippingFailed { reason } => reason.is_retryable(),
        Message::InventoryReleaseFailed { .. } | Message::ShipmentCancelFailed { .. } => true,
        _ => false,
    }
}

/// Whether a message shows the step's service to be up or down. Only
/// replies and timeouts of the attempt in flight count.
fn availability(record: &SagaRecord, message: &Message) -> Option<(SagaStep, bool)> {
    match message {
        Message::ResponseTimeout { step, attempt } => record
            .saga
            .is_in_flight(*step, *attempt)
            .then_some((*step, false)),
        reply => {
            let step = reply.reply_step()?;
            record
                .saga
                .awaits_reply(step)
                .then(|| (step, !reports_unavailable(reply)))
        }
    }
}

fn stale(why: &str) {
    tracing::debug!(why, "stale message acknowledged");
    metrics::counter!("saga_stale_messages_total").increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::Service;
    use crate::test_support::FlakyStore;
    use domain::{CustomerTier, LineItem, Money};
    use messaging::{
        BusConfig, InMemoryEventBus, InventoryRejection, ShippingFailure, StoreDeadLetterSink,
        StoreDelayQueue,
    };

    struct Fixture {
        orchestrator: Orchestrator<FlakyStore>,
        bus: InMemoryEventBus,
        delay_queue: Arc<StoreDelayQueue<FlakyStore>>,
        store: FlakyStore,
    }

    // No subscribers: published messages stay on the bus for the test to
    // deliver by hand.
    fn fixture() -> Fixture {
        let store = FlakyStore::default();
        let dead_letters: Arc<dyn DeadLetterSink> =
            Arc::new(StoreDeadLetterSink::new(store.clone()));
        let bus = InMemoryEventBus::new(BusConfig::default(), dead_letters.clone());
        let delay_queue = Arc::new(StoreDelayQueue::new(store.clone()));
        let orchestrator = Orchestrator::new(
            store.clone(),
            Arc::new(bus.clone()),
            delay_queue.clone(),
            dead_letters,
            SagaConfig::default(),
        );

        Fixture {
            orchestrator,
            bus,
            delay_queue,
            store,
        }
    }

    fn submission(id: &str) -> OrderSubmission {
        OrderSubmission::new(
            id,
            CustomerTier::Regular,
            vec![LineItem::new("A", 2, Money::from_dollars(10))],
        )
    }

    async fn start(f: &Fixture, id: &str) -> Envelope {
        f.orchestrator.admit(submission(id)).await.unwrap();
        let start = f.bus.published(topics::ORCHESTRATOR).await.remove(0);
        f.orchestrator.handle_message(&start).await.unwrap();
        start
    }

    async fn status(f: &Fixture, id: &str) -> OrderStatus {
        f.orchestrator
            .order(&OrderId::new(id))
            .await
            .unwrap()
            .unwrap()
            .status()
    }

    async fn delayed(f: &Fixture) -> Vec<Envelope> {
        let far_future = Utc::now() + chrono::Duration::days(1);
        f.delay_queue
            .due(far_future)
            .await
            .unwrap()
            .into_iter()
            .map(|(_, entry)| entry.envelope)
            .collect()
    }

    #[tokio::test]
    async fn test_admit_starts_saga() {
        let f = fixture();

        let admission = f.orchestrator.admit(submission("O1")).await.unwrap();

        assert!(admission.is_accepted());
        assert_eq!(status(&f, "O1").await, OrderStatus::Validated);
        let published = f.bus.published(topics::ORCHESTRATOR).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].payload, Message::StartSaga);
    }

    #[tokio::test]
    async fn test_rejected_order_publishes_nothing() {
        let f = fixture();

        let admission = f
            .orchestrator
            .admit(OrderSubmission::new("O2", CustomerTier::Regular, Vec::new()))
            .await
            .unwrap();

        assert!(!admission.is_accepted());
        assert_eq!(status(&f, "O2").await, OrderStatus::Rejected);
        assert_eq!(f.bus.published_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_order_id_is_refused() {
        let f = fixture();
        f.orchestrator.admit(submission("O1")).await.unwrap();

        let err = f.orchestrator.admit(submission("O1")).await.unwrap_err();

        assert!(matches!(err, SagaError::DuplicateOrder(_)));
        assert_eq!(f.bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn test_cancel_of_terminal_order_is_refused() {
        let f = fixture();
        f.orchestrator
            .admit(OrderSubmission::new("O2", CustomerTier::Regular, Vec::new()))
            .await
            .unwrap();

        let err = f
            .orchestrator
            .request_cancel(&OrderId::new("O2"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            SagaError::Order(OrderError::NotCancellable { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_saga() {
        let f = fixture();
        f.orchestrator.admit(submission("O1")).await.unwrap();
        let start = f.bus.published(topics::ORCHESTRATOR).await.remove(0);

        let cancel = Envelope::new("O1", Message::CancelOrder);
        f.orchestrator.handle_message(&cancel).await.unwrap();
        f.orchestrator.handle_message(&start).await.unwrap();

        assert_eq!(status(&f, "O1").await, OrderStatus::Cancelled);
        assert!(
            f.bus
                .published(topics::INVENTORY_COMMANDS)
                .await
                .is_empty()
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_applied_once() {
        let f = fixture();
        let start = start(&f, "O1").await;

        f.orchestrator.handle_message(&start).await.unwrap();
        f.orchestrator.handle_message(&start.redelivered()).await.unwrap();

        let commands = f.bus.published(topics::INVENTORY_COMMANDS).await;
        assert_eq!(commands.len(), 1);
        let snapshot = f
            .orchestrator
            .snapshot(&OrderId::new("O1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.attempts[&SagaStep::ReserveInventory], 1);
    }

    #[tokio::test]
    async fn test_reply_advances_and_late_timeout_is_stale() {
        let f = fixture();
        start(&f, "O1").await;
        let reserve = f.bus.published(topics::INVENTORY_COMMANDS).await.remove(0);

        let reserved = reserve.reply(Message::InventoryReserved);
        f.orchestrator.handle_message(&reserved).await.unwrap();
        assert_eq!(status(&f, "O1").await, OrderStatus::Shipping);

        let timeout = Envelope::new(
            "O1",
            Message::ResponseTimeout {
                step: SagaStep::ReserveInventory,
                attempt: 1,
            },
        );
        f.orchestrator.handle_message(&timeout).await.unwrap();

        assert_eq!(status(&f, "O1").await, OrderStatus::Shipping);
        let ship = f.bus.published(topics::SHIPPING_COMMANDS).await;
        assert_eq!(ship.len(), 1);
        assert_eq!(
            ship[0].payload,
            Message::ShipOrder {
                idempotency_key: "O1:ship".to_string()
            }
        );
        assert_eq!(ship[0].causation_id, Some(reserved.id));
    }

    #[tokio::test]
    async fn test_timeout_retries_with_same_key() {
        let f = fixture();
        start(&f, "O1").await;
        let first = f.bus.published(topics::INVENTORY_COMMANDS).await.remove(0);

        let timeout = Envelope::new(
            "O1",
            Message::ResponseTimeout {
                step: SagaStep::ReserveInventory,
                attempt: 1,
            },
        );
        f.orchestrator.handle_message(&timeout).await.unwrap();

        let retry = delayed(&f)
            .await
            .into_iter()
            .find(|e| matches!(e.payload, Message::RetryDue { .. }))
            .unwrap();
        f.orchestrator.handle_message(&retry).await.unwrap();

        let commands = f.bus.published(topics::INVENTORY_COMMANDS).await;
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[1].id, first.id);
        assert_eq!(commands[1].attempt, 2);
        assert_eq!(
            commands[1].payload.idempotency_key(),
            Some("O1:reserve")
        );
    }

    #[tokio::test]
    async fn test_failed_publish_is_deferred() {
        let f = fixture();
        f.orchestrator.admit(submission("O1")).await.unwrap();
        let start = f.bus.published(topics::ORCHESTRATOR).await.remove(0);

        f.bus.fail_next_publishes(1);
        f.orchestrator.handle_message(&start).await.unwrap();
        assert!(
            f.bus
                .published(topics::INVENTORY_COMMANDS)
                .await
                .is_empty()
        );

        let retry = delayed(&f)
            .await
            .into_iter()
            .find(|e| {
                e.payload
                    == Message::RetryDue {
                        step: SagaStep::ReserveInventory,
                        attempt: 1,
                    }
            })
            .unwrap();
        f.orchestrator.handle_message(&retry).await.unwrap();

        let commands = f.bus.published(topics::INVENTORY_COMMANDS).await;
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].attempt, 2);
    }

    #[tokio::test]
    async fn test_breaker_counts_a_reply_once_it_is_saved() {
        let f = fixture();
        start(&f, "O1").await;
        let reserve = f.bus.published(topics::INVENTORY_COMMANDS).await.remove(0);
        let unavailable = reserve.reply(Message::InventoryRejected {
            reason: InventoryRejection::ServiceUnavailable,
        });
        let breaker = f.orchestrator.breakers().get(Service::Inventory);

        f.store.fail_next_write(SAGAS, "O1");
        assert!(f.orchestrator.handle_message(&unavailable).await.is_err());
        assert_eq!(breaker.failure_count().await, 0);

        // Redelivery of the same reply.
        f.orchestrator.handle_message(&unavailable).await.unwrap();
        assert_eq!(breaker.failure_count().await, 1);
        f.orchestrator.handle_message(&unavailable).await.unwrap();
        assert_eq!(breaker.failure_count().await, 1);
    }

    #[tokio::test]
    async fn test_ship_exhaustion_without_lost_replies_only_releases() {
        let f = fixture();
        start(&f, "O1").await;
        let reserve = f.bus.published(topics::INVENTORY_COMMANDS).await.remove(0);
        f.orchestrator
            .handle_message(&reserve.reply(Message::InventoryReserved))
            .await
            .unwrap();

        for attempt in 1..=3 {
            let ship = f.bus.published(topics::SHIPPING_COMMANDS).await.pop().unwrap();
            f.orchestrator
                .handle_message(&ship.reply(Message::ShippingFailed {
                    reason: ShippingFailure::ServiceUnavailable,
                }))
                .await
                .unwrap();
            if attempt < 3 {
                let retry = delayed(&f)
                    .await
                    .into_iter()
                    .find(|e| e.payload == Message::RetryDue {
                        step: SagaStep::ShipOrder,
                        attempt,
                    })
                    .unwrap();
                f.orchestrator.handle_message(&retry).await.unwrap();
            }
        }

        let snapshot = f
            .orchestrator
            .snapshot(&OrderId::new("O1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.attempts[&SagaStep::ShipOrder], 3);
        assert!(!snapshot.attempts.contains_key(&SagaStep::CancelShipment));
        assert_eq!(snapshot.attempts[&SagaStep::ReleaseInventory], 1);
        assert!(
            f.bus
                .published(topics::SHIPPING_COMMANDS)
                .await
                .iter()
                .all(|e| matches!(e.payload, Message::ShipOrder { .. }))
        );
    }
}

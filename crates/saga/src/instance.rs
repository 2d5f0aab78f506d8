//! Durable saga state.
//!
//! The order and its saga instance are persisted together as one
//! [`SagaRecord`] keyed by order id, so every transition is a single
//! compare-and-set. Messages the transition produces are written to the
//! record's outbox in the same write and published afterwards.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use common::{MessageId, OrderId};
use domain::{Order, OrderStatus};
use messaging::{AttemptRecord, DeadLetter, Envelope, SagaStep};
use serde::{Deserialize, Serialize};

/// Returns the idempotency key for a step's command.
///
/// Keys are derived from the order id only, so they are stable across
/// retries of the step. Compensation keys carry a marker so they never
/// collide with forward keys.
pub fn idempotency_key(order_id: &OrderId, step: SagaStep) -> String {
    match step {
        SagaStep::ReserveInventory => format!("{order_id}:reserve"),
        SagaStep::ShipOrder => format!("{order_id}:ship"),
        SagaStep::ReleaseInventory => format!("{order_id}:release:compensation"),
        SagaStep::CancelShipment => format!("{order_id}:cancel-shipment:compensation"),
    }
}

/// Where a step stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StepState {
    NotStarted,
    /// The command for `attempt` was issued and no reply has been accepted.
    InFlight { attempt: u32 },
    /// The next attempt is queued in the delay queue.
    RetryScheduled { at: DateTime<Utc> },
    Completed,
    Failed,
    /// The saga moved on (cancellation) while the step was pending.
    Abandoned,
}

impl StepState {
    /// Returns true while the step still expects a reply or a retry.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            StepState::InFlight { .. } | StepState::RetryScheduled { .. }
        )
    }
}

/// Attempts and failures of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepProgress {
    pub step: SagaStep,
    /// Attempts issued so far.
    pub attempts: u32,
    pub state: StepState,
    /// The command as last issued. Retries redeliver this envelope.
    pub command: Option<Envelope>,
    /// Every failed attempt, oldest first.
    pub failures: Vec<AttemptRecord>,
    /// Some attempt went unanswered, so its effect may have happened.
    #[serde(default)]
    pub outcome_unknown: bool,
}

impl StepProgress {
    fn new(step: SagaStep) -> Self {
        Self {
            step,
            attempts: 0,
            state: StepState::NotStarted,
            command: None,
            failures: Vec::new(),
            outcome_unknown: false,
        }
    }
}

/// Why compensation started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationReason {
    /// A step failed. Compensation ends in `Failed`.
    Failure,
    /// The order was cancelled. Compensation ends in `Cancelled`.
    Cancelled,
}

/// A side effect waiting to leave the outbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Outgoing {
    Publish {
        topic: String,
        envelope: Envelope,
    },
    Schedule {
        due_at: DateTime<Utc>,
        topic: String,
        envelope: Envelope,
    },
    DeadLetter {
        letter: DeadLetter,
    },
}

/// Progress of one order's saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaInstance {
    order_id: OrderId,
    processed: Vec<MessageId>,
    steps: Vec<StepProgress>,
    pending_compensations: VecDeque<SagaStep>,
    compensation_reason: Option<CompensationReason>,
    requires_manual_intervention: bool,
    last_error: Option<String>,
    next_retry_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    carrier_ref: Option<String>,
    outbox: Vec<Outgoing>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
}

impl SagaInstance {
    /// Creates the saga for a freshly admitted order.
    pub fn new(order_id: OrderId, now: DateTime<Utc>) -> Self {
        Self {
            order_id,
            processed: Vec::new(),
            steps: Vec::new(),
            pending_compensations: VecDeque::new(),
            compensation_reason: None,
            requires_manual_intervention: false,
            last_error: None,
            next_retry_at: None,
            consecutive_failures: 0,
            carrier_ref: None,
            outbox: Vec::new(),
            started_at: now,
            finished_at: None,
        }
    }

    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    /// Returns true if the envelope was already applied to this saga.
    pub fn has_processed(&self, id: MessageId) -> bool {
        self.processed.contains(&id)
    }

    /// Remembers that the envelope was applied.
    pub fn mark_processed(&mut self, id: MessageId) {
        self.processed.push(id);
    }

    /// Returns the number of envelopes applied so far.
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn progress(&self, step: SagaStep) -> Option<&StepProgress> {
        self.steps.iter().find(|p| p.step == step)
    }

    fn progress_mut(&mut self, step: SagaStep) -> &mut StepProgress {
        if let Some(index) = self.steps.iter().position(|p| p.step == step) {
            &mut self.steps[index]
        } else {
            self.steps.push(StepProgress::new(step));
            let last = self.steps.len() - 1;
            &mut self.steps[last]
        }
    }

    /// Returns the attempts issued for a step.
    pub fn attempts(&self, step: SagaStep) -> u32 {
        self.progress(step).map(|p| p.attempts).unwrap_or(0)
    }

    /// Returns true if `attempt` of `step` is the one awaiting a reply.
    pub fn is_in_flight(&self, step: SagaStep, attempt: u32) -> bool {
        self.progress(step)
            .is_some_and(|p| p.state == StepState::InFlight { attempt })
    }

    /// Returns true if a reply for `step` would be accepted.
    pub fn awaits_reply(&self, step: SagaStep) -> bool {
        self.progress(step)
            .is_some_and(|p| matches!(p.state, StepState::InFlight { .. }))
    }

    /// Returns the command last issued for a step.
    pub fn command(&self, step: SagaStep) -> Option<&Envelope> {
        self.progress(step).and_then(|p| p.command.as_ref())
    }

    /// Records a new attempt of `step` carried by `command`. Returns the
    /// attempt number.
    pub fn start_attempt(&mut self, step: SagaStep, command: Envelope) -> u32 {
        let progress = self.progress_mut(step);
        progress.attempts += 1;
        let attempt = progress.attempts;
        progress.state = StepState::InFlight { attempt };
        progress.command = Some(command);
        self.next_retry_at = None;
        attempt
    }

    /// Marks the next attempt of `step` as queued for `at`.
    pub fn schedule_retry(&mut self, step: SagaStep, at: DateTime<Utc>) {
        self.progress_mut(step).state = StepState::RetryScheduled { at };
        self.next_retry_at = Some(at);
    }

    /// Records a failed attempt of `step`. Returns the attempts issued.
    pub fn record_failure(&mut self, step: SagaStep, error: impl Into<String>) -> u32 {
        let error = error.into();
        let progress = self.progress_mut(step);
        progress
            .failures
            .push(AttemptRecord::now(progress.attempts, error.clone()));
        let attempts = progress.attempts;

        self.last_error = Some(format!("{step}: {error}"));
        self.consecutive_failures += 1;
        attempts
    }

    /// Notes that an attempt of `step` got no reply.
    pub fn mark_outcome_unknown(&mut self, step: SagaStep) {
        self.progress_mut(step).outcome_unknown = true;
    }

    /// Returns true if some attempt of `step` may have taken effect without
    /// a reply.
    pub fn outcome_unknown(&self, step: SagaStep) -> bool {
        self.progress(step).is_some_and(|p| p.outcome_unknown)
    }

    /// Returns the failure history of a step.
    pub fn failures(&self, step: SagaStep) -> &[AttemptRecord] {
        self.progress(step)
            .map(|p| p.failures.as_slice())
            .unwrap_or_default()
    }

    pub fn complete(&mut self, step: SagaStep) {
        self.progress_mut(step).state = StepState::Completed;
        self.consecutive_failures = 0;
        self.next_retry_at = None;
    }

    pub fn fail(&mut self, step: SagaStep) {
        self.progress_mut(step).state = StepState::Failed;
        self.next_retry_at = None;
    }

    /// Abandons every pending forward step.
    pub fn abandon_forward_steps(&mut self) {
        for progress in self.steps.iter_mut() {
            if !progress.step.is_compensation() && progress.state.is_pending() {
                progress.state = StepState::Abandoned;
            }
        }
        self.next_retry_at = None;
    }

    /// Queues compensation steps, to be run one after the other.
    pub fn begin_compensation(&mut self, reason: CompensationReason, steps: Vec<SagaStep>) {
        self.compensation_reason = Some(reason);
        self.pending_compensations = steps.into();
    }

    /// Takes the next queued compensation step.
    pub fn next_compensation(&mut self) -> Option<SagaStep> {
        self.pending_compensations.pop_front()
    }

    pub fn compensation_reason(&self) -> Option<CompensationReason> {
        self.compensation_reason
    }

    /// Returns compensation steps not yet confirmed: the one in progress,
    /// then the queued ones.
    pub fn pending_compensations(&self) -> Vec<SagaStep> {
        self.steps
            .iter()
            .filter(|p| p.step.is_compensation() && p.state.is_pending())
            .map(|p| p.step)
            .chain(self.pending_compensations.iter().copied())
            .collect()
    }

    pub fn flag_manual_intervention(&mut self) {
        self.requires_manual_intervention = true;
    }

    pub fn requires_manual_intervention(&self) -> bool {
        self.requires_manual_intervention
    }

    pub fn set_last_error(&mut self, error: impl Into<String>) {
        self.last_error = Some(error.into());
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn next_retry_at(&self) -> Option<DateTime<Utc>> {
        self.next_retry_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn set_carrier_ref(&mut self, carrier_ref: impl Into<String>) {
        self.carrier_ref = Some(carrier_ref.into());
    }

    pub fn carrier_ref(&self) -> Option<&str> {
        self.carrier_ref.as_deref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Marks the saga as finished.
    pub fn finish(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.next_retry_at = None;
    }

    /// Adds a side effect to the outbox.
    pub fn push(&mut self, outgoing: Outgoing) {
        self.outbox.push(outgoing);
    }

    pub fn outbox(&self) -> &[Outgoing] {
        &self.outbox
    }

    /// Empties the outbox, returning its contents.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Puts back side effects that could not be flushed.
    pub fn restore_outbox(&mut self, remaining: Vec<Outgoing>) {
        self.outbox = remaining;
    }
}

/// The persisted unit: an order and its saga.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SagaRecord {
    pub order: Order,
    pub saga: SagaInstance,
}

impl SagaRecord {
    /// Returns the observable state of the saga.
    pub fn snapshot(&self) -> SagaSnapshot {
        let saga = &self.saga;
        SagaSnapshot {
            order_id: self.order.id().clone(),
            status: self.order.status(),
            attempts: saga.steps.iter().map(|p| (p.step, p.attempts)).collect(),
            last_error: saga.last_error.clone(),
            next_retry_at: saga.next_retry_at,
            consecutive_failures: saga.consecutive_failures,
            requires_manual_intervention: saga.requires_manual_intervention,
            pending_compensations: saga.pending_compensations(),
            carrier_ref: saga.carrier_ref.clone(),
        }
    }
}

/// Read-only view of a saga for observability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SagaSnapshot {
    pub order_id: OrderId,
    pub status: OrderStatus,
    /// Attempts issued per step.
    pub attempts: BTreeMap<SagaStep, u32>,
    pub last_error: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub requires_manual_intervention: bool,
    pub pending_compensations: Vec<SagaStep>,
    pub carrier_ref: Option<String>,
}

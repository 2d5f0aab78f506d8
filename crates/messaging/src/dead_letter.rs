//! Dead-letter sink.
//!
//! Messages whose retry or delivery budget is exhausted end up here with
//! the full history of what was tried. Nothing reads the sink inside the
//! pipeline; replay and alerting are external concerns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use store::{KeyValueStore, Repository, StoreError, Version};

use crate::{Envelope, Result};

const DEAD_LETTERS: &str = "dead_letters";
const SEQUENCE: &str = "dead_letter_sequence";
const SEQUENCE_KEY: &str = "next";

/// One failed attempt at processing a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// What went wrong.
    pub error: String,
    /// When the attempt failed.
    pub failed_at: DateTime<Utc>,
}

impl AttemptRecord {
    /// Records a failure that happened now.
    pub fn now(attempt: u32, error: impl Into<String>) -> Self {
        Self {
            attempt,
            error: error.into(),
            failed_at: Utc::now(),
        }
    }
}

/// A message that could not be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Arrival order in the sink, assigned on push.
    #[serde(default)]
    pub sequence: u64,
    /// Topic the message was bound for.
    pub topic: String,
    /// The message as last attempted.
    pub envelope: Envelope,
    /// Why it was given up on.
    pub reason: String,
    /// Every failed attempt, oldest first.
    pub attempts: Vec<AttemptRecord>,
    /// When the message was dead-lettered.
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Creates a dead letter for an envelope.
    pub fn new(
        topic: impl Into<String>,
        envelope: Envelope,
        reason: impl Into<String>,
        attempts: Vec<AttemptRecord>,
    ) -> Self {
        Self {
            sequence: 0,
            topic: topic.into(),
            envelope,
            reason: reason.into(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }
}

/// Durable storage for dead letters, ordered by arrival.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Stores a dead letter and returns its arrival sequence number.
    async fn push(&self, letter: DeadLetter) -> Result<u64>;

    /// Returns every dead letter in arrival order.
    async fn list(&self) -> Result<Vec<DeadLetter>>;

    /// Returns the number of dead letters.
    async fn len(&self) -> Result<usize> {
        Ok(self.list().await?.len())
    }

    /// Returns true if the sink is empty.
    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

/// Dead-letter sink backed by a [`KeyValueStore`].
///
/// Arrival order comes from a counter record advanced with compare-and-set;
/// each letter is stored under its zero-padded sequence number so a key
/// scan returns letters in arrival order.
pub struct StoreDeadLetterSink<S> {
    letters: Repository<S, DeadLetter>,
    sequence: Repository<S, u64>,
}

impl<S: KeyValueStore + Clone> StoreDeadLetterSink<S> {
    /// Creates a sink over the given store.
    pub fn new(store: S) -> Self {
        Self {
            letters: Repository::new(store.clone(), DEAD_LETTERS),
            sequence: Repository::new(store, SEQUENCE),
        }
    }

    async fn next_sequence(&self) -> Result<u64> {
        loop {
            let (next, version) = self
                .sequence
                .load(SEQUENCE_KEY)
                .await?
                .unwrap_or((1, Version::initial()));

            match self.sequence.save(SEQUENCE_KEY, version, &(next + 1)).await {
                Ok(_) => return Ok(next),
                Err(StoreError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl<S: KeyValueStore + Clone> DeadLetterSink for StoreDeadLetterSink<S> {
    async fn push(&self, mut letter: DeadLetter) -> Result<u64> {
        let sequence = self.next_sequence().await?;
        letter.sequence = sequence;

        self.letters
            .insert_if_absent(&format!("{sequence:020}"), &letter)
            .await?;

        tracing::error!(
            sequence,
            topic = %letter.topic,
            order_id = %letter.envelope.correlation_id,
            message_type = %letter.envelope.message_type,
            attempts = letter.attempts.len(),
            reason = %letter.reason,
            "message dead-lettered"
        );
        metrics::counter!("dead_letters_total", "topic" => letter.topic.clone()).increment(1);

        Ok(sequence)
    }

    async fn list(&self) -> Result<Vec<DeadLetter>> {
        Ok(self
            .letters
            .list()
            .await?
            .into_iter()
            .map(|(_, letter)| letter)
            .collect())
    }
}

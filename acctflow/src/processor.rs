//! Per-message processing pipeline
//!
//! For each consumed message, strictly in order:
//! 1. decode the payload and read the enqueue time from the headers
//! 2. persist the audit record (fatal if the store refuses)
//! 3. call the downstream service, retrying with backoff while the failure is retryable
//! 4. write every resolved attempt onto the audit record
//! 5. route exhausted and non-retryable messages to their failure channel
//!
//! A lane processes one message at a time, so the audit record of a message is only
//! ever written by the call that is processing it.

use crate::bus::BusMessage;
use crate::classify::{DeliveryError, FailureKind};
use crate::dead_letter::DeadLetterSink;
use crate::downstream::AccountService;
use crate::headers::extract_enqueue_time;
use crate::model::{AccountEvent, BusCoordinates, ErrorKind, FailedMessage};
use crate::recorder::{IngestRecorder, OutcomeRecorder};
use crate::retry::{backoff_wait, RetryCoordinator, RetryState, Transition, WaitOutcome};
use crate::store::{StorageError, TransactionStore};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How processing of a message ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The downstream service accepted the event
    Delivered {
        record_id: u64,
        status: u16,
        retries: u32,
    },
    /// Sent to the dead-letter or error channel
    DeadLettered {
        record_id: u64,
        kind: ErrorKind,
        retries: u32,
    },
    /// Shutdown interrupted a backoff wait; the record stays in pending-retry state
    Abandoned { record_id: u64, retries: u32 },
    /// The payload was not an account event; nothing was recorded
    Undecodable,
}

impl Disposition {
    /// Whether the message is finished and its offset may be committed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Disposition::Abandoned { .. })
    }
}

/// Consumer-side counters
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub consumed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub undecodable: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStatsSnapshot {
    pub consumed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retries: u64,
    pub undecodable: u64,
    pub dead_lettered: u64,
    pub error_routed: u64,
}

/// Components a [`MessageProcessor`] is built from
pub struct ProcessorParts {
    pub store: Arc<dyn TransactionStore>,
    pub service: Arc<dyn AccountService>,
    pub coordinator: RetryCoordinator,
    pub dead_letters: Arc<DeadLetterSink>,
    pub shutdown: CancellationToken,
}

pub struct MessageProcessor {
    ingest: IngestRecorder,
    outcomes: OutcomeRecorder,
    service: Arc<dyn AccountService>,
    coordinator: RetryCoordinator,
    dead_letters: Arc<DeadLetterSink>,
    shutdown: CancellationToken,
    stats: ConsumerStats,
}

impl MessageProcessor {
    pub fn new(parts: ProcessorParts) -> Self {
        Self {
            ingest: IngestRecorder::new(parts.store.clone()),
            outcomes: OutcomeRecorder::new(parts.store),
            service: parts.service,
            coordinator: parts.coordinator,
            dead_letters: parts.dead_letters,
            shutdown: parts.shutdown,
            stats: ConsumerStats::default(),
        }
    }

    pub fn stats(&self) -> &ConsumerStats {
        &self.stats
    }

    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        let sink = self.dead_letters.counters();
        ConsumerStatsSnapshot {
            consumed: self.stats.consumed.load(Ordering::Relaxed),
            succeeded: self.stats.succeeded.load(Ordering::Relaxed),
            failed: self.stats.failed.load(Ordering::Relaxed),
            retries: self.stats.retries.load(Ordering::Relaxed),
            undecodable: self.stats.undecodable.load(Ordering::Relaxed),
            dead_lettered: sink.dead_lettered.load(Ordering::Relaxed),
            error_routed: sink.error_routed.load(Ordering::Relaxed),
        }
    }

    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.dead_letters
    }

    /// Processes one message to a disposition
    ///
    /// # Returns
    /// * `Ok(Disposition)` - How the message ended
    /// * `Err(StorageError)` - The audit trail could not be written; the message is not
    ///   finished and must not be committed
    pub async fn process(&self, message: &BusMessage) -> Result<Disposition, StorageError> {
        self.stats.consumed.fetch_add(1, Ordering::Relaxed);
        let coordinates = message.coordinates();

        let event = match decode_event(message) {
            Ok(event) => event,
            Err(reason) => {
                self.stats.undecodable.fetch_add(1, Ordering::Relaxed);
                warn!("Skipping undecodable message at {}: {}", coordinates, reason);
                return Ok(Disposition::Undecodable);
            }
        };

        let enqueue_time = extract_enqueue_time(&message.headers);
        info!(
            "Received message from topic [{}] partition [{}] offset [{}]: action={} account={} enqueued={:?}",
            coordinates.topic,
            coordinates.partition,
            coordinates.offset,
            event.account_action,
            event.masked_account_number(),
            enqueue_time.timestamp()
        );

        let record = self
            .ingest
            .record_receipt(&event, &coordinates, enqueue_time.timestamp())
            .await?;

        self.deliver(&event, &coordinates, record.id).await
    }

    /// Runs the attempt loop for an already recorded message
    async fn deliver(
        &self,
        event: &AccountEvent,
        coordinates: &BusCoordinates,
        record_id: u64,
    ) -> Result<Disposition, StorageError> {
        let max_retries = self.coordinator.policy().max_retries;
        let mut attempt = 0;

        loop {
            let failure = match self.service.post_account(event).await {
                Ok(outcome) => {
                    self.outcomes
                        .record_response(record_id, outcome.status, outcome.response.message.clone())
                        .await?;
                    self.stats.succeeded.fetch_add(1, Ordering::Relaxed);
                    debug!("{} -> {:?}", coordinates, RetryState::Success);
                    info!(
                        "Processed message at {} with status {}: {}",
                        coordinates,
                        outcome.status,
                        outcome.response.message.as_deref().unwrap_or("")
                    );
                    return Ok(Disposition::Delivered {
                        record_id,
                        status: outcome.status,
                        retries: attempt,
                    });
                }
                Err(failure) => failure,
            };

            self.record_failure(record_id, &failure).await?;

            let transition = self.coordinator.on_failure(attempt, &failure);
            debug!(
                "{}: attempt {} failed ({}) -> {:?}",
                coordinates,
                attempt,
                failure.kind(),
                transition.target()
            );

            match transition {
                Transition::RetryAfter {
                    next_attempt,
                    delay,
                } => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Retry attempt {} of {} for topic [{}] partition [{}] offset [{}]. Error: {}",
                        next_attempt,
                        max_retries,
                        coordinates.topic,
                        coordinates.partition,
                        coordinates.offset,
                        failure
                    );
                    if backoff_wait(delay, &self.shutdown).await == WaitOutcome::Cancelled {
                        warn!(
                            "Shutdown during backoff, leaving {} in pending retry state",
                            coordinates
                        );
                        return Ok(Disposition::Abandoned {
                            record_id,
                            retries: attempt,
                        });
                    }
                    attempt = next_attempt;
                }
                Transition::Exhaust { kind, retries } => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Giving up on message at {} after {} retries ({}): {}",
                        coordinates, retries, kind, failure
                    );
                    let failed = FailedMessage::new(
                        event.clone(),
                        kind,
                        failure.to_string(),
                        failure.status().map(i32::from).unwrap_or(0),
                        retries,
                        coordinates,
                    );
                    self.dead_letters.route(failed);
                    return Ok(Disposition::DeadLettered {
                        record_id,
                        kind,
                        retries,
                    });
                }
            }
        }
    }

    /// Writes a failed attempt onto the audit record
    ///
    /// Retryable failures are parked as pending retry, client errors keep their status,
    /// anything unexpected gets its own sentinel.
    async fn record_failure(
        &self,
        record_id: u64,
        failure: &DeliveryError,
    ) -> Result<(), StorageError> {
        let reason = failure.to_string();
        match failure.kind() {
            FailureKind::TransportFailure | FailureKind::DownstreamServerError => {
                self.outcomes.record_pending_retry(record_id, &reason).await?;
            }
            FailureKind::DownstreamClientError => {
                let status = failure.status().unwrap_or_default();
                self.outcomes
                    .record_response(record_id, status, Some(reason))
                    .await?;
            }
            FailureKind::UnexpectedFailure => {
                self.outcomes.record_unexpected(record_id, &reason).await?;
            }
        }
        Ok(())
    }
}

fn decode_event(message: &BusMessage) -> Result<AccountEvent, String> {
    let value = message
        .value
        .as_ref()
        .ok_or_else(|| "message has no value".to_string())?;
    serde_json::from_slice(value).map_err(|e| e.to_string())
}

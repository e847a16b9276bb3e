//! Failure channel publishing
//!
//! Messages that end in `RETRY_EXHAUSTED` go to the dead-letter topic, messages that
//! end in `NON_RETRYABLE` go to the error topic. Both carry the same [`FailedMessage`]
//! envelope keyed by account number. Publishing is best effort: the outcome is logged
//! when the bus answers and is never retried, since the audit record already holds the
//! authoritative result.

use crate::bus::{BusProducer, OutgoingRecord};
use crate::model::{ErrorKind, FailedMessage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

/// Logical destination of a failed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureChannel {
    DeadLetter,
    Error,
}

impl FailureChannel {
    pub fn for_kind(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::RetryExhausted => FailureChannel::DeadLetter,
            ErrorKind::NonRetryable => FailureChannel::Error,
        }
    }
}

#[derive(Debug, Default)]
pub struct DeadLetterCounters {
    pub dead_lettered: AtomicU64,
    pub error_routed: AtomicU64,
    pub publish_failures: AtomicU64,
}

pub struct DeadLetterSink {
    bus: Arc<dyn BusProducer>,
    dlq_topic: String,
    error_topic: String,
    tracker: TaskTracker,
    counters: Arc<DeadLetterCounters>,
}

impl DeadLetterSink {
    pub fn new(
        bus: Arc<dyn BusProducer>,
        dlq_topic: impl Into<String>,
        error_topic: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            dlq_topic: dlq_topic.into(),
            error_topic: error_topic.into(),
            tracker: TaskTracker::new(),
            counters: Arc::new(DeadLetterCounters::default()),
        }
    }

    pub fn topic(&self, channel: FailureChannel) -> &str {
        match channel {
            FailureChannel::DeadLetter => &self.dlq_topic,
            FailureChannel::Error => &self.error_topic,
        }
    }

    pub fn counters(&self) -> &DeadLetterCounters {
        &self.counters
    }

    /// Publishes to the channel matching the message's error kind
    pub fn route(&self, failed: FailedMessage) {
        let channel = FailureChannel::for_kind(failed.error_kind);
        self.send(failed, channel);
    }

    /// Publishes `failed` to `channel` without waiting for the bus
    pub fn send(&self, failed: FailedMessage, channel: FailureChannel) {
        let topic = self.topic(channel).to_string();
        match channel {
            FailureChannel::DeadLetter => self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed),
            FailureChannel::Error => self.counters.error_routed.fetch_add(1, Ordering::Relaxed),
        };

        let payload = match serde_json::to_vec(&failed) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    "Failed to serialize {} message for topic {}: {}",
                    failed.error_kind, topic, e
                );
                return;
            }
        };

        let account = failed.original_message.masked_account_number();
        debug!(
            "Sending {} message for account {} to {}",
            failed.error_kind, account, topic
        );

        let record = OutgoingRecord::new(
            topic.clone(),
            Some(failed.original_message.account_number.clone()),
            payload,
        );
        let bus = self.bus.clone();
        let counters = self.counters.clone();
        let kind = failed.error_kind;
        self.tracker.spawn(async move {
            match bus.send(record).await {
                Ok(meta) => info!(
                    "Sent {} message for account {} to {} (partition {}, offset {})",
                    kind, account, topic, meta.partition, meta.offset
                ),
                Err(e) => {
                    counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "Failed to send {} message for account {} to {}: {}",
                        kind, account, topic, e
                    );
                }
            }
        });
    }

    /// Waits until every publish started so far has completed
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

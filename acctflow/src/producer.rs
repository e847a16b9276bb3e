//! Load-traffic publisher
//!
//! Publishes generated account events to the bus without waiting for acknowledgement.
//! The sent counter moves before the send resolves; success and failure counters move
//! from the completion task. Failed publishes are logged and dropped.

use crate::bus::{BusProducer, OutgoingRecord};
use crate::model::AccountEvent;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error};
use uuid::Uuid;

/// Successful publishes between progress log lines
const PROGRESS_EVERY: u64 = 1000;

/// Monotonic publish counters shared with completion tasks
#[derive(Debug, Default)]
pub struct ProducerCounters {
    pub sent: AtomicU64,
    pub successful: AtomicU64,
    pub failed: AtomicU64,
}

impl ProducerCounters {
    pub fn reset(&self) {
        self.sent.store(0, Ordering::Relaxed);
        self.successful.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
    }
}

/// Producer statistics as reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerStats {
    pub running: bool,
    pub messages_per_second: u32,
    pub messages_sent: u64,
    pub messages_successful: u64,
    pub messages_failed: u64,
    pub topic: String,
}

pub struct Publisher {
    bus: Arc<dyn BusProducer>,
    topic: String,
    counters: Arc<ProducerCounters>,
    tracker: TaskTracker,
}

impl Publisher {
    pub fn new(bus: Arc<dyn BusProducer>, topic: impl Into<String>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            counters: Arc::new(ProducerCounters::default()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn counters(&self) -> &ProducerCounters {
        &self.counters
    }

    /// Snapshot of the counters combined with the scheduler's view
    pub fn stats(&self, running: bool, messages_per_second: u32) -> ProducerStats {
        ProducerStats {
            running,
            messages_per_second,
            messages_sent: self.counters.sent.load(Ordering::Relaxed),
            messages_successful: self.counters.successful.load(Ordering::Relaxed),
            messages_failed: self.counters.failed.load(Ordering::Relaxed),
            topic: self.topic.clone(),
        }
    }

    /// Sends `event` under a fresh random key; returns once the send is handed off
    pub fn publish(&self, event: &AccountEvent) {
        let payload = match serde_json::to_vec(event) {
            Ok(payload) => payload,
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                error!("Failed to serialize account event: {}", e);
                return;
            }
        };

        let key = Uuid::new_v4().to_string();
        let record = OutgoingRecord::new(self.topic.clone(), Some(key.clone()), payload);
        self.counters.sent.fetch_add(1, Ordering::Relaxed);

        let bus = self.bus.clone();
        let counters = self.counters.clone();
        self.tracker.spawn(async move {
            match bus.send(record).await {
                Ok(meta) => {
                    let successful = counters.successful.fetch_add(1, Ordering::Relaxed) + 1;
                    if successful % PROGRESS_EVERY == 0 {
                        debug!(
                            "Published {} messages (latest {}-{}@{})",
                            successful, meta.topic, meta.partition, meta.offset
                        );
                    }
                }
                Err(e) => {
                    counters.failed.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to publish message with key {}: {}", key, e);
                }
            }
        });
    }

    /// Waits for every publish started so far to complete
    pub async fn flush(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::MessageGenerator;

    #[tokio::test]
    async fn test_publish_counts_and_keys() {
        let bus = Arc::new(crate::bus::MemoryBus::new());
        let publisher = Publisher::new(bus.clone(), "accounts");
        let generator = MessageGenerator::new();

        for _ in 0..3 {
            publisher.publish(&generator.generate());
        }
        assert_eq!(publisher.counters().sent.load(Ordering::Relaxed), 3);
        publisher.flush().await;

        let stats = publisher.stats(true, 10);
        assert_eq!(stats.messages_successful, 3);
        assert_eq!(stats.messages_failed, 0);

        let records = bus.records("accounts");
        assert_eq!(records.len(), 3);
        let keys: std::collections::HashSet<_> =
            records.iter().map(|r| r.key.clone().unwrap()).collect();
        assert_eq!(keys.len(), 3);
        let decoded: AccountEvent = serde_json::from_slice(&records[0].value).unwrap();
        assert!(decoded.account_number.starts_with("ACC-"));
    }

    #[tokio::test]
    async fn test_failed_publish_is_counted() {
        let bus = Arc::new(crate::bus::MemoryBus::new());
        bus.fail_next(2);
        let publisher = Publisher::new(bus.clone(), "accounts");
        let generator = MessageGenerator::new();

        for _ in 0..3 {
            publisher.publish(&generator.generate());
        }
        publisher.flush().await;

        let stats = publisher.stats(false, 10);
        assert_eq!(stats.messages_sent, 3);
        assert_eq!(stats.messages_failed, 2);
        assert_eq!(stats.messages_successful, 1);
    }

    #[test]
    fn test_stats_json_shape() {
        let bus = Arc::new(crate::bus::MemoryBus::new());
        let publisher = Publisher::new(bus, "accounts");
        publisher.counters().sent.store(5, Ordering::Relaxed);
        let json = serde_json::to_value(publisher.stats(true, 25)).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["messagesPerSecond"], 25);
        assert_eq!(json["messagesSent"], 5);
        assert_eq!(json["topic"], "accounts");

        publisher.counters().reset();
        assert_eq!(publisher.stats(false, 25).messages_sent, 0);
    }
}

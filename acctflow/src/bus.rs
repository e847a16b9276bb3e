//! Message bus abstraction
//!
//! The producer side talks to a [`BusProducer`]; the Kafka implementation lives in
//! `kafka_bus`, and [`MemoryBus`] keeps everything in process for tests and dry runs.
//! Consumed messages arrive as [`BusMessage`] regardless of where they came from.

use crate::model::BusCoordinates;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    /// The request never got a usable answer from the broker
    #[error("bus transport failure: {0}")]
    Transport(String),

    /// The broker answered with a partition-level error code
    #[error("broker rejected record for {topic}-{partition} with error code {code}")]
    Broker {
        topic: String,
        partition: i32,
        code: i16,
    },

    #[error("failed to encode record: {0}")]
    Encode(String),

    /// The producer shut down before the record was sent
    #[error("bus producer is closed")]
    Closed,
}

/// A record to publish
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingRecord {
    pub topic: String,
    pub key: Option<String>,
    pub value: Bytes,
    pub headers: Vec<(String, Bytes)>,
    /// Creation time in epoch milliseconds
    pub timestamp: i64,
}

impl OutgoingRecord {
    pub fn new(topic: impl Into<String>, key: Option<String>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            key,
            value: value.into(),
            headers: Vec::new(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Approximate wire size, used for batch sizing
    pub fn encoded_len(&self) -> usize {
        let headers: usize = self
            .headers
            .iter()
            .map(|(name, value)| name.len() + value.len())
            .sum();
        self.key.as_ref().map_or(0, |k| k.len()) + self.value.len() + headers + 16
    }
}

/// Where a published record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A consumed record
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub headers: Vec<(String, Option<Bytes>)>,
    pub timestamp: i64,
}

impl BusMessage {
    pub fn coordinates(&self) -> BusCoordinates {
        BusCoordinates {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

#[async_trait]
pub trait BusProducer: Send + Sync {
    /// Publishes one record and resolves once the bus acknowledged or rejected it
    async fn send(&self, record: OutgoingRecord) -> Result<RecordMetadata, BusError>;
}

/// Kafka's murmur2 hash, as used by the default Java partitioner
pub fn murmur2(data: &[u8]) -> i32 {
    const SEED: u32 = 0x9747_b28c;
    const M: u32 = 0x5bd1_e995;
    const R: u32 = 24;

    let length = data.len();
    let mut h = SEED ^ (length as u32);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(M);
        k ^= k >> R;
        k = k.wrapping_mul(M);
        h = h.wrapping_mul(M);
        h ^= k;
    }

    let tail = chunks.remainder();
    if tail.len() >= 3 {
        h ^= u32::from(tail[2]) << 16;
    }
    if tail.len() >= 2 {
        h ^= u32::from(tail[1]) << 8;
    }
    if !tail.is_empty() {
        h ^= u32::from(tail[0]);
        h = h.wrapping_mul(M);
    }

    h ^= h >> 13;
    h = h.wrapping_mul(M);
    h ^= h >> 15;
    h as i32
}

/// Chooses a partition per record
///
/// Keyed records hash with murmur2 so the same key always lands on the same partition;
/// keyless records rotate across partitions.
#[derive(Debug, Default)]
pub struct Partitioner {
    next: AtomicU32,
}

impl Partitioner {
    pub fn partition(&self, key: Option<&[u8]>, partitions: i32) -> i32 {
        if partitions <= 1 {
            return 0;
        }
        match key {
            Some(key) => (murmur2(key) & 0x7fff_ffff) % partitions,
            None => (self.next.fetch_add(1, Ordering::Relaxed) % partitions as u32) as i32,
        }
    }
}

#[derive(Debug, Default)]
struct MemoryLog {
    records: HashMap<String, Vec<(RecordMetadata, OutgoingRecord)>>,
    fail_next: usize,
    fail_all: bool,
}

/// In-process bus that keeps every published record
#[derive(Debug, Default)]
pub struct MemoryBus {
    log: Mutex<MemoryLog>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects the next `count` sends
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut log) = self.log.lock() {
            log.fail_next = count;
        }
    }

    /// Rejects every send until switched off
    pub fn fail_all(&self, fail: bool) {
        if let Ok(mut log) = self.log.lock() {
            log.fail_all = fail;
        }
    }

    /// Records published to `topic`, in publish order
    pub fn records(&self, topic: &str) -> Vec<OutgoingRecord> {
        self.log
            .lock()
            .map(|log| {
                log.records
                    .get(topic)
                    .map(|entries| entries.iter().map(|(_, r)| r.clone()).collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Records published to `topic` as consumable messages
    pub fn messages(&self, topic: &str) -> Vec<BusMessage> {
        self.log
            .lock()
            .map(|log| {
                log.records
                    .get(topic)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|(meta, record)| BusMessage {
                                topic: meta.topic.clone(),
                                partition: meta.partition,
                                offset: meta.offset,
                                key: record.key.clone().map(Bytes::from),
                                value: Some(record.value.clone()),
                                headers: record
                                    .headers
                                    .iter()
                                    .map(|(n, v)| (n.clone(), Some(v.clone())))
                                    .collect(),
                                timestamp: record.timestamp,
                            })
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn send(&self, record: OutgoingRecord) -> Result<RecordMetadata, BusError> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| BusError::Transport("memory bus lock poisoned".to_string()))?;
        if log.fail_all || log.fail_next > 0 {
            log.fail_next = log.fail_next.saturating_sub(1);
            return Err(BusError::Transport(format!(
                "memory bus rejected record for {}",
                record.topic
            )));
        }
        let entries = log.records.entry(record.topic.clone()).or_default();
        let meta = RecordMetadata {
            topic: record.topic.clone(),
            partition: 0,
            offset: entries.len() as i64,
        };
        entries.push((meta.clone(), record));
        Ok(meta)
    }
}

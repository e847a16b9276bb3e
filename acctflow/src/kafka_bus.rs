//! Kafka-backed [`BusProducer`]
//!
//! `send` only enqueues. A single background flusher collects queued records for up to
//! `linger` (or until `batch_bytes` is reached), groups them per topic and partition,
//! and issues one Produce request per topic. Every caller gets its own result: the
//! broker-assigned offset or the error for its partition.

use crate::bus::{BusError, BusProducer, OutgoingRecord, Partitioner, RecordMetadata};
use crate::kafka_client::{error_name, KafkaClient};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use indexmap::IndexMap;
use kafka_protocol::messages::produce_request::{PartitionProduceData, ProduceRequest, TopicProduceData};
use kafka_protocol::messages::TopicName;
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Producer-side tuning
#[derive(Debug, Clone)]
pub struct KafkaBusConfig {
    /// 1 (leader) or -1 (all in-sync replicas)
    pub acks: i16,
    pub linger: Duration,
    pub batch_bytes: usize,
    /// Partition count used for topics without an explicit entry
    pub default_partitions: i32,
    pub topic_partitions: HashMap<String, i32>,
    pub request_timeout_ms: i32,
    pub queue_capacity: usize,
}

impl Default for KafkaBusConfig {
    fn default() -> Self {
        Self {
            acks: 1,
            linger: Duration::from_millis(5),
            batch_bytes: 16 * 1024,
            default_partitions: 1,
            topic_partitions: HashMap::new(),
            request_timeout_ms: 30000,
            queue_capacity: 10_000,
        }
    }
}

impl KafkaBusConfig {
    pub fn partitions_for(&self, topic: &str) -> i32 {
        self.topic_partitions
            .get(topic)
            .copied()
            .unwrap_or(self.default_partitions)
            .max(1)
    }
}

struct Pending {
    record: OutgoingRecord,
    partition: i32,
    reply: oneshot::Sender<Result<RecordMetadata, BusError>>,
}

pub struct KafkaBus {
    sender: mpsc::Sender<Pending>,
    partitioner: Partitioner,
    config: KafkaBusConfig,
    shutdown: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl KafkaBus {
    /// Starts the background flusher on the current runtime
    ///
    /// Fails for `acks = 0`, which gets no broker response over this client.
    pub fn start(client: Arc<KafkaClient>, config: KafkaBusConfig) -> Result<Self, BusError> {
        if config.acks != 1 && config.acks != -1 {
            return Err(BusError::Encode(format!(
                "unsupported acks setting {} (use 1 or -1)",
                config.acks
            )));
        }

        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let flusher = tokio::spawn(run_flusher(
            client,
            config.clone(),
            receiver,
            shutdown.clone(),
        ));

        info!(
            "Kafka producer started (acks={}, linger={:?}, batch_bytes={})",
            config.acks, config.linger, config.batch_bytes
        );
        Ok(Self {
            sender,
            partitioner: Partitioner::default(),
            config,
            shutdown,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    /// Flushes whatever is queued and stops the flusher
    pub async fn close(&self) {
        self.shutdown.cancel();
        if let Some(handle) = self.flusher.lock().await.take() {
            if let Err(e) = handle.await {
                error!("Kafka producer flusher ended abnormally: {}", e);
            }
        }
    }
}

#[async_trait]
impl BusProducer for KafkaBus {
    async fn send(&self, record: OutgoingRecord) -> Result<RecordMetadata, BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }
        let partitions = self.config.partitions_for(&record.topic);
        let partition = self
            .partitioner
            .partition(record.key.as_deref().map(str::as_bytes), partitions);

        let (reply, response) = oneshot::channel();
        self.sender
            .send(Pending {
                record,
                partition,
                reply,
            })
            .await
            .map_err(|_| BusError::Closed)?;
        response.await.map_err(|_| BusError::Closed)?
    }
}

async fn run_flusher(
    client: Arc<KafkaClient>,
    config: KafkaBusConfig,
    mut receiver: mpsc::Receiver<Pending>,
    shutdown: CancellationToken,
) {
    loop {
        // Queued records win over shutdown so nothing accepted is dropped
        let first = tokio::select! {
            biased;
            next = receiver.recv() => match next {
                Some(pending) => pending,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };

        let mut batch_bytes = first.record.encoded_len();
        let mut batch = vec![first];
        let deadline = Instant::now() + config.linger;
        while batch_bytes < config.batch_bytes {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(pending)) => {
                    batch_bytes += pending.record.encoded_len();
                    batch.push(pending);
                }
                Ok(None) | Err(_) => break,
            }
        }

        flush(&client, &config, batch).await;
    }

    receiver.close();
    let mut remaining = Vec::new();
    while let Ok(pending) = receiver.try_recv() {
        remaining.push(pending);
    }
    if !remaining.is_empty() {
        debug!("Flushing {} records on shutdown", remaining.len());
        flush(&client, &config, remaining).await;
    }
    debug!("Kafka producer flusher stopped");
}

/// Sends one batch: one Produce request per topic, one record batch per partition
async fn flush(client: &KafkaClient, config: &KafkaBusConfig, batch: Vec<Pending>) {
    let mut by_topic: IndexMap<String, BTreeMap<i32, Vec<Pending>>> = IndexMap::new();
    for pending in batch {
        by_topic
            .entry(pending.record.topic.clone())
            .or_default()
            .entry(pending.partition)
            .or_default()
            .push(pending);
    }

    for (topic, partitions) in by_topic {
        produce_topic(client, config, &topic, partitions).await;
    }
}

async fn produce_topic(
    client: &KafkaClient,
    config: &KafkaBusConfig,
    topic: &str,
    partitions: BTreeMap<i32, Vec<Pending>>,
) {
    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };

    let mut topic_data = TopicProduceData::default();
    topic_data.name = TopicName(StrBytes::from_string(topic.to_string()));

    let mut in_flight: BTreeMap<i32, Vec<Pending>> = BTreeMap::new();
    for (partition, pendings) in partitions {
        let records: Vec<Record> = pendings
            .iter()
            .enumerate()
            .map(|(idx, p)| to_record(&p.record, idx as i64))
            .collect();
        let mut batch_buf = BytesMut::new();
        if let Err(e) = RecordBatchEncoder::encode(
            &mut batch_buf,
            records.iter().collect::<Vec<_>>(),
            &options,
        ) {
            error!("Failed to encode record batch for {}-{}: {}", topic, partition, e);
            fail_all(pendings, BusError::Encode(e.to_string()));
            continue;
        }

        let mut partition_data = PartitionProduceData::default();
        partition_data.index = partition;
        partition_data.records = Some(batch_buf.freeze());
        topic_data.partition_data.push(partition_data);
        in_flight.insert(partition, pendings);
    }

    if in_flight.is_empty() {
        return;
    }

    let mut request = ProduceRequest::default();
    request.acks = config.acks;
    request.timeout_ms = config.request_timeout_ms;
    request.topic_data.push(topic_data);

    let response = match client.produce(&request).await {
        Ok(response) => response,
        Err(e) => {
            error!("Produce request to '{}' failed: {}", topic, e);
            for (_, pendings) in in_flight {
                fail_all(pendings, BusError::Transport(e.to_string()));
            }
            return;
        }
    };

    // The request carried a single topic, so every partition response belongs to it
    let mut results: HashMap<i32, (i16, i64)> = HashMap::new();
    for topic_response in &response.responses {
        for partition_response in &topic_response.partition_responses {
            results.insert(
                partition_response.index,
                (partition_response.error_code, partition_response.base_offset),
            );
        }
    }

    for (partition, pendings) in in_flight {
        match results.get(&partition) {
            Some((0, base_offset)) => {
                for (idx, pending) in pendings.into_iter().enumerate() {
                    let _ = pending.reply.send(Ok(RecordMetadata {
                        topic: topic.to_string(),
                        partition,
                        offset: base_offset + idx as i64,
                    }));
                }
            }
            Some((code, _)) => {
                warn!(
                    "Broker rejected batch for {}-{}: {}",
                    topic,
                    partition,
                    error_name(*code)
                );
                fail_all(
                    pendings,
                    BusError::Broker {
                        topic: topic.to_string(),
                        partition,
                        code: *code,
                    },
                );
            }
            None => fail_all(
                pendings,
                BusError::Transport(format!(
                    "no produce response for {}-{}",
                    topic, partition
                )),
            ),
        }
    }
}

/// Converts an outgoing record; `offset` is its position within the batch
fn to_record(record: &OutgoingRecord, offset: i64) -> Record {
    let mut headers = IndexMap::new();
    for (name, value) in &record.headers {
        headers.insert(StrBytes::from_string(name.clone()), Some(value.clone()));
    }

    // Non-idempotent producer: no producer id, epoch or sequence; the broker assigns offsets
    Record {
        transactional: false,
        control: false,
        partition_leader_epoch: 0,
        producer_id: -1,
        producer_epoch: -1,
        timestamp_type: TimestampType::Creation,
        offset,
        sequence: -1,
        timestamp: record.timestamp,
        key: record.key.as_ref().map(|k| Bytes::from(k.clone())),
        value: Some(record.value.clone()),
        headers,
    }
}

fn fail_all(pendings: Vec<Pending>, err: BusError) {
    for pending in pendings {
        let _ = pending.reply.send(Err(err.clone()));
    }
}

//! Partition-lane consumer
//!
//! A lane owns the partitions `p` of the account topic with `p % lanes == lane` and
//! drives each fetched message through the [`MessageProcessor`] one at a time. After a
//! message reaches a terminal disposition its offset is committed to the transaction
//! store, so a restarted lane resumes right after the last finished message. A message
//! abandoned by shutdown is left uncommitted and will be redelivered.

use crate::bus::BusMessage;
use crate::kafka_client::{error_codes, error_name, KafkaClient};
use crate::processor::MessageProcessor;
use crate::store::TransactionStore;
use anyhow::{anyhow, Result};
use bytes::Bytes;
use kafka_protocol::messages::fetch_request::{FetchPartition, FetchRequest, FetchTopic};
use kafka_protocol::messages::fetch_response::PartitionData;
use kafka_protocol::messages::TopicName;
use kafka_protocol::protocol::StrBytes;
use kafka_protocol::records::{Record, RecordBatchDecoder};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause after a failed fetch or a partition-level broker error
const ERROR_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub topic: String,
    /// Partition count of `topic`
    pub partitions: i32,
    pub lane: usize,
    pub lanes: usize,
    /// How long the broker may hold a fetch open when no data is available
    pub max_wait_ms: i32,
    pub partition_max_bytes: i32,
}

impl LaneConfig {
    pub fn new(topic: impl Into<String>, partitions: i32, lane: usize, lanes: usize) -> Self {
        Self {
            topic: topic.into(),
            partitions,
            lane,
            lanes,
            max_wait_ms: 500,
            partition_max_bytes: 1024 * 1024,
        }
    }
}

/// Partitions owned by `lane` out of `lanes`
pub fn lane_partitions(lane: usize, lanes: usize, partitions: i32) -> Vec<i32> {
    if lanes == 0 {
        return Vec::new();
    }
    (0..partitions.max(0))
        .filter(|p| *p as usize % lanes == lane)
        .collect()
}

/// Sequential consumer for one lane
pub struct PartitionLane {
    client: Arc<KafkaClient>,
    store: Arc<dyn TransactionStore>,
    processor: Arc<MessageProcessor>,
    config: LaneConfig,
    shutdown: CancellationToken,
}

impl PartitionLane {
    pub fn new(
        client: Arc<KafkaClient>,
        store: Arc<dyn TransactionStore>,
        processor: Arc<MessageProcessor>,
        config: LaneConfig,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            client,
            store,
            processor,
            config,
            shutdown,
        }
    }

    /// Consumes until shutdown
    ///
    /// # Returns
    /// * `Ok(())` - Shutdown was requested
    /// * `Err(anyhow::Error)` - The transaction store failed; the lane cannot continue
    ///   without losing its audit trail
    pub async fn run(&self) -> Result<()> {
        let owned = lane_partitions(self.config.lane, self.config.lanes, self.config.partitions);
        if owned.is_empty() {
            warn!(
                "Lane {} owns no partitions of {} ({} partitions, {} lanes)",
                self.config.lane, self.config.topic, self.config.partitions, self.config.lanes
            );
            return Ok(());
        }

        let mut offsets = BTreeMap::new();
        for partition in &owned {
            let start = self
                .store
                .committed_offset(&self.config.topic, *partition)
                .await?
                .unwrap_or(0);
            offsets.insert(*partition, start);
        }
        info!(
            "Lane {} consuming {} partitions {:?} from offsets {:?}",
            self.config.lane, self.config.topic, owned, offsets
        );

        while !self.shutdown.is_cancelled() {
            let request = self.fetch_request(&offsets);
            let response = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                response = self.client.fetch(&request) => response,
            };

            let response = match response {
                Ok(response) => response,
                Err(e) => {
                    warn!("Lane {}: fetch failed: {}", self.config.lane, e);
                    self.pause().await;
                    continue;
                }
            };

            let mut pause = false;
            for topic_response in &response.responses {
                for partition_data in &topic_response.partitions {
                    if !self.handle_partition(partition_data, &mut offsets).await? {
                        pause = true;
                    }
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                }
            }
            if pause {
                self.pause().await;
            }
        }

        info!("Lane {} stopped at offsets {:?}", self.config.lane, offsets);
        Ok(())
    }

    /// Processes one partition of a fetch response
    ///
    /// Returns `false` when the partition reported an error that calls for a pause.
    async fn handle_partition(
        &self,
        data: &PartitionData,
        offsets: &mut BTreeMap<i32, i64>,
    ) -> Result<bool> {
        let partition = data.partition_index;
        let Some(fetch_offset) = offsets.get(&partition).copied() else {
            debug!("Ignoring unrequested partition {}", partition);
            return Ok(true);
        };

        match data.error_code {
            error_codes::NONE => {}
            error_codes::OFFSET_OUT_OF_RANGE => {
                let reset = data.log_start_offset.max(0);
                warn!(
                    "Offset {} out of range on {}-{}, resetting to log start {}",
                    fetch_offset, self.config.topic, partition, reset
                );
                offsets.insert(partition, reset);
                return Ok(true);
            }
            code => {
                warn!(
                    "Fetch error on {}-{}: {}",
                    self.config.topic,
                    partition,
                    error_name(code)
                );
                return Ok(false);
            }
        }

        let Some(bytes) = data.records.as_ref().filter(|b| !b.is_empty()) else {
            return Ok(true);
        };

        let records = match decode_records(bytes) {
            Ok(records) => records,
            Err(e) => {
                error!(
                    "Failed to decode records of {}-{} at offset {}: {}",
                    self.config.topic, partition, fetch_offset, e
                );
                return Ok(false);
            }
        };

        for record in records {
            // Batches can start before the requested offset
            if record.offset < fetch_offset {
                continue;
            }
            if self.shutdown.is_cancelled() {
                break;
            }
            let message = to_message(&self.config.topic, partition, record);
            let disposition = self.processor.process(&message).await?;
            if !disposition.is_terminal() {
                // Abandoned during shutdown; redelivered on restart
                break;
            }
            let next = message.offset + 1;
            self.store
                .commit(&self.config.topic, partition, next)
                .await?;
            offsets.insert(partition, next);
        }
        Ok(true)
    }

    fn fetch_request(&self, offsets: &BTreeMap<i32, i64>) -> FetchRequest {
        let mut fetch_partitions = Vec::with_capacity(offsets.len());
        for (partition, offset) in offsets {
            let mut fetch_partition = FetchPartition::default();
            fetch_partition.partition = *partition;
            fetch_partition.current_leader_epoch = -1;
            fetch_partition.fetch_offset = *offset;
            fetch_partition.log_start_offset = -1;
            fetch_partition.partition_max_bytes = self.config.partition_max_bytes;
            fetch_partitions.push(fetch_partition);
        }

        let mut fetch_topic = FetchTopic::default();
        fetch_topic.topic = TopicName(StrBytes::from_string(self.config.topic.clone()));
        fetch_topic.partitions = fetch_partitions;

        let mut request = FetchRequest::default();
        request.max_wait_ms = self.config.max_wait_ms;
        request.min_bytes = 1;
        request.max_bytes = 50 * 1024 * 1024;
        request.isolation_level = 0;
        request.session_id = 0;
        request.session_epoch = -1;
        request.topics.push(fetch_topic);
        request.rack_id = StrBytes::from_static_str("");
        request
    }

    async fn pause(&self) {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(ERROR_PAUSE) => {}
        }
    }
}

/// Decodes every complete record batch in a fetched record set
///
/// Brokers may cut the last batch short at the partition byte limit; a trailing batch
/// that fails to decode after at least one good batch is dropped and fetched again
/// from the next offset.
fn decode_records(bytes: &Bytes) -> Result<Vec<Record>> {
    let mut cursor = std::io::Cursor::new(bytes.as_ref());
    let mut records = Vec::new();
    while (cursor.position() as usize) < bytes.len() {
        match RecordBatchDecoder::decode(&mut cursor) {
            Ok(record_set) => records.extend(record_set.records),
            Err(e) if records.is_empty() => {
                return Err(anyhow!("undecodable record batch: {}", e));
            }
            Err(e) => {
                debug!("Dropping partial trailing batch: {}", e);
                break;
            }
        }
    }
    Ok(records)
}

fn to_message(topic: &str, partition: i32, record: Record) -> BusMessage {
    BusMessage {
        topic: topic.to_string(),
        partition,
        offset: record.offset,
        key: record.key,
        value: record.value,
        headers: record
            .headers
            .into_iter()
            .map(|(name, value)| (name.as_str().to_string(), value))
            .collect(),
        timestamp: record.timestamp,
    }
}

//! Kafka Client Implementation
//!
//! A low-level client that speaks the Kafka wire protocol to a single broker over one
//! TCP connection. It negotiates API versions on connect, frames requests with the
//! 4-byte length prefix, and offers typed helpers for the calls the pipeline needs:
//! Produce, Fetch and CreateTopics.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use kafka_protocol::{
    messages::{
        api_versions_request::ApiVersionsRequest,
        api_versions_response::ApiVersionsResponse,
        create_topics_request::{CreatableTopic, CreateTopicsRequest},
        create_topics_response::CreateTopicsResponse,
        fetch_request::FetchRequest,
        fetch_response::FetchResponse,
        produce_request::ProduceRequest,
        produce_response::ProduceResponse,
        ApiKey, RequestHeader, ResponseHeader, TopicName,
    },
    protocol::{Decodable, Encodable, StrBytes},
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::{sleep, Duration},
};
use tracing::{debug, info, warn};

/// Client id sent in every request header
const CLIENT_ID: &str = "acctflow";

/// Largest response frame accepted from the broker
const MAX_RESPONSE_BYTES: usize = 100 * 1024 * 1024;

/// Preferred Produce version (record batch v2, no tagged fields)
pub const PRODUCE_VERSION: i16 = 3;

/// Preferred Fetch version (record batch v2, log start offset in responses)
pub const FETCH_VERSION: i16 = 5;

/// Kafka error codes the pipeline reacts to
pub mod error_codes {
    pub const NONE: i16 = 0;
    pub const OFFSET_OUT_OF_RANGE: i16 = 1;
    pub const UNKNOWN_TOPIC_OR_PARTITION: i16 = 3;
    pub const LEADER_NOT_AVAILABLE: i16 = 5;
    pub const NOT_LEADER_OR_FOLLOWER: i16 = 6;
    pub const REQUEST_TIMED_OUT: i16 = 7;
    pub const TOPIC_ALREADY_EXISTS: i16 = 36;
}

/// Human-readable name for a Kafka error code
pub fn error_name(code: i16) -> String {
    match code {
        0 => "NONE".to_string(),
        1 => "OFFSET_OUT_OF_RANGE".to_string(),
        2 => "CORRUPT_MESSAGE".to_string(),
        3 => "UNKNOWN_TOPIC_OR_PARTITION".to_string(),
        5 => "LEADER_NOT_AVAILABLE".to_string(),
        6 => "NOT_LEADER_OR_FOLLOWER".to_string(),
        7 => "REQUEST_TIMED_OUT".to_string(),
        10 => "MESSAGE_TOO_LARGE".to_string(),
        19 => "NOT_ENOUGH_REPLICAS".to_string(),
        29 => "TOPIC_AUTHORIZATION_FAILED".to_string(),
        36 => "TOPIC_ALREADY_EXISTS".to_string(),
        37 => "INVALID_PARTITIONS".to_string(),
        38 => "INVALID_REPLICATION_FACTOR".to_string(),
        41 => "NOT_CONTROLLER".to_string(),
        _ => format!("UNKNOWN_ERROR_{}", code),
    }
}

/// Low-level Kafka client for direct broker communication
///
/// One TCP connection, guarded by a mutex so concurrent callers are serialized:
/// exactly one request is in flight at a time and each response is read by the
/// task that sent the request.
pub struct KafkaClient {
    /// Exclusive access to the broker connection
    stream: Mutex<TcpStream>,

    /// Monotonically increasing correlation ID for request/response matching
    correlation_id: AtomicU64,

    /// Supported API versions discovered from the broker
    /// Maps API key (i16) to (min_version, max_version)
    pub api_versions: HashMap<i16, (i16, i16)>,
}

impl KafkaClient {
    /// Establishes a connection to a Kafka broker and discovers supported API versions
    ///
    /// # Arguments
    /// * `broker` - Broker address in "host:port" format (e.g., "localhost:9092")
    ///
    /// # Returns
    /// * `Ok(KafkaClient)` - Fully initialized client ready for operations
    /// * `Err(anyhow::Error)` - If connection or version discovery fails
    pub async fn connect(broker: &str) -> Result<Self> {
        info!("Connecting to Kafka broker at {}", broker);

        let stream = Self::connect_with_retry(broker).await?;

        info!("Successfully connected to Kafka broker");

        let mut client = KafkaClient {
            stream: Mutex::new(stream),
            correlation_id: AtomicU64::new(1),
            api_versions: HashMap::new(),
        };

        client.discover_api_versions().await?;

        Ok(client)
    }

    /// Establishes a connection using pre-discovered API versions
    ///
    /// Skips the ApiVersions handshake; used when a second connection to the same
    /// broker is opened (the consumer lanes each own one).
    pub async fn connect_with_versions(
        broker: &str,
        api_versions: HashMap<i16, (i16, i16)>,
    ) -> Result<Self> {
        debug!(
            "Connecting to Kafka broker at {} (using pre-discovered API versions)",
            broker
        );

        let stream = TcpStream::connect(broker)
            .await
            .map_err(|e| anyhow!("Failed to connect to Kafka broker at {}: {}", broker, e))?;

        Ok(KafkaClient {
            stream: Mutex::new(stream),
            correlation_id: AtomicU64::new(1),
            api_versions,
        })
    }

    /// Attempts to establish TCP connection with retry mechanism
    ///
    /// Retries connection every 1 second for up to 10 attempts
    async fn connect_with_retry(broker: &str) -> Result<TcpStream> {
        let max_attempts = 10;
        let retry_interval = Duration::from_secs(1);
        let mut attempt = 1;

        loop {
            match TcpStream::connect(broker).await {
                Ok(stream) => {
                    if attempt > 1 {
                        info!(
                            "Successfully connected to Kafka broker on attempt {}",
                            attempt
                        );
                    }
                    return Ok(stream);
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(anyhow!(
                        "Failed to connect to Kafka broker at {} after {} attempts: {}",
                        broker,
                        max_attempts,
                        e
                    ));
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {} failed, retrying in 1 second: {}",
                        attempt, e
                    );
                    sleep(retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Sends a Kafka protocol request and returns the raw response bytes
    ///
    /// Handles the complete request/response cycle:
    /// 1. Assigns a correlation ID
    /// 2. Encodes request header and body for the negotiated version
    /// 3. Writes the length-prefixed frame
    /// 4. Reads the length-prefixed response frame
    ///
    /// The returned bytes still start with the response header; see [`decode_response`].
    pub async fn send_request<T: Encodable + std::fmt::Debug>(
        &self,
        api_key: ApiKey,
        request: &T,
        version: i16,
    ) -> Result<Bytes> {
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst) as i32;

        debug!(
            "Sending {:?} request (correlation_id: {}, version: {})",
            api_key, correlation_id, version
        );

        let mut header = RequestHeader::default();
        header.request_api_key = api_key as i16;
        header.request_api_version = version;
        header.correlation_id = correlation_id;
        header.client_id = Some(StrBytes::from_static_str(CLIENT_ID));

        // Flexible versions use header v2 with tagged fields
        let header_version = api_key.request_header_version(version);

        let mut buf = Vec::new();
        header
            .encode(&mut buf, header_version)
            .map_err(|e| anyhow!("Failed to encode request header: {}", e))?;
        request
            .encode(&mut buf, version)
            .map_err(|e| anyhow!("Failed to encode request body: {}", e))?;

        let mut message = Vec::with_capacity(4 + buf.len());
        message.extend_from_slice(&(buf.len() as i32).to_be_bytes());
        message.extend_from_slice(&buf);

        let mut stream = self.stream.lock().await;
        stream
            .write_all(&message)
            .await
            .map_err(|e| anyhow!("Failed to write request to stream: {}", e))?;

        let mut size_buf = [0u8; 4];
        stream.read_exact(&mut size_buf).await.map_err(|e| {
            anyhow!(
                "Failed to read response size: {} (this could indicate the broker closed the connection)",
                e
            )
        })?;

        let response_size = i32::from_be_bytes(size_buf);
        if response_size < 0 || response_size as usize > MAX_RESPONSE_BYTES {
            return Err(anyhow!("Invalid response size: {} bytes", response_size));
        }

        let mut response_buf = vec![0u8; response_size as usize];
        stream
            .read_exact(&mut response_buf)
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        debug!(
            "Received {} byte response for correlation_id {}",
            response_size, correlation_id
        );
        Ok(Bytes::from(response_buf))
    }

    /// Discovers and caches the broker's supported API versions
    async fn discover_api_versions(&mut self) -> Result<()> {
        debug!("Discovering supported API versions...");

        // Version 0 is understood by every broker
        let request = ApiVersionsRequest::default();
        let response_bytes = self.send_request(ApiKey::ApiVersions, &request, 0).await?;
        let response: ApiVersionsResponse =
            decode_response(ApiKey::ApiVersions, &response_bytes, 0)?;

        if response.error_code != error_codes::NONE {
            return Err(anyhow!(
                "ApiVersions request failed: {}",
                error_name(response.error_code)
            ));
        }

        for api_version in response.api_keys {
            self.api_versions.insert(
                api_version.api_key,
                (api_version.min_version, api_version.max_version),
            );
            if let Ok(api_key) = ApiKey::try_from(api_version.api_key) {
                debug!(
                    "API {:?}: versions {}-{}",
                    api_key, api_version.min_version, api_version.max_version
                );
            }
        }

        debug!("Discovered {} supported APIs", self.api_versions.len());
        Ok(())
    }

    /// Selects a compatible protocol version for the given API
    ///
    /// 1. If the preferred version is within the broker's range, use it
    /// 2. If it is outside the range, use the broker's maximum
    /// 3. If the API wasn't discovered, fall back to the preferred version
    pub fn get_supported_version(&self, api_key: ApiKey, preferred_version: i16) -> i16 {
        if let Some((min_version, max_version)) = self.api_versions.get(&(api_key as i16)) {
            if preferred_version >= *min_version && preferred_version <= *max_version {
                preferred_version
            } else {
                debug!(
                    "Preferred version {} for {:?} not supported (range: {}-{}), using {}",
                    preferred_version, api_key, min_version, max_version, max_version
                );
                *max_version
            }
        } else {
            warn!(
                "API {:?} not found in version discovery, using version {}",
                api_key, preferred_version
            );
            preferred_version
        }
    }

    /// Sends a Produce request and decodes the response
    ///
    /// Callers must not use `acks = 0`: the broker sends no response for it and this
    /// call would wait for one.
    pub async fn produce(&self, request: &ProduceRequest) -> Result<ProduceResponse> {
        let version = self.get_supported_version(ApiKey::Produce, PRODUCE_VERSION);
        let response_bytes = self
            .send_request(ApiKey::Produce, request, version)
            .await?;
        decode_response(ApiKey::Produce, &response_bytes, version)
    }

    /// Sends a Fetch request and decodes the response
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        let version = self.get_supported_version(ApiKey::Fetch, FETCH_VERSION);
        let response_bytes = self.send_request(ApiKey::Fetch, request, version).await?;
        decode_response(ApiKey::Fetch, &response_bytes, version)
    }

    /// Creates a topic, treating "already exists" as success
    ///
    /// # Arguments
    /// * `topic` - Name of the topic to create
    /// * `partitions` - Number of partitions
    /// * `replication_factor` - Number of replicas for each partition
    ///
    /// # Returns
    /// * `Ok(true)` - Topic was created
    /// * `Ok(false)` - Topic already existed
    /// * `Err(anyhow::Error)` - Request failed or the broker rejected the topic
    pub async fn create_topic(
        &self,
        topic: &str,
        partitions: i32,
        replication_factor: i16,
    ) -> Result<bool> {
        debug!("Creating topic '{}' with {} partitions", topic, partitions);

        let mut creatable_topic = CreatableTopic::default();
        creatable_topic.name = TopicName(StrBytes::from_string(topic.to_string()));
        creatable_topic.num_partitions = partitions;
        creatable_topic.replication_factor = replication_factor;

        let mut request = CreateTopicsRequest::default();
        request.topics.push(creatable_topic);
        request.timeout_ms = 30000;

        let version = self.get_supported_version(ApiKey::CreateTopics, 1);
        let response_bytes = self
            .send_request(ApiKey::CreateTopics, &request, version)
            .await
            .map_err(|e| anyhow!("Failed to create topic '{}': {}", topic, e))?;
        let response: CreateTopicsResponse =
            decode_response(ApiKey::CreateTopics, &response_bytes, version)?;

        for result in response.topics {
            if result.name.0.as_str() != topic {
                continue;
            }
            return match result.error_code {
                error_codes::NONE => {
                    info!(
                        "Successfully created topic '{}' with {} partitions",
                        topic, partitions
                    );
                    Ok(true)
                }
                error_codes::TOPIC_ALREADY_EXISTS => {
                    info!("Topic '{}' already exists", topic);
                    Ok(false)
                }
                code => Err(anyhow!(
                    "Failed to create topic '{}': {}",
                    topic,
                    error_name(code)
                )),
            };
        }

        Err(anyhow!("Topic '{}' missing from CreateTopics response", topic))
    }
}

/// Decodes a response frame: response header first, then the body for `version`
pub fn decode_response<T: Decodable>(api_key: ApiKey, bytes: &Bytes, version: i16) -> Result<T> {
    let mut cursor = std::io::Cursor::new(bytes.as_ref());

    let header_version = api_key.response_header_version(version);
    let _response_header = ResponseHeader::decode(&mut cursor, header_version).map_err(|e| {
        anyhow!(
            "Failed to decode {:?} response header (v{}, {} bytes): {}",
            api_key,
            header_version,
            bytes.len(),
            e
        )
    })?;

    T::decode(&mut cursor, version)
        .map_err(|e| anyhow!("Failed to decode {:?} v{} response: {}", api_key, version, e))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use kafka_protocol::messages::api_versions_response::ApiVersion;
    use tokio::net::TcpListener;

    /// Reads one request frame; returns (api_key, api_version, correlation_id, frame body)
    pub(crate) async fn read_frame(stream: &mut TcpStream) -> Option<(i16, i16, i32, Bytes)> {
        let mut size = [0u8; 4];
        stream.read_exact(&mut size).await.ok()?;
        let mut body = vec![0u8; i32::from_be_bytes(size) as usize];
        stream.read_exact(&mut body).await.ok()?;
        let api_key = i16::from_be_bytes([body[0], body[1]]);
        let api_version = i16::from_be_bytes([body[2], body[3]]);
        let correlation_id = i32::from_be_bytes([body[4], body[5], body[6], body[7]]);
        Some((api_key, api_version, correlation_id, Bytes::from(body)))
    }

    /// Writes a response frame with header and body encoded for `version`
    pub(crate) async fn write_response<T: Encodable>(
        stream: &mut TcpStream,
        api_key: ApiKey,
        version: i16,
        correlation_id: i32,
        body: &T,
    ) {
        let mut header = ResponseHeader::default();
        header.correlation_id = correlation_id;
        let mut buf = Vec::new();
        header
            .encode(&mut buf, api_key.response_header_version(version))
            .unwrap();
        body.encode(&mut buf, version).unwrap();
        let mut frame = (buf.len() as i32).to_be_bytes().to_vec();
        frame.extend_from_slice(&buf);
        stream.write_all(&frame).await.unwrap();
    }

    pub(crate) fn api_versions_response() -> ApiVersionsResponse {
        let mut response = ApiVersionsResponse::default();
        for (key, min, max) in [
            (ApiKey::Produce, 0, 9),
            (ApiKey::Fetch, 0, 12),
            (ApiKey::CreateTopics, 0, 7),
        ] {
            let mut version = ApiVersion::default();
            version.api_key = key as i16;
            version.min_version = min;
            version.max_version = max;
            response.api_keys.push(version);
        }
        response
    }

    #[test]
    fn test_error_names() {
        assert_eq!(error_name(0), "NONE");
        assert_eq!(error_name(1), "OFFSET_OUT_OF_RANGE");
        assert_eq!(error_name(36), "TOPIC_ALREADY_EXISTS");
        assert_eq!(error_name(999), "UNKNOWN_ERROR_999");
    }

    #[test]
    fn test_request_header_encoding() {
        let mut header = RequestHeader::default();
        header.request_api_key = ApiKey::Produce as i16;
        header.request_api_version = PRODUCE_VERSION;
        header.correlation_id = 77;
        header.client_id = Some(StrBytes::from_static_str(CLIENT_ID));

        let mut buf = Vec::new();
        header
            .encode(&mut buf, ApiKey::Produce.request_header_version(PRODUCE_VERSION))
            .unwrap();

        // api_key, api_version, correlation_id, then the length-prefixed client id
        assert_eq!(&buf[0..2], &0i16.to_be_bytes());
        assert_eq!(&buf[2..4], &PRODUCE_VERSION.to_be_bytes());
        assert_eq!(&buf[4..8], &77i32.to_be_bytes());
        assert_eq!(&buf[8..10], &(CLIENT_ID.len() as i16).to_be_bytes());
        assert_eq!(&buf[10..], CLIENT_ID.as_bytes());
    }

    #[test]
    fn test_create_topics_request_encoding() {
        let mut creatable_topic = CreatableTopic::default();
        creatable_topic.name = TopicName(StrBytes::from_string("accounts".to_string()));
        creatable_topic.num_partitions = 3;
        creatable_topic.replication_factor = 1;
        let mut request = CreateTopicsRequest::default();
        request.topics.push(creatable_topic);
        request.timeout_ms = 30000;

        let mut buf = Vec::new();
        request.encode(&mut buf, 1).unwrap();
        assert!(!buf.is_empty());
    }

    #[tokio::test]
    async fn test_connect_negotiates_versions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (api_key, _, correlation_id, _) = read_frame(&mut stream).await.unwrap();
            assert_eq!(api_key, ApiKey::ApiVersions as i16);
            write_response(
                &mut stream,
                ApiKey::ApiVersions,
                0,
                correlation_id,
                &api_versions_response(),
            )
            .await;
        });

        let client = KafkaClient::connect(&addr.to_string()).await.unwrap();
        assert_eq!(client.get_supported_version(ApiKey::Produce, 3), 3);
        assert_eq!(client.get_supported_version(ApiKey::Produce, 11), 9);
        assert_eq!(client.get_supported_version(ApiKey::Fetch, FETCH_VERSION), 5);
        // Not advertised: fall back to the preferred version
        assert_eq!(client.get_supported_version(ApiKey::Metadata, 1), 1);
    }

    #[tokio::test]
    async fn test_oversized_response_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_frame(&mut stream).await;
            stream
                .write_all(&((MAX_RESPONSE_BYTES as i32) + 1).to_be_bytes())
                .await
                .unwrap();
        });

        let client = KafkaClient::connect_with_versions(&addr.to_string(), HashMap::new())
            .await
            .unwrap();
        let err = client
            .send_request(ApiKey::ApiVersions, &ApiVersionsRequest::default(), 0)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid response size"));
    }
}

//! Bus enqueue-time extraction
//!
//! Brokers and bridges stamp the enqueue time under different header names and in
//! different encodings. Extraction walks an ordered list of header names and, for each
//! header present, an ordered list of decoders. The first decoded instant wins; when
//! nothing decodes the result is an explicit [`EnqueueTime::Absent`].

use crate::model::parse_instant;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

/// Header names probed for the enqueue time, in priority order
pub const ENQUEUE_TIME_HEADERS: [&str; 3] =
    ["x-opt-enqueued-time", "enqueuedTime", "x-opt-enqueued-time-utc"];

/// Outcome of enqueue-time extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueTime {
    /// Decoded from the named header
    Header {
        name: &'static str,
        at: DateTime<Utc>,
    },
    /// No candidate header was present or decodable
    Absent,
}

impl EnqueueTime {
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            EnqueueTime::Header { at, .. } => Some(*at),
            EnqueueTime::Absent => None,
        }
    }
}

type Decoder = fn(&[u8]) -> Option<DateTime<Utc>>;

/// Decoders tried against a header value, in order
const DECODERS: [(&str, Decoder); 2] = [("binary-millis", decode_binary_millis), ("text", decode_text)];

/// 8-byte big-endian epoch milliseconds
fn decode_binary_millis(value: &[u8]) -> Option<DateTime<Utc>> {
    let raw: [u8; 8] = value.try_into().ok()?;
    Utc.timestamp_millis_opt(i64::from_be_bytes(raw)).single()
}

/// Numeric epoch-millis string or ISO-8601 text
fn decode_text(value: &[u8]) -> Option<DateTime<Utc>> {
    std::str::from_utf8(value).ok().and_then(parse_instant)
}

/// Extracts the enqueue time from message headers
///
/// Header lookup is by exact name; when a name repeats, the last occurrence is used.
pub fn extract_enqueue_time(headers: &[(String, Option<Bytes>)]) -> EnqueueTime {
    for name in ENQUEUE_TIME_HEADERS {
        let Some((_, value)) = headers.iter().rev().find(|(key, _)| key == name) else {
            continue;
        };
        let Some(value) = value.as_ref().filter(|v| !v.is_empty()) else {
            debug!("Header '{}' present without a value", name);
            continue;
        };

        for (decoder_name, decode) in DECODERS {
            if let Some(at) = decode(value) {
                debug!("Enqueue time {} read from header '{}' ({})", at, name, decoder_name);
                return EnqueueTime::Header { name, at };
            }
        }
        warn!(
            "Failed to parse header '{}' ({} bytes) as an enqueue time, trying next header",
            name,
            value.len()
        );
    }

    debug!(
        "No enqueue time header found among {:?} ({} headers on message)",
        ENQUEUE_TIME_HEADERS,
        headers.len()
    );
    EnqueueTime::Absent
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(name: &str, value: &[u8]) -> (String, Option<Bytes>) {
        (name.to_string(), Some(Bytes::copy_from_slice(value)))
    }

    #[test]
    fn test_binary_millis_header() {
        let millis: i64 = 1_700_000_000_123;
        let headers = vec![header("x-opt-enqueued-time", &millis.to_be_bytes())];
        let result = extract_enqueue_time(&headers);
        assert_eq!(
            result,
            EnqueueTime::Header {
                name: "x-opt-enqueued-time",
                at: Utc.timestamp_millis_opt(millis).unwrap(),
            }
        );
    }

    #[test]
    fn test_numeric_string_header() {
        let headers = vec![header("enqueuedTime", b" 1700000000123 ")];
        let at = extract_enqueue_time(&headers).timestamp().unwrap();
        assert_eq!(at.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_iso_header() {
        let headers = vec![header("x-opt-enqueued-time-utc", b"2023-11-14T22:13:20.123Z")];
        let at = extract_enqueue_time(&headers).timestamp().unwrap();
        assert_eq!(at.timestamp_millis(), 1_700_000_000_123);
    }

    #[test]
    fn test_unparseable_header_falls_through_to_next_name() {
        let headers = vec![
            header("x-opt-enqueued-time", b"not a time"),
            header("x-opt-enqueued-time-utc", b"2023-11-14T22:13:20Z"),
        ];
        match extract_enqueue_time(&headers) {
            EnqueueTime::Header { name, .. } => assert_eq!(name, "x-opt-enqueued-time-utc"),
            EnqueueTime::Absent => panic!("expected the utc header to be used"),
        }
    }

    #[test]
    fn test_priority_order_wins_over_header_position() {
        let headers = vec![
            header("enqueuedTime", b"1000"),
            header("x-opt-enqueued-time", b"2000"),
        ];
        match extract_enqueue_time(&headers) {
            EnqueueTime::Header { name, at } => {
                assert_eq!(name, "x-opt-enqueued-time");
                assert_eq!(at.timestamp_millis(), 2000);
            }
            EnqueueTime::Absent => panic!("expected a header match"),
        }
    }

    #[test]
    fn test_repeated_header_uses_last_value() {
        let headers = vec![
            header("enqueuedTime", b"1000"),
            header("traceparent", b"00-abc"),
            header("enqueuedTime", b"3000"),
        ];
        let at = extract_enqueue_time(&headers).timestamp().unwrap();
        assert_eq!(at.timestamp_millis(), 3000);
    }

    #[test]
    fn test_absent_headers() {
        assert_eq!(extract_enqueue_time(&[]), EnqueueTime::Absent);
        let headers = vec![
            header("traceparent", b"00-abc"),
            ("enqueuedTime".to_string(), None),
        ];
        assert_eq!(extract_enqueue_time(&headers), EnqueueTime::Absent);
        assert!(EnqueueTime::Absent.timestamp().is_none());
    }
}

//! Account event data model
//!
//! Types shared by the load producer and the consumer pipeline: the event itself,
//! the downstream acknowledgement, bus coordinates and the dead-letter envelope.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{de, Deserialize, Deserializer, Serialize};
use std::fmt;

/// Placeholder used whenever an account number is written to a log line
const MASK: &str = "****";

/// Account action tag carried by every event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountAction {
    Create,
    Update,
    Delete,
    Activate,
    Deactivate,
    Suspend,
    Reactivate,
    Verify,
    Close,
    Transfer,
    Upgrade,
    Downgrade,
}

impl AccountAction {
    /// Every action, in declaration order
    pub const ALL: [AccountAction; 12] = [
        AccountAction::Create,
        AccountAction::Update,
        AccountAction::Delete,
        AccountAction::Activate,
        AccountAction::Deactivate,
        AccountAction::Suspend,
        AccountAction::Reactivate,
        AccountAction::Verify,
        AccountAction::Close,
        AccountAction::Transfer,
        AccountAction::Upgrade,
        AccountAction::Downgrade,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountAction::Create => "CREATE",
            AccountAction::Update => "UPDATE",
            AccountAction::Delete => "DELETE",
            AccountAction::Activate => "ACTIVATE",
            AccountAction::Deactivate => "DEACTIVATE",
            AccountAction::Suspend => "SUSPEND",
            AccountAction::Reactivate => "REACTIVATE",
            AccountAction::Verify => "VERIFY",
            AccountAction::Close => "CLOSE",
            AccountAction::Transfer => "TRANSFER",
            AccountAction::Upgrade => "UPGRADE",
            AccountAction::Downgrade => "DOWNGRADE",
        }
    }
}

impl fmt::Display for AccountAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synthetic account action event
///
/// This is the payload published by the load producer and consumed by the pipeline.
/// On the wire it is camelCase JSON; `producerTs` is accepted either as an ISO-8601
/// string or as epoch milliseconds and is always written back as ISO-8601.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountEvent {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub account_number: String,
    pub account_action: AccountAction,
    #[serde(default, deserialize_with = "deserialize_instant")]
    pub producer_ts: Option<DateTime<Utc>>,
}

impl AccountEvent {
    /// Account number safe for log output
    pub fn masked_account_number(&self) -> String {
        mask_account_number(Some(&self.account_number))
    }
}

/// Masks an account number down to its last four characters
///
/// Anything absent or shorter than four characters collapses to `****`.
pub fn mask_account_number(account_number: Option<&str>) -> String {
    match account_number {
        Some(number) if number.chars().count() >= 4 => {
            let tail: String = number
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("{}{}", MASK, tail)
        }
        _ => MASK.to_string(),
    }
}

/// Body returned by the downstream account service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccountResponse {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub account_number: Option<String>,
    pub account_action: Option<String>,
    pub message: Option<String>,
}

/// A downstream response paired with its HTTP status
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub status: u16,
    pub response: AccountResponse,
}

/// Where a message lives on the bus
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusCoordinates {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for BusCoordinates {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Why a message ended up on a failure channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    RetryExhausted,
    NonRetryable,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::RetryExhausted => "RETRY_EXHAUSTED",
            ErrorKind::NonRetryable => "NON_RETRYABLE",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope published to the dead-letter and error channels
///
/// The error kind is serialized as `errorType` so envelopes already sitting on the
/// failure topics stay readable by replay tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedMessage {
    pub original_message: AccountEvent,
    #[serde(rename = "errorType")]
    pub error_kind: ErrorKind,
    pub error_message: String,
    pub http_status_code: i32,
    pub retry_count: u32,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

impl FailedMessage {
    pub fn new(
        original_message: AccountEvent,
        error_kind: ErrorKind,
        error_message: impl Into<String>,
        http_status_code: i32,
        retry_count: u32,
        coordinates: &BusCoordinates,
    ) -> Self {
        Self {
            original_message,
            error_kind,
            error_message: error_message.into(),
            http_status_code,
            retry_count,
            topic: coordinates.topic.clone(),
            partition: coordinates.partition,
            offset: coordinates.offset,
            timestamp: Utc::now(),
        }
    }
}

/// Parses a textual instant: all-digit epoch millis, RFC 3339, or an offset-less ISO
/// date-time which is read as UTC.
pub fn parse_instant(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        return text
            .parse::<i64>()
            .ok()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawInstant {
    Millis(i64),
    Text(String),
}

fn deserialize_instant<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<RawInstant>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawInstant::Millis(millis)) => Utc
            .timestamp_millis_opt(millis)
            .single()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("epoch millis out of range: {}", millis))),
        Some(RawInstant::Text(text)) => parse_instant(&text)
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("unrecognized timestamp: {}", text))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_account_number() {
        assert_eq!(mask_account_number(Some("ACC-1234ABCD")), "****ABCD");
        assert_eq!(mask_account_number(Some("1234")), "****1234");
        assert_eq!(mask_account_number(Some("123")), "****");
        assert_eq!(mask_account_number(Some("")), "****");
        assert_eq!(mask_account_number(None), "****");
    }

    #[test]
    fn test_mask_counts_characters_not_bytes() {
        assert_eq!(mask_account_number(Some("ACC-ÄÖÜß")), "****ÄÖÜß");
        assert_eq!(mask_account_number(Some("ÄÖÜ")), "****");
    }

    #[test]
    fn test_event_accepts_iso_producer_ts() {
        let json = r#"{"firstName":"Mary","lastName":"Smith","accountNumber":"ACC-0000BEEF",
            "accountAction":"CREATE","producerTs":"2024-03-01T12:00:00.250Z"}"#;
        let event: AccountEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.account_action, AccountAction::Create);
        assert_eq!(
            event.producer_ts.unwrap().timestamp_millis(),
            1_709_294_400_250
        );
    }

    #[test]
    fn test_event_accepts_epoch_millis_producer_ts() {
        let json = r#"{"firstName":"Mary","lastName":"Smith","accountNumber":"ACC-0000BEEF",
            "accountAction":"CLOSE","producerTs":1709294400250}"#;
        let event: AccountEvent = serde_json::from_str(json).unwrap();
        assert_eq!(
            event.producer_ts.unwrap().timestamp_millis(),
            1_709_294_400_250
        );
    }

    #[test]
    fn test_event_without_producer_ts() {
        let json = r#"{"firstName":"Mary","lastName":"Smith","accountNumber":"ACC-0000BEEF","accountAction":"VERIFY"}"#;
        let event: AccountEvent = serde_json::from_str(json).unwrap();
        assert!(event.producer_ts.is_none());
    }

    #[test]
    fn test_event_rejects_unknown_action() {
        let json = r#"{"firstName":"Mary","lastName":"Smith","accountNumber":"ACC-1","accountAction":"EXPLODE"}"#;
        assert!(serde_json::from_str::<AccountEvent>(json).is_err());
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let event = AccountEvent {
            first_name: "John".into(),
            last_name: "Lee".into(),
            account_number: "ACC-12345678".into(),
            account_action: AccountAction::Downgrade,
            producer_ts: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["firstName"], "John");
        assert_eq!(value["accountNumber"], "ACC-12345678");
        assert_eq!(value["accountAction"], "DOWNGRADE");
    }

    #[test]
    fn test_failed_message_wire_names() {
        let event = AccountEvent {
            first_name: "John".into(),
            last_name: "Lee".into(),
            account_number: "ACC-12345678".into(),
            account_action: AccountAction::Transfer,
            producer_ts: None,
        };
        let coordinates = BusCoordinates {
            topic: "accounts".into(),
            partition: 2,
            offset: 41,
        };
        let failed =
            FailedMessage::new(event, ErrorKind::RetryExhausted, "boom", 503, 3, &coordinates);
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["errorType"], "RETRY_EXHAUSTED");
        assert_eq!(value["httpStatusCode"], 503);
        assert_eq!(value["retryCount"], 3);
        assert_eq!(value["partition"], 2);
        assert_eq!(value["offset"], 41);
        assert_eq!(value["originalMessage"]["accountAction"], "TRANSFER");
    }

    #[test]
    fn test_parse_instant_variants() {
        assert_eq!(
            parse_instant("1700000000000").unwrap().timestamp_millis(),
            1_700_000_000_000
        );
        assert!(parse_instant("2023-11-14T22:13:20Z").is_some());
        assert!(parse_instant("2023-11-14T22:13:20.5").is_some());
        assert!(parse_instant("  ").is_none());
        assert!(parse_instant("yesterday").is_none());
    }

    #[test]
    fn test_action_round_trips_through_display() {
        for action in AccountAction::ALL {
            let json = format!("\"{}\"", action);
            let parsed: AccountAction = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, action);
        }
    }
}

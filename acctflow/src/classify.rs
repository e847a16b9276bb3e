//! Downstream failure classification
//!
//! A failed delivery is either worth retrying or not. The decision depends only on the
//! observable shape of the failure (no response, which status code, or something else)
//! so the same failure always classifies the same way.

use std::fmt;
use thiserror::Error;

/// Failure of a single downstream delivery attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// No response was received (connect failure, reset, timeout)
    #[error("transport failure: {0}")]
    Transport(String),

    /// The service answered with an error status
    #[error("HTTP error {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// Anything else that went wrong around the call
    #[error("unexpected failure: {0}")]
    Unexpected(String),
}

impl DeliveryError {
    /// HTTP status carried by the failure, if a response was received
    pub fn status(&self) -> Option<u16> {
        match self {
            DeliveryError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            DeliveryError::Transport(_) => FailureKind::TransportFailure,
            DeliveryError::HttpStatus { status, .. } => match classify_status(*status) {
                Some(Classification::Retryable) => FailureKind::DownstreamServerError,
                Some(Classification::NonRetryable) => FailureKind::DownstreamClientError,
                None => FailureKind::UnexpectedFailure,
            },
            DeliveryError::Unexpected(_) => FailureKind::UnexpectedFailure,
        }
    }
}

/// Failure taxonomy used for logging and routing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    TransportFailure,
    DownstreamServerError,
    DownstreamClientError,
    UnexpectedFailure,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::TransportFailure => "transport failure",
            FailureKind::DownstreamServerError => "downstream server error",
            FailureKind::DownstreamClientError => "downstream client error",
            FailureKind::UnexpectedFailure => "unexpected failure",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Retryable,
    NonRetryable,
}

/// Maps an HTTP error status to a classification
///
/// 5xx and 429 are retryable, the rest of 4xx is not. Statuses below 400 are not
/// errors and yield `None`.
pub fn classify_status(status: u16) -> Option<Classification> {
    match status {
        429 => Some(Classification::Retryable),
        s if s >= 500 => Some(Classification::Retryable),
        400..=499 => Some(Classification::NonRetryable),
        _ => None,
    }
}

/// Pure classifier for delivery failures
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorClassifier {
    /// Treat unexpected failures as retryable instead of routing them straight to the
    /// error channel
    pub retry_unexpected: bool,
}

impl ErrorClassifier {
    pub fn new(retry_unexpected: bool) -> Self {
        Self { retry_unexpected }
    }

    pub fn classify(&self, failure: &DeliveryError) -> Classification {
        match failure.kind() {
            FailureKind::TransportFailure | FailureKind::DownstreamServerError => {
                Classification::Retryable
            }
            FailureKind::DownstreamClientError => Classification::NonRetryable,
            FailureKind::UnexpectedFailure if self.retry_unexpected => Classification::Retryable,
            FailureKind::UnexpectedFailure => Classification::NonRetryable,
        }
    }
}

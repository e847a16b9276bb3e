//! Retry state machine and exponential backoff
//!
//! A message moves through `Attempting(0..=max_retries)` and ends either in `Success`
//! or `Exhausted`. Retryable failures below the retry budget wait out a backoff delay
//! and move to the next attempt; a retryable failure on the last attempt exhausts with
//! `RETRY_EXHAUSTED`; a non-retryable failure exhausts immediately with `NON_RETRYABLE`.

use crate::classify::{Classification, DeliveryError, ErrorClassifier};
use crate::model::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("backoff multiplier must be a finite value >= 1.0, got {0}")]
    InvalidMultiplier(f64),

    #[error("initial backoff interval {initial:?} exceeds max interval {max:?}")]
    InitialExceedsMax { initial: Duration, max: Duration },
}

/// Exponential backoff: `min(initial * multiplier^n, max)` for retry `n`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub initial_interval: Duration,
    pub multiplier: f64,
    pub max_interval: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(1000),
            multiplier: 2.0,
            max_interval: Duration::from_millis(10_000),
            max_retries: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn new(
        initial_interval: Duration,
        multiplier: f64,
        max_interval: Duration,
        max_retries: u32,
    ) -> Result<Self, PolicyError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(PolicyError::InvalidMultiplier(multiplier));
        }
        if initial_interval > max_interval {
            return Err(PolicyError::InitialExceedsMax {
                initial: initial_interval,
                max: max_interval,
            });
        }
        Ok(Self {
            initial_interval,
            multiplier,
            max_interval,
            max_retries,
        })
    }

    /// Delay to wait after the failure of attempt `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let scaled = self.initial_interval.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_interval.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// The full sequence of delays a message can experience
    pub fn schedule(&self) -> Vec<Duration> {
        (0..self.max_retries).map(|retry| self.delay(retry)).collect()
    }
}

/// Delivery state of a single message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `n` is about to run; `n` is also the number of retries already spent
    Attempting(u32),
    Success,
    Exhausted { kind: ErrorKind, retries: u32 },
}

impl RetryState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RetryState::Attempting(_))
    }
}

/// Edge taken out of `Attempting(n)` after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Wait `delay`, then run `next_attempt`
    RetryAfter { next_attempt: u32, delay: Duration },
    /// Stop retrying and route the message to a failure channel
    Exhaust { kind: ErrorKind, retries: u32 },
}

impl Transition {
    /// State the message is in once this transition is taken
    pub fn target(&self) -> RetryState {
        match *self {
            Transition::RetryAfter { next_attempt, .. } => RetryState::Attempting(next_attempt),
            Transition::Exhaust { kind, retries } => RetryState::Exhausted { kind, retries },
        }
    }
}

/// Decides the next state after a failed attempt
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryCoordinator {
    policy: BackoffPolicy,
    classifier: ErrorClassifier,
}

impl RetryCoordinator {
    pub fn new(policy: BackoffPolicy, classifier: ErrorClassifier) -> Self {
        Self { policy, classifier }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Transition out of `Attempting(attempt)` after `failure`
    pub fn on_failure(&self, attempt: u32, failure: &DeliveryError) -> Transition {
        match self.classifier.classify(failure) {
            Classification::NonRetryable => Transition::Exhaust {
                kind: ErrorKind::NonRetryable,
                retries: attempt,
            },
            Classification::Retryable if attempt < self.policy.max_retries => {
                Transition::RetryAfter {
                    next_attempt: attempt + 1,
                    delay: self.policy.delay(attempt),
                }
            }
            Classification::Retryable => Transition::Exhaust {
                kind: ErrorKind::RetryExhausted,
                retries: attempt,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Elapsed,
    Cancelled,
}

/// Sleeps for `delay` unless `shutdown` fires first
pub async fn backoff_wait(delay: Duration, shutdown: &CancellationToken) -> WaitOutcome {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => WaitOutcome::Cancelled,
        _ = tokio::time::sleep(delay) => WaitOutcome::Elapsed,
    }
}

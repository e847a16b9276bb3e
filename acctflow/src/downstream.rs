//! Downstream account service client

use crate::classify::DeliveryError;
use crate::model::{AccountEvent, AccountResponse, DeliveryOutcome};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Path the account service accepts events on
pub const ACCOUNTS_PATH: &str = "/api/accounts";

/// The downstream service every consumed event is forwarded to
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Delivers one event; `Ok` only for a 2xx with a readable body
    async fn post_account(&self, event: &AccountEvent) -> Result<DeliveryOutcome, DeliveryError>;
}

/// [`AccountService`] over HTTP
pub struct HttpAccountService {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpAccountService {
    /// Builds a client for `base_url` with separate connect and whole-request timeouts
    pub fn new(
        base_url: &str,
        connect_timeout: Duration,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}{}", base_url.trim_end_matches('/'), ACCOUNTS_PATH),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Failures before any status line was read
fn request_failure(e: reqwest::Error) -> DeliveryError {
    if e.is_builder() {
        DeliveryError::Unexpected(format!("failed to build request: {}", e))
    } else {
        DeliveryError::Transport(e.to_string())
    }
}

#[async_trait]
impl AccountService for HttpAccountService {
    async fn post_account(&self, event: &AccountEvent) -> Result<DeliveryOutcome, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .map_err(request_failure)?;

        let status = response.status();
        debug!("{} answered {}", self.endpoint, status);

        if status.is_success() {
            let body = response.text().await.map_err(request_failure)?;
            let parsed: AccountResponse = serde_json::from_str(&body).map_err(|e| {
                DeliveryError::Unexpected(format!("unreadable response body: {}", e))
            })?;
            return Ok(DeliveryOutcome {
                status: status.as_u16(),
                response: parsed,
            });
        }

        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        Err(DeliveryError::Unexpected(format!(
            "unexpected HTTP status {}",
            status
        )))
    }
}

//! acctflow_stub - stand-in for the downstream account service
//!
//! `POST /api/accounts` echoes the identity fields of the posted event and adds a
//! randomly picked acknowledgement message. It always answers 200.

use axum::routing::post;
use axum::{Json, Router};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Acknowledgements returned in the `message` field
pub const MESSAGES: [&str; 10] = [
    "Request processed successfully",
    "Account action completed",
    "Operation finished without errors",
    "Transaction acknowledged",
    "Request received and handled",
    "Action completed successfully",
    "Processing complete",
    "Request fulfilled",
    "Operation successful",
    "Task completed",
];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRequest {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub account_number: Option<String>,
    pub account_action: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountResponse {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub account_number: Option<String>,
    pub account_action: Option<String>,
    pub message: String,
}

pub fn random_message() -> &'static str {
    MESSAGES
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(MESSAGES[0])
}

/// Build the stub router
pub fn router() -> Router {
    Router::new().route("/api/accounts", post(accounts_handler))
}

/// Serve the stub at the given address (e.g. `"0.0.0.0:8089"`)
pub async fn serve(addr: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Account service stub listening on {}", listener.local_addr()?);
    axum::serve(listener, router()).await
}

async fn accounts_handler(Json(request): Json<AccountRequest>) -> Json<AccountResponse> {
    info!(
        "Received {} for account {}",
        request.account_action.as_deref().unwrap_or("?"),
        request.account_number.as_deref().unwrap_or("?")
    );
    Json(AccountResponse {
        first_name: request.first_name,
        last_name: request.last_name,
        account_number: request.account_number,
        account_action: request.account_action,
        message: random_message().to_string(),
    })
}

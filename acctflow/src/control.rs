//! Producer control surface over HTTP
//!
//! ## Routes
//!
//! - `POST /api/producer/start`
//! - `POST /api/producer/stop`
//! - `GET /api/producer/status`
//! - `GET /api/producer/rate`
//! - `POST /api/producer/rate?messagesPerSecond=N`
//! - `POST /api/producer/reset-stats`

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::load::LoadProducer;
use crate::scheduler::RateError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RateParams {
    messages_per_second: Option<String>,
}

/// Build the control router around the process's load producer
pub fn router(load: Arc<LoadProducer>) -> Router {
    Router::new()
        .route("/api/producer/start", post(start_handler))
        .route("/api/producer/stop", post(stop_handler))
        .route("/api/producer/status", get(status_handler))
        .route("/api/producer/rate", get(get_rate_handler).post(set_rate_handler))
        .route("/api/producer/reset-stats", post(reset_stats_handler))
        .with_state(load)
}

/// Serve the control router on `addr` until `shutdown` fires
pub async fn serve(
    load: Arc<LoadProducer>,
    addr: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Producer control listening on {}", listener.local_addr()?);
    axum::serve(listener, router(load))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
}

async fn start_handler(State(load): State<Arc<LoadProducer>>) -> impl IntoResponse {
    info!("Received request to start producer");
    load.start().await;
    Json(json!({ "status": "started", "messagesPerSecond": load.rate() }))
}

async fn stop_handler(State(load): State<Arc<LoadProducer>>) -> impl IntoResponse {
    info!("Received request to stop producer");
    let stats = load.stop().await;
    Json(json!({
        "status": "stopped",
        "totalSent": stats.messages_sent,
        "successful": stats.messages_successful,
        "failed": stats.messages_failed,
    }))
}

async fn status_handler(State(load): State<Arc<LoadProducer>>) -> impl IntoResponse {
    Json(load.stats())
}

async fn get_rate_handler(State(load): State<Arc<LoadProducer>>) -> impl IntoResponse {
    Json(json!({ "messagesPerSecond": load.rate(), "running": load.is_running() }))
}

async fn set_rate_handler(
    State(load): State<Arc<LoadProducer>>,
    Query(params): Query<RateParams>,
) -> impl IntoResponse {
    let requested = params
        .messages_per_second
        .as_deref()
        .and_then(|value| value.trim().parse::<i64>().ok());
    let updated = match requested {
        Some(requested) => load.set_rate(requested).await,
        None => Err(RateError::Unparseable),
    };
    match updated {
        Ok(rate) => {
            info!("Updated rate to {} messages/second", rate);
            Json(json!({
                "status": "rate_updated",
                "messagesPerSecond": rate,
                "running": load.is_running(),
            }))
            .into_response()
        }
        Err(e) => {
            let body = json!({ "error": e.to_string() });
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }
}

async fn reset_stats_handler(State(load): State<Arc<LoadProducer>>) -> impl IntoResponse {
    load.reset_stats();
    Json(json!({ "status": "stats_reset" }))
}

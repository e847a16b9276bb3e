//! Producer control API over HTTP

use acctflow::bus::MemoryBus;
use acctflow::control;
use acctflow::load::LoadProducer;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

async fn spawn_control(rate: u32) -> (String, Arc<MemoryBus>, Arc<LoadProducer>) {
    let bus = Arc::new(MemoryBus::new());
    let load = Arc::new(LoadProducer::new(bus.clone(), "accounts", rate).unwrap());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = control::router(load.clone());
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    (format!("http://{}/api/producer", addr), bus, load)
}

async fn post(client: &reqwest::Client, url: String) -> (u16, Value) {
    let response = client.post(url).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn get(client: &reqwest::Client, url: String) -> Value {
    client.get(url).send().await.unwrap().json().await.unwrap()
}

#[tokio::test]
async fn test_start_status_stop() {
    let (base, bus, _) = spawn_control(200).await;
    let client = reqwest::Client::new();

    let (status, body) = post(&client, format!("{}/start", base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "started");
    assert_eq!(body["messagesPerSecond"], 200);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let stats = get(&client, format!("{}/status", base)).await;
    assert_eq!(stats["running"], true);
    assert_eq!(stats["topic"], "accounts");
    assert!(stats["messagesSent"].as_u64().unwrap() > 0);

    let (status, body) = post(&client, format!("{}/stop", base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "stopped");
    let total = body["totalSent"].as_u64().unwrap();
    assert!(total > 0);
    assert_eq!(body["successful"].as_u64().unwrap(), total);
    assert_eq!(body["failed"], 0);
    assert_eq!(bus.records("accounts").len() as u64, total);

    let stats = get(&client, format!("{}/status", base)).await;
    assert_eq!(stats["running"], false);
}

#[tokio::test]
async fn test_rate_endpoints() {
    let (base, _, load) = spawn_control(10).await;
    let client = reqwest::Client::new();

    let rate = get(&client, format!("{}/rate", base)).await;
    assert_eq!(rate["messagesPerSecond"], 10);
    assert_eq!(rate["running"], false);

    let (status, body) = post(&client, format!("{}/rate?messagesPerSecond=500", base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "rate_updated");
    assert_eq!(body["messagesPerSecond"], 500);
    assert_eq!(body["running"], false);
    assert_eq!(load.rate(), 500);

    for bad in ["0", "10001", "-3", "abc", "2.5"] {
        let (status, body) =
            post(&client, format!("{}/rate?messagesPerSecond={}", base, bad)).await;
        assert_eq!(status, 400);
        assert_eq!(
            body["error"],
            "Rate must be between 1 and 10000 messages per second"
        );
    }
    assert_eq!(load.rate(), 500);

    let (status, body) = post(&client, format!("{}/rate", base)).await;
    assert_eq!(status, 400);
    assert_eq!(
        body["error"],
        "Rate must be between 1 and 10000 messages per second"
    );
    assert_eq!(load.rate(), 500);
}

#[tokio::test]
async fn test_reset_stats() {
    let (base, _, load) = spawn_control(100).await;
    let client = reqwest::Client::new();

    load.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    load.stop().await;
    assert!(load.stats().messages_sent > 0);

    let (status, body) = post(&client, format!("{}/reset-stats", base)).await;
    assert_eq!(status, 200);
    assert_eq!(body["status"], "stats_reset");

    let stats = get(&client, format!("{}/status", base)).await;
    assert_eq!(stats["messagesSent"], 0);
    assert_eq!(stats["messagesSuccessful"], 0);
    assert_eq!(stats["messagesFailed"], 0);
}

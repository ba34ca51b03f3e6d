//! Drives the example pipeline over HTTP.

use lambda_harness::{HarnessConfig, InvocationEngine, QueueService};
use lambda_harness_example::{ExampleHarness, ORDERS_QUEUE};
use reqwest::Client;
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::time::Duration;

async fn start() -> (ExampleHarness, InvocationEngine, SocketAddr) {
    let config = HarnessConfig::builder()
        .http_port(0)
        .poll_interval(Duration::from_millis(10))
        .build();
    let harness = ExampleHarness::new(&config).await.unwrap();
    let engine = harness.engine();
    engine.start().await.unwrap();
    let addr = engine.http_addrs().await[0];
    (harness, engine, addr)
}

fn url(addr: SocketAddr, path: &str) -> String {
    format!("http://{}{}", addr, path)
}

#[tokio::test]
async fn test_greeting_uses_path_parameter() {
    let (_harness, engine, addr) = start().await;

    let response = Client::new()
        .get(url(addr, "/hello/ferris"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["message"], "Hello, ferris!");
    assert!(!body["request_id"].as_str().unwrap().is_empty());

    engine.stop().await;
}

#[tokio::test]
async fn test_health_answers_empty_200() {
    let (_harness, engine, addr) = start().await;

    let response = Client::new().get(url(addr, "/health")).send().await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(response.text().await.unwrap().is_empty());

    engine.stop().await;
}

#[tokio::test]
async fn test_order_with_wrong_shape_is_unprocessable() {
    let (harness, engine, addr) = start().await;

    let response = Client::new()
        .post(url(addr, "/orders"))
        .json(&json!({"message": 42}))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
    let orders = harness.queues.get_queue_url(ORDERS_QUEUE).await.unwrap();
    assert_eq!(harness.queues.visible_count(&orders), 0);
    engine.stop().await;
}

#[tokio::test]
async fn test_submitted_order_reaches_the_recorder() {
    let (harness, engine, addr) = start().await;

    let response = Client::new()
        .post(url(addr, "/orders"))
        .json(&json!({"message": "two coffees"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 202);
    let accepted: Value = response.json().await.unwrap();
    let message_id = accepted["message_id"].as_str().unwrap().to_string();

    let processed = harness.processed.clone();
    engine
        .wait_for(
            || {
                let processed = processed.clone();
                async move { processed.len() == 1 }
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    engine.stop().await;

    let order = &harness.processed.all()[0];
    assert_eq!(order.message, "two coffees");
    assert_eq!(order.source_message_id, message_id);
    assert_eq!(order.forwarded_by, "forward-orders");
}

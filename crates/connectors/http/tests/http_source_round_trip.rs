//! End-to-end test of the HTTP source: a real TCP listener accepting a
//! real `reqwest` request, with a stand-in worker racing the ack/reply
//! against the request the way the pipeline engine would.

use std::time::Duration;

use events_bridge_core::contract::Source;
use events_bridge_core::message::ReplyData;
use events_bridge_http::{HttpSource, HttpSourceConfig};

#[tokio::test]
async fn posted_body_is_delivered_and_reply_is_returned() {
    let config = HttpSourceConfig::from_options(&serde_json::json!({
        "bind": "127.0.0.1:18099",
        "path": "/ingest",
        "timeout_ms": 2000
    }))
    .unwrap();
    let source = HttpSource::new(config);
    let mut rx = source.produce(4).await.unwrap();

    let worker = tokio::spawn(async move {
        let msg = rx.recv().await.expect("message delivered");
        assert_eq!(msg.data(), b"payload");
        msg.ack(Some(ReplyData::new("ack-body").with_metadata("Content-Type", "text/plain")))
            .unwrap();
    });

    // Give the listener a moment to bind before connecting.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let response = client
        .post("http://127.0.0.1:18099/ingest")
        .body("payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = response.text().await.unwrap();
    assert_eq!(body, "ack-body");

    worker.await.unwrap();
}

#[tokio::test]
async fn no_worker_response_times_out_as_gateway_timeout() {
    let config = HttpSourceConfig::from_options(&serde_json::json!({
        "bind": "127.0.0.1:18100",
        "path": "/ingest",
        "timeout_ms": 150
    }))
    .unwrap();
    let source = HttpSource::new(config);
    let _rx = source.produce(4).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = reqwest::Client::new();
    let response = client
        .post("http://127.0.0.1:18100/ingest")
        .body("abandoned")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::GATEWAY_TIMEOUT);
}

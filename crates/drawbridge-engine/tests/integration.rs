//! Engine integration tests: start a real engine and drive it over HTTP + WS.
//!
//! Run with: `cargo test -p drawbridge-engine --test integration`

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use drawbridge_core::config::Config;
use drawbridge_engine::EngineState;

type Viewer = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Start an engine on an ephemeral port and return its base URL.
async fn start_test_engine() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let state = Arc::new(EngineState::new(Arc::new(Config::default())));

    tokio::spawn(async move {
        let _ = drawbridge_engine::serve(listener, state, std::future::pending()).await;
    });

    let base = format!("http://127.0.0.1:{port}");
    for _ in 0..50 {
        if reqwest::get(format!("{base}/health")).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    base
}

async fn connect_viewer(base: &str) -> Viewer {
    let url = format!("{}/ws", base.replace("http://", "ws://"));
    let (ws, _) = connect_async(&url).await.expect("WS connect failed");
    ws
}

/// Next JSON text frame, failing the test after a short wait.
async fn next_event(ws: &mut Viewer) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let base = start_test_engine().await;

    let resp = reqwest::get(format!("{base}/health"))
        .await
        .expect("Health request failed");

    assert!(resp.status().is_success());
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert!(body["version"].is_string());
    assert_eq!(body["subscriberCount"], 0);
}

#[tokio::test]
async fn test_viewer_bootstrap_and_live_events() {
    let base = start_test_engine().await;
    let client = reqwest::Client::new();

    client
        .post(format!("{base}/api/elements"))
        .json(&json!({"id": "pre", "type": "rectangle", "x": 0, "y": 0}))
        .send()
        .await
        .unwrap();

    let mut ws = connect_viewer(&base).await;
    let initial = next_event(&mut ws).await;
    assert_eq!(initial["type"], "initial_elements");
    assert_eq!(initial["elements"][0]["id"], "pre");
    let status = next_event(&mut ws).await;
    assert_eq!(status["type"], "sync_status");
    assert_eq!(status["elementCount"], 1);

    let resp: Value = client
        .post(format!("{base}/api/elements"))
        .json(&json!({"type": "ellipse", "x": 10, "y": 10}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let id = resp["element"]["id"].as_str().unwrap().to_string();

    client
        .put(format!("{base}/api/elements/{id}"))
        .json(&json!({"x": 99}))
        .send()
        .await
        .unwrap();
    client
        .delete(format!("{base}/api/elements/{id}"))
        .send()
        .await
        .unwrap();

    let created = next_event(&mut ws).await;
    assert_eq!(created["type"], "element_created");
    assert_eq!(created["element"]["id"], id);
    let updated = next_event(&mut ws).await;
    assert_eq!(updated["type"], "element_updated");
    assert_eq!(updated["element"]["version"], 2);
    let deleted = next_event(&mut ws).await;
    assert_eq!(deleted["type"], "element_deleted");
    assert_eq!(deleted["elementId"], id);

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_viewer_ping_gets_pong() {
    let base = start_test_engine().await;
    let mut ws = connect_viewer(&base).await;
    let _ = next_event(&mut ws).await;
    let _ = next_event(&mut ws).await;

    ws.send(Message::Text(json!({"type": "ping"}).to_string().into()))
        .await
        .unwrap();
    let pong = next_event(&mut ws).await;
    assert_eq!(pong["type"], "pong");

    ws.close(None).await.ok();
}

#[tokio::test]
async fn test_two_viewers_see_the_same_order() {
    let base = start_test_engine().await;
    let client = reqwest::Client::new();
    let mut a = connect_viewer(&base).await;
    let mut b = connect_viewer(&base).await;
    for ws in [&mut a, &mut b] {
        let _ = next_event(ws).await;
        let _ = next_event(ws).await;
    }

    for x in 0..5 {
        client
            .post(format!("{base}/api/elements"))
            .json(&json!({"id": format!("e{x}"), "type": "rectangle", "x": x, "y": 0}))
            .send()
            .await
            .unwrap();
    }

    for ws in [&mut a, &mut b] {
        let mut ids = Vec::new();
        for _ in 0..5 {
            let event = next_event(ws).await;
            ids.push(event["element"]["id"].as_str().unwrap().to_string());
        }
        assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4"]);
    }
}

#[tokio::test]
async fn test_subscriber_count_tracks_disconnects() {
    let base = start_test_engine().await;
    let mut ws = connect_viewer(&base).await;
    let _ = next_event(&mut ws).await;

    let status: Value = reqwest::get(format!("{base}/api/sync/status"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["subscriberCount"], 1);

    ws.close(None).await.ok();
    drop(ws);

    let mut count = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let status: Value = reqwest::get(format!("{base}/api/sync/status"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        count = status["subscriberCount"].as_u64();
        if count == Some(0) {
            break;
        }
    }
    assert_eq!(count, Some(0));
}

#[tokio::test]
async fn test_sync_broadcasts_snapshot() {
    let base = start_test_engine().await;
    let mut ws = connect_viewer(&base).await;
    let _ = next_event(&mut ws).await;
    let _ = next_event(&mut ws).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/api/elements/sync"))
        .json(&json!({
            "elements": [
                {"id": "s1", "type": "rectangle", "x": 0, "y": 0},
                {"id": "s2", "type": "text", "x": 0, "y": 50, "text": "hi"}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert!(resp.status().is_success());

    let synced = next_event(&mut ws).await;
    assert_eq!(synced["type"], "elements_synced");
    assert_eq!(synced["count"], 2);
    assert_eq!(synced["elements"].as_array().unwrap().len(), 2);
}

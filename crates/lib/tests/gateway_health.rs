//! Integration tests: start the gateway on a free port with a scripted completion backend,
//! check the HTTP routes, run queries over the WebSocket and stop it via the shutdown control.
//! No network access or API key is needed.

use async_trait::async_trait;
use futures_util::{stream, SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use talkative::config::Config;
use talkative::gateway;
use talkative::llm::{CompletionBackend, CompletionRequest, Fragment, FragmentStream, LlmError};
use tokio_tungstenite::tungstenite::Message;

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

/// Answers every question with "Hel" + "lo".
struct HelloBackend;

#[async_trait]
impl CompletionBackend for HelloBackend {
    async fn stream_chat(&self, _request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        Ok(Box::pin(stream::iter(vec![
            Ok(Fragment::text("Hel")),
            Ok(Fragment::text("lo")),
            Ok(Fragment::finished()),
        ])))
    }
}

/// Rejects every request the way the service does for a bad credential.
struct RejectingBackend;

#[async_trait]
impl CompletionBackend for RejectingBackend {
    async fn stream_chat(&self, _request: &CompletionRequest) -> Result<FragmentStream, LlmError> {
        Err(LlmError::Api("401 Unauthorized invalid api key".to_string()))
    }
}

fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    config.gateway.open_browser = false;
    config
}

async fn start_gateway(
    port: u16,
    backend: Arc<dyn CompletionBackend>,
) -> tokio::task::JoinHandle<anyhow::Result<()>> {
    let handle = tokio::spawn(gateway::serve(test_config(port), backend));
    let url = format!("http://127.0.0.1:{}/health", port);
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(&url).send().await {
            if resp.status().is_success() {
                return handle;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    handle.abort();
    panic!("gateway on port {} did not become healthy within 5s", port);
}

type Ws = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Send one request and return its `res` frame, skipping events.
async fn request(ws: &mut Ws, frame: serde_json::Value) -> serde_json::Value {
    let id = frame["id"].clone();
    ws.send(Message::Text(frame.to_string())).await.expect("send request");
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("frame");
        let Message::Text(text) = msg else { continue };
        let frame: serde_json::Value = serde_json::from_str(&text).expect("json frame");
        if frame["type"] == "res" && frame["id"] == id {
            return frame;
        }
    }
}

#[tokio::test]
async fn gateway_health_and_page_respond() {
    let port = free_port();
    let gateway_handle = start_gateway(port, Arc::new(HelloBackend)).await;
    let client = reqwest::Client::new();

    let json: serde_json::Value = client
        .get(format!("http://127.0.0.1:{}/health", port))
        .send()
        .await
        .expect("health request")
        .json()
        .await
        .expect("parse JSON");
    assert_eq!(json.get("runtime").and_then(|v| v.as_str()), Some("running"));
    assert_eq!(json.get("protocol").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(json.get("port").and_then(|v| v.as_u64()), Some(port as u64));

    let page = client
        .get(format!("http://127.0.0.1:{}/", port))
        .send()
        .await
        .expect("page request")
        .text()
        .await
        .expect("page body");
    assert!(page.contains("Talk Active:"));
    assert!(page.contains("AI will remember up to 4 messages."));

    let banner = client
        .get(format!("http://127.0.0.1:{}/banner.svg", port))
        .send()
        .await
        .expect("banner request");
    assert_eq!(
        banner
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("image/svg+xml")
    );

    gateway_handle.abort();
}

#[tokio::test]
async fn ws_query_streams_answer_and_shutdown_stops_server() {
    let port = free_port();
    let gateway_handle = start_gateway(port, Arc::new(HelloBackend)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    let req = serde_json::json!({
        "type": "req",
        "id": "1",
        "method": "query",
        "params": { "message": "hi" }
    });
    ws.send(Message::Text(req.to_string())).await.expect("send query");

    let mut shown = Vec::new();
    let reply = loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("frame within 5s")
            .expect("socket open")
            .expect("frame");
        let Message::Text(text) = msg else { continue };
        let frame: serde_json::Value = serde_json::from_str(&text).expect("json frame");
        match frame.get("type").and_then(|v| v.as_str()) {
            Some("event") => {
                assert_eq!(frame["event"], "answer");
                assert_eq!(frame["payload"]["id"], "1");
                shown.push(frame["payload"]["text"].as_str().unwrap_or_default().to_string());
            }
            Some("res") => {
                assert_eq!(frame["ok"], true);
                break frame["payload"]["reply"].as_str().unwrap_or_default().to_string();
            }
            _ => {}
        }
    };
    assert_eq!(shown, vec!["Hel", "Hello", "Hello"]);
    assert_eq!(reply, "Hello");

    let history = serde_json::json!({ "type": "req", "id": "2", "method": "history" });
    ws.send(Message::Text(history.to_string())).await.expect("send history");
    let frame = loop {
        let Some(Ok(Message::Text(text))) = ws.next().await else {
            panic!("socket closed before history response");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).expect("json frame");
        if frame["id"] == "2" {
            break frame;
        }
    };
    assert_eq!(
        frame["payload"]["turns"],
        serde_json::json!([
            { "role": "user", "content": "hi" },
            { "role": "assistant", "content": "Hello" }
        ])
    );

    let resp = reqwest::Client::new()
        .post(format!("http://127.0.0.1:{}/shutdown", port))
        .send()
        .await
        .expect("shutdown request");
    assert!(resp.status().is_success());

    let mut saw_shutdown = false;
    while let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
        if let Message::Text(text) = msg {
            if text.contains("\"shutdown\"") {
                saw_shutdown = true;
            }
        }
    }
    assert!(saw_shutdown, "expected a shutdown event before the socket closed");

    let result = tokio::time::timeout(Duration::from_secs(5), gateway_handle)
        .await
        .expect("gateway stops within 5s")
        .expect("gateway task not panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn failed_query_reports_error_and_keeps_user_turn() {
    let port = free_port();
    let gateway_handle = start_gateway(port, Arc::new(RejectingBackend)).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{}/ws", port))
        .await
        .expect("ws connect");
    let res = request(
        &mut ws,
        serde_json::json!({
            "type": "req",
            "id": "1",
            "method": "query",
            "params": { "message": "hi" }
        }),
    )
    .await;
    assert_eq!(res["ok"], false);
    assert!(res.get("payload").is_none());
    assert!(res["error"]
        .as_str()
        .unwrap_or_default()
        .contains("invalid api key"));

    let res = request(
        &mut ws,
        serde_json::json!({ "type": "req", "id": "2", "method": "history" }),
    )
    .await;
    assert_eq!(res["ok"], true);
    assert_eq!(
        res["payload"]["turns"],
        serde_json::json!([{ "role": "user", "content": "hi" }])
    );

    gateway_handle.abort();
}

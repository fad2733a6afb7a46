//! Gateway HTTP + WebSocket server (single port).

use crate::config::{self, Config, API_KEY_ENV};
use crate::conversation::ConversationState;
use crate::gateway::protocol::{QueryParams, WsEvent, WsRequest, WsResponse};
use crate::llm::{CompletionBackend, OpenAiClient};
use crate::query::{QueryError, StreamingQueryHandler};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::header,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};

const PROTOCOL_VERSION: u32 = 1;

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

const INDEX_HTML: &str = include_str!("assets/index.html");
const BANNER_SVG: &str = include_str!("assets/banner.svg");

/// Query handler as used by the gateway: any completion backend behind an `Arc`.
pub type GatewayHandler = StreamingQueryHandler<Arc<dyn CompletionBackend>>;

/// Shared state for the gateway (config, query handler, events, shutdown trigger).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// Owns the one conversation of this process.
    pub handler: Arc<GatewayHandler>,
    /// Broadcasts events to connected clients (e.g. shutdown). Subscribers receive JSON event frames.
    pub event_tx: broadcast::Sender<String>,
    /// Notified by the UI's shutdown control.
    pub shutdown: Arc<Notify>,
    /// Port the listener is actually bound to (differs from the config when it asks for 0).
    pub port: u16,
}

/// Run the gateway against the configured OpenAI-compatible endpoint.
/// Blocks until shutdown (Ctrl+C, SIGTERM or the UI's shutdown control).
pub async fn run_gateway(config: Config) -> Result<()> {
    let api_key = config::resolve_api_key(&config);
    if api_key.is_none() {
        log::warn!(
            "{} is not set and completion.apiKey is empty; the completion service will likely reject requests",
            API_KEY_ENV
        );
    }
    let client = OpenAiClient::new(config.completion.base_url.clone(), api_key);
    log::info!("completion endpoint: {}", client.base_url());
    serve(config, Arc::new(client)).await
}

/// Serve the UI with the given completion backend; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, `gateway.allowRemote` must be set or startup fails.
pub async fn serve(config: Config, backend: Arc<dyn CompletionBackend>) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) && !config.gateway.allow_remote {
        anyhow::bail!(
            "refusing to bind gateway to {} (the UI has no auth and a shutdown control; set gateway.allowRemote to override)",
            bind
        );
    }

    let handler = StreamingQueryHandler::new(
        backend,
        ConversationState::shared(),
        config.query_settings(),
    );
    let open_browser = config.gateway.open_browser;
    let bind_addr = format!("{}:{}", bind, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    let local_port = listener
        .local_addr()
        .with_context(|| format!("reading local address of {}", bind_addr))?
        .port();
    log::info!("gateway listening on {}:{}", bind, local_port);

    let (event_tx, _) = broadcast::channel(64);
    let shutdown = Arc::new(Notify::new());
    let state = GatewayState {
        config: Arc::new(config),
        handler: Arc::new(handler),
        event_tx: event_tx.clone(),
        shutdown: shutdown.clone(),
        port: local_port,
    };

    let app = Router::new()
        .route("/", get(index_http))
        .route("/banner.svg", get(banner_http))
        .route("/health", get(health_http))
        .route("/shutdown", post(shutdown_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    if open_browser {
        launch_browser(ui_url(&bind, local_port));
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx, shutdown))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// URL a local browser should open for the given bind address.
fn ui_url(bind: &str, port: u16) -> String {
    let host = match bind {
        "0.0.0.0" => "127.0.0.1",
        "::" => "::1",
        b => b,
    };
    if host.contains(':') {
        format!("http://[{}]:{}/", host, port)
    } else {
        format!("http://{}:{}/", host, port)
    }
}

fn launch_browser(url: String) {
    tokio::task::spawn_blocking(move || {
        log::info!("opening {} in the default browser", url);
        if let Err(e) = open::that(&url) {
            log::warn!("could not open browser for {}: {}", url, e);
        }
    });
}

/// Future that completes when the process should shut down (SIGINT, SIGTERM or the UI control).
/// Broadcasts a shutdown event to WebSocket clients so their sockets close.
async fn shutdown_signal(event_tx: broadcast::Sender<String>, shutdown: Arc<Notify>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown.notified() => {
            log::info!("shutdown requested from the UI");
        },
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining connections");

    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());
}

/// Fill the page template with the window size the UI advertises.
fn render_index(max_history: usize) -> String {
    INDEX_HTML.replace("{{REMEMBERED_MESSAGES}}", &(max_history * 2).to_string())
}

/// GET / serves the chat page.
async fn index_http(State(state): State<GatewayState>) -> Html<String> {
    Html(render_index(state.handler.settings().max_history))
}

/// GET /banner.svg serves the page banner.
async fn banner_http() -> Response {
    ([(header::CONTENT_TYPE, "image/svg+xml")], BANNER_SVG).into_response()
}

fn health_payload(state: &GatewayState) -> serde_json::Value {
    json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.port,
    })
}

/// GET /health returns a simple health JSON (for liveness checks).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(health_payload(&state))
}

/// POST /shutdown stops the server; the process exits once connections drain.
async fn shutdown_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    state.shutdown.notify_one();
    Json(json!({ "shuttingDown": true }))
}

/// GET /ws upgrades to WebSocket. Clients send `req` frames; answers stream back as `answer` events.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode_frame<T: Serialize>(frame: &T) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            log::error!("could not serialize ws frame: {}", e);
            None
        }
    }
}

/// Serialize and send one frame; false when the frame cannot be encoded or the client is gone.
async fn send_json<T: Serialize>(socket: &mut WebSocket, frame: &T) -> bool {
    let Some(text) = encode_frame(frame) else {
        return false;
    };
    socket.send(Message::Text(text)).await.is_ok()
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let client_id = uuid::Uuid::new_v4();
    log::debug!("ws client {} connected", client_id);
    let mut event_rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };

                if req.typ != "req" {
                    continue;
                }

                let res = handle_request(&mut socket, &state, &req).await;
                if !send_json(&mut socket, &res).await {
                    break;
                }
            }
        }
    }

    log::debug!("ws client {} disconnected", client_id);
}

async fn handle_request(
    socket: &mut WebSocket,
    state: &GatewayState,
    req: &WsRequest,
) -> WsResponse {
    match req.method.as_str() {
        "health" => WsResponse::ok(&req.id, health_payload(state)),
        "history" => {
            let conversation = state.handler.conversation().lock().await;
            WsResponse::ok(
                &req.id,
                json!({
                    "turns": conversation.as_ordered_sequence(),
                    "maxHistory": state.handler.settings().max_history,
                }),
            )
        }
        "query" => {
            let params: QueryParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return WsResponse::err(&req.id, "invalid query params"),
            };
            match stream_answer(socket, state, &req.id, params.message).await {
                Ok(reply) => WsResponse::ok(&req.id, json!({ "reply": reply })),
                Err(e) => {
                    log::warn!("query {} failed: {}", req.id, e);
                    WsResponse::err(&req.id, e.to_string())
                }
            }
        }
        "shutdown" => {
            state.shutdown.notify_one();
            WsResponse::ok(&req.id, json!({ "shuttingDown": true }))
        }
        _ => WsResponse::err(&req.id, format!("unknown method: {}", req.method)),
    }
}

/// Run one query and forward every display value as an `answer` event.
/// A client that disconnects mid-answer does not cancel it: the answer is still committed.
async fn stream_answer(
    socket: &mut WebSocket,
    state: &GatewayState,
    id: &str,
    message: String,
) -> Result<String, QueryError> {
    let mut answer = state.handler.query(message).await?;
    let mut reply = String::new();
    let mut connected = true;
    while let Some(text) = answer.next().await {
        let text = text?;
        if connected && !send_json(socket, &WsEvent::answer(id, &text)).await {
            log::debug!("ws client went away during query {}", id);
            connected = false;
        }
        reply = text;
    }
    Ok(reply)
}

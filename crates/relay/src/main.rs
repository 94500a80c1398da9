use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use shared::protocol::{has_envelope_fields, RelayReply};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;

use app_state::AppState;
use config::load_settings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = load_settings();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&settings.log_filter))
        .init();

    let app = build_router(Arc::new(AppState::default()));

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/", get(ws_handler))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| ws_connection(state, socket))
}

async fn ws_connection(state: Arc<AppState>, socket: WebSocket) {
    let connection_id = state.next_connection_id();
    let (mut sender, mut receiver) = socket.split();
    let (frames_tx, mut frames_rx) = mpsc::unbounded_channel::<String>();

    let send_task = tokio::spawn(async move {
        while let Some(text) = frames_rx.recv().await {
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut registered: Option<String> = None;
    while let Some(Ok(message)) = receiver.next().await {
        match message {
            Message::Text(text) => {
                handle_frame(&state, connection_id, &frames_tx, &mut registered, &text).await;
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    if let Some(user_id) = registered {
        state.unregister(&user_id, connection_id).await;
        info!(%user_id, connection_id, "user disconnected");
    }
    send_task.abort();
}

/// Full envelopes fan out to their members, `user_id` frames register the
/// socket, anything else gets an error reply.
async fn handle_frame(
    state: &AppState,
    connection_id: u64,
    reply: &mpsc::UnboundedSender<String>,
    registered: &mut Option<String>,
    text: &str,
) {
    let value = match serde_json::from_str::<Value>(text) {
        Ok(value) => value,
        Err(error) => {
            debug!(connection_id, %error, "unparseable frame");
            send_reply(reply, &RelayReply::invalid_structure());
            return;
        }
    };

    if has_envelope_fields(&value) {
        let targets = id_list(&value["userIds"]);
        let delivered = state.fan_out(&targets, text).await;
        debug!(
            connection_id,
            conversation_id = %value["id"],
            targets = targets.len(),
            delivered,
            "envelope forwarded"
        );
        return;
    }

    if let Some(user_id) = value.get("user_id").and_then(id_string) {
        if let Some(previous) = registered.replace(user_id.clone()) {
            if previous != user_id {
                state.unregister(&previous, connection_id).await;
            }
        }
        state.register(&user_id, connection_id, reply.clone()).await;
        let connected = state.connected_users().await;
        info!(%user_id, connection_id, connected, "user registered");
        send_reply(reply, &RelayReply::registered(&user_id));
        return;
    }

    warn!(connection_id, "frame matches no known structure");
    send_reply(reply, &RelayReply::invalid_structure());
}

fn send_reply(reply: &mpsc::UnboundedSender<String>, message: &RelayReply) {
    match serde_json::to_string(message) {
        Ok(text) => {
            let _ = reply.send(text);
        }
        Err(error) => warn!(%error, "failed to encode relay reply"),
    }
}

/// Ids arrive as strings from current clients and as numbers from older ones.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

fn id_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|ids| ids.iter().filter_map(id_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

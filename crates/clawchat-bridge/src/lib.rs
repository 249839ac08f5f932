//! WebSocket bridge: the IPC command set for browser clients.
//!
//! Runs on its own TCP port. A connecting client must authenticate
//! with `{"type":"auth","token":…}` first — unless the configured
//! token is empty, in which case every client is auto-authenticated.
//! After that, any IPC command may be issued under a JSON envelope
//! (`type` = command name) and the gateway's push events arrive as
//! `message`, `peer_connected`, `peer_disconnected`, and `error`
//! frames. The bridge holds no identity state of its own.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, watch};
use tower_http::services::ServeDir;

use clawchat_gateway::command::GatewayCommand;
use clawchat_gateway::config::WsBridgeConfig;
use clawchat_gateway::ipc::dispatch_request;
use clawchat_types::{ClawchatError, GatewayEvent, Result};

/// Per-connection outbound frame queue depth.
const FRAME_QUEUE_SIZE: usize = 64;

/// IPC commands a bridge client may issue.
const BRIDGE_COMMANDS: [&str; 12] = [
    "send",
    "recv",
    "inbox",
    "outbox",
    "peers",
    "peer_add",
    "peer_remove",
    "peer_resolve",
    "status",
    "multiaddrs",
    "connect",
    "stop",
];

// ---------------------------------------------------------------------------
// Bridge state
// ---------------------------------------------------------------------------

struct BridgeState {
    command_tx: mpsc::Sender<GatewayCommand>,
    events: broadcast::Sender<GatewayEvent>,
    token: Option<String>,
}

impl BridgeState {
    /// Whether clients skip the auth exchange entirely.
    fn auto_auth(&self) -> bool {
        self.token.as_deref().map_or(true, str::is_empty)
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Serves the bridge until the shutdown watch fires.
pub async fn serve(
    config: WsBridgeConfig,
    command_tx: mpsc::Sender<GatewayCommand>,
    events: broadcast::Sender<GatewayEvent>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let state = Arc::new(BridgeState {
        command_tx,
        events,
        token: config.token.clone(),
    });

    let mut router = Router::new().route("/ws", get(ws_upgrade)).with_state(state);
    if let Some(dir) = &config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ClawchatError::Config {
            reason: format!("bridge failed to bind {addr}: {e}"),
        })?;

    tracing::info!(%addr, "WebSocket bridge listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            while shutdown.changed().await.is_ok() {
                if *shutdown.borrow() {
                    break;
                }
            }
        })
        .await
        .map_err(|e| ClawchatError::Transport {
            reason: format!("bridge server error: {e}"),
        })
}

async fn ws_upgrade(
    State(state): State<Arc<BridgeState>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, state: Arc<BridgeState>) {
    let (mut sink, mut stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<String>(FRAME_QUEUE_SIZE);

    // Single writer serializes responses and events.
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            if sink.send(WsMessage::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let mut authed = state.auto_auth();
    let mut event_pump: Option<tokio::task::JoinHandle<()>> = None;
    if authed {
        event_pump = Some(spawn_event_pump(&state, frame_tx.clone()));
    }

    while let Some(incoming) = stream.next().await {
        let text = match incoming {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) | Err(_) => break,
            Ok(WsMessage::Binary(_)) => {
                let _ = frame_tx
                    .send(error_frame("binary frames are not supported"))
                    .await;
                continue;
            }
        };

        let request: Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                let _ = frame_tx.send(error_frame(&format!("invalid JSON: {e}"))).await;
                continue;
            }
        };
        let Some(kind) = request.get("type").and_then(Value::as_str).map(str::to_string)
        else {
            let _ = frame_tx.send(error_frame("missing 'type' field")).await;
            continue;
        };

        match kind.as_str() {
            "auth" => {
                let offered = request.get("token").and_then(Value::as_str).unwrap_or("");
                if authed || state.token.as_deref() == Some(offered) || state.auto_auth() {
                    authed = true;
                    if event_pump.is_none() {
                        event_pump = Some(spawn_event_pump(&state, frame_tx.clone()));
                    }
                    let _ = frame_tx.send(json!({ "type": "auth_ok" }).to_string()).await;
                } else {
                    let _ = frame_tx
                        .send(json!({ "type": "auth_fail" }).to_string())
                        .await;
                    break;
                }
            }

            "ping" => {
                let _ = frame_tx.send(json!({ "type": "pong" }).to_string()).await;
            }

            cmd if BRIDGE_COMMANDS.contains(&cmd) => {
                if !authed {
                    let _ = frame_tx
                        .send(json!({ "type": "auth_fail" }).to_string())
                        .await;
                    break;
                }
                // Rebuild the request so only the fields the command
                // defines travel; a client-authored message id never
                // reaches the daemon's routing.
                let mut ipc_request = request.clone();
                if let Some(obj) = ipc_request.as_object_mut() {
                    obj.remove("type");
                    obj.remove("id");
                    obj.insert("cmd".into(), Value::String(kind.clone()));
                }
                let mut response =
                    dispatch_request(&state.command_tx, &state.events, ipc_request).await;
                if let Some(obj) = response.as_object_mut() {
                    obj.insert("type".into(), Value::String(kind.clone()));
                }
                if frame_tx.send(response.to_string()).await.is_err() {
                    break;
                }
            }

            other => {
                let _ = frame_tx
                    .send(error_frame(&format!("unknown message type '{other}'")))
                    .await;
            }
        }
    }

    if let Some(pump) = event_pump {
        pump.abort();
    }
    drop(frame_tx);
    let _ = writer.await;
}

/// Forwards gateway events to one authenticated client.
fn spawn_event_pump(
    state: &Arc<BridgeState>,
    frame_tx: mpsc::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    let mut sub = state.events.subscribe();
    tokio::spawn(async move {
        loop {
            match sub.recv().await {
                Ok(event) => {
                    let Some(frame) = ws_event_json(&event) else {
                        continue;
                    };
                    if frame_tx.send(frame.to_string()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "bridge event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Maps gateway events onto the bridge's event vocabulary.
fn ws_event_json(event: &GatewayEvent) -> Option<Value> {
    match event {
        GatewayEvent::Started => None,
        GatewayEvent::Message { identity, message } => Some(json!({
            "type": "message",
            "identity": identity,
            "message": message,
        })),
        GatewayEvent::PeerConnected { identity, remote } => Some(json!({
            "type": "peer_connected",
            "identity": identity,
            "remote": remote,
        })),
        GatewayEvent::PeerDisconnected { identity, remote } => Some(json!({
            "type": "peer_disconnected",
            "identity": identity,
            "remote": remote,
        })),
        GatewayEvent::Error { message } => Some(json!({
            "type": "error",
            "message": message,
        })),
    }
}

fn error_frame(message: &str) -> String {
    json!({ "type": "error", "message": message }).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use clawchat_types::Principal;

    #[test]
    fn event_vocabulary() {
        let identity = Principal::local_from_public_key(&[1; 32]);
        let remote = Principal::local_from_public_key(&[2; 32]);

        assert!(ws_event_json(&GatewayEvent::Started).is_none());

        let frame = ws_event_json(&GatewayEvent::PeerConnected {
            identity: identity.clone(),
            remote: remote.clone(),
        })
        .expect("frame");
        assert_eq!(frame["type"], "peer_connected");

        let frame = ws_event_json(&GatewayEvent::PeerDisconnected { identity, remote })
            .expect("frame");
        assert_eq!(frame["type"], "peer_disconnected");
    }

    #[test]
    fn command_list_matches_control_plane() {
        for cmd in BRIDGE_COMMANDS {
            assert!(!cmd.is_empty());
        }
        assert!(BRIDGE_COMMANDS.contains(&"send"));
        assert!(BRIDGE_COMMANDS.contains(&"recv"));
        assert!(BRIDGE_COMMANDS.contains(&"stop"));
    }

    #[test]
    fn auto_auth_on_empty_token() {
        let (command_tx, _rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(8);
        let with_empty = BridgeState {
            command_tx: command_tx.clone(),
            events: events.clone(),
            token: Some(String::new()),
        };
        assert!(with_empty.auto_auth());

        let with_none = BridgeState {
            command_tx: command_tx.clone(),
            events: events.clone(),
            token: None,
        };
        assert!(with_none.auto_auth());

        let with_token = BridgeState {
            command_tx,
            events,
            token: Some("secret".into()),
        };
        assert!(!with_token.auto_auth());
    }
}

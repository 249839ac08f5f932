//! Local control plane: newline-delimited JSON over a Unix socket.
//!
//! One request object per line; exactly one `{ok, data?, error?}`
//! response line per request before the connection is reused.
//! Connections also receive out-of-band event lines (`type` field
//! instead of `ok`) for `started`, `message`, `p2p:connected`,
//! `p2p:disconnected`, and `error`.
//!
//! [`dispatch_request`] is shared with the WebSocket bridge so both
//! surfaces expose the identical command set.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use clawchat_types::{ClawchatError, GatewayEvent, Result, Timestamp};

use crate::command::GatewayCommand;

/// Per-connection outbound line queue depth.
const LINE_QUEUE_SIZE: usize = 64;

// ---------------------------------------------------------------------------
// Socket lifecycle
// ---------------------------------------------------------------------------

/// Binds the IPC socket, replacing a stale file, owner-only.
pub fn bind(path: &Path) -> Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|e| ClawchatError::Storage {
            reason: format!("failed to remove stale socket '{}': {e}", path.display()),
        })?;
    }

    let listener = UnixListener::bind(path).map_err(|e| ClawchatError::Storage {
        reason: format!("failed to bind socket '{}': {e}", path.display()),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            ClawchatError::Storage {
                reason: format!("failed to restrict socket '{}': {e}", path.display()),
            }
        })?;
    }

    tracing::info!(path = %path.display(), "IPC listening");
    Ok(listener)
}

/// Accept loop; exits when the shutdown watch fires.
pub async fn serve(
    listener: UnixListener,
    command_tx: mpsc::Sender<GatewayCommand>,
    events: broadcast::Sender<GatewayEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        tokio::spawn(handle_connection(
                            stream,
                            command_tx.clone(),
                            events.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(%e, "IPC accept failed");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    tracing::info!("IPC server stopped");
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_connection(
    stream: UnixStream,
    command_tx: mpsc::Sender<GatewayCommand>,
    events: broadcast::Sender<GatewayEvent>,
) {
    let (read_half, mut write_half) = stream.into_split();
    let (line_tx, mut line_rx) = mpsc::channel::<String>(LINE_QUEUE_SIZE);

    // Single writer serializes responses and event lines.
    let writer = tokio::spawn(async move {
        while let Some(line) = line_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err()
                || write_half.write_all(b"\n").await.is_err()
            {
                break;
            }
        }
    });

    // Event pump: every connection gets the push stream.
    let event_lines = line_tx.clone();
    let mut event_sub = events.subscribe();
    let pump = tokio::spawn(async move {
        loop {
            match event_sub.recv().await {
                Ok(event) => {
                    if event_lines
                        .send(event.to_json().to_string())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(dropped = n, "IPC event subscriber lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    // Request loop: one response line per request, in order.
    let mut lines = BufReader::new(read_half).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(&line) {
            Ok(request) => dispatch_request(&command_tx, &events, request).await,
            Err(e) => error_response(&format!("invalid JSON: {e}")),
        };
        if line_tx.send(response.to_string()).await.is_err() {
            break;
        }
    }

    pump.abort();
    drop(line_tx);
    let _ = writer.await;
}

// ---------------------------------------------------------------------------
// Request dispatch
// ---------------------------------------------------------------------------

/// Executes one control-plane request and returns the response
/// object. Shared by the IPC server and the WebSocket bridge.
pub async fn dispatch_request(
    command_tx: &mpsc::Sender<GatewayCommand>,
    events: &broadcast::Sender<GatewayEvent>,
    request: Value,
) -> Value {
    let Some(cmd) = request.get("cmd").and_then(Value::as_str) else {
        return error_response("missing 'cmd' field");
    };

    match cmd {
        "send" => {
            let Some(to) = str_arg(&request, "to") else {
                return error_response("send requires 'to'");
            };
            let Some(content) = str_arg(&request, "content") else {
                return error_response("send requires 'content'");
            };
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::Send {
                    as_identity: str_arg(&request, "as"),
                    to,
                    content,
                    reply,
                })
                .await;
            match await_reply(sent, rx).await {
                Ok(id) => ok_response(json!({ "id": id, "status": "queued" })),
                Err(e) => error_response(&e),
            }
        }

        "recv" => recv_long_poll(command_tx, events, &request).await,

        "inbox" => {
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::Inbox {
                    as_identity: str_arg(&request, "as"),
                    reply,
                })
                .await;
            respond(await_reply(sent, rx).await)
        }

        "outbox" => {
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::Outbox {
                    as_identity: str_arg(&request, "as"),
                    reply,
                })
                .await;
            respond(await_reply(sent, rx).await)
        }

        "peers" => {
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::Peers {
                    as_identity: str_arg(&request, "as"),
                    reply,
                })
                .await;
            respond(await_reply(sent, rx).await)
        }

        "peer_add" => {
            let Some(principal) = str_arg(&request, "principal") else {
                return error_response("peer_add requires 'principal'");
            };
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::PeerAdd {
                    as_identity: str_arg(&request, "as"),
                    principal,
                    address: str_arg(&request, "address"),
                    alias: str_arg(&request, "alias"),
                    visibility: str_arg(&request, "visibility"),
                    reply,
                })
                .await;
            match await_reply(sent, rx).await {
                Ok(()) => ok_response(json!({ "added": true })),
                Err(e) => error_response(&e),
            }
        }

        "peer_remove" => {
            let Some(principal) = str_arg(&request, "principal") else {
                return error_response("peer_remove requires 'principal'");
            };
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::PeerRemove {
                    as_identity: str_arg(&request, "as"),
                    principal,
                    reply,
                })
                .await;
            match await_reply(sent, rx).await {
                Ok(()) => ok_response(json!({ "removed": true })),
                Err(e) => error_response(&e),
            }
        }

        "peer_resolve" => {
            let Some(principal) = str_arg(&request, "principal") else {
                return error_response("peer_resolve requires 'principal'");
            };
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::PeerResolve {
                    as_identity: str_arg(&request, "as"),
                    principal,
                    through: str_arg(&request, "through"),
                    reply,
                })
                .await;
            respond(await_reply(sent, rx).await)
        }

        "status" => {
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::Status {
                    as_identity: str_arg(&request, "as"),
                    reply,
                })
                .await;
            respond(await_reply(sent, rx).await)
        }

        "multiaddrs" => {
            let (reply, rx) = oneshot::channel();
            let sent = command_tx.send(GatewayCommand::Multiaddrs { reply }).await;
            respond(await_reply(sent, rx).await)
        }

        "connect" => {
            let Some(multiaddr) = str_arg(&request, "multiaddr") else {
                return error_response("connect requires 'multiaddr'");
            };
            let (reply, rx) = oneshot::channel();
            let sent = command_tx
                .send(GatewayCommand::Connect { multiaddr, reply })
                .await;
            match await_reply(sent, rx).await {
                Ok(remote) => ok_response(json!({ "connected": remote })),
                Err(e) => error_response(&e),
            }
        }

        "stop" => {
            let _ = command_tx.send(GatewayCommand::Stop).await;
            ok_response(json!({ "stopping": true }))
        }

        other => error_response(&format!("unknown command '{other}'")),
    }
}

/// `recv {as?, since?, timeout?}`: inbox entries newer than `since`,
/// blocking up to `timeout` ms for the first new delivery.
async fn recv_long_poll(
    command_tx: &mpsc::Sender<GatewayCommand>,
    events: &broadcast::Sender<GatewayEvent>,
    request: &Value,
) -> Value {
    let since = Timestamp::from_millis(
        request.get("since").and_then(Value::as_i64).unwrap_or(0),
    );
    let timeout_ms = request.get("timeout").and_then(Value::as_u64).unwrap_or(0);

    // Subscribe before the snapshot so no delivery slips between.
    let mut sub = events.subscribe();

    let (reply, rx) = oneshot::channel();
    let sent = command_tx
        .send(GatewayCommand::Recv {
            as_identity: str_arg(request, "as"),
            since,
            reply,
        })
        .await;
    let (principal, mut messages) = match await_reply(sent, rx).await {
        Ok(result) => result,
        Err(e) => return error_response(&e),
    };

    if !messages.is_empty() || timeout_ms == 0 {
        return ok_response(json!(messages));
    }

    // Resolve on the first qualifying delivery or at the deadline.
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, sub.recv()).await {
            Ok(Ok(GatewayEvent::Message { identity, message }))
                if identity == principal && message.timestamp > since =>
            {
                messages.push(message);
                break;
            }
            Ok(Ok(_)) => continue,
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            Ok(Err(broadcast::error::RecvError::Closed)) => break,
            Err(_) => break,
        }
    }

    ok_response(json!(messages))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn str_arg(request: &Value, key: &str) -> Option<String> {
    request.get(key).and_then(Value::as_str).map(str::to_string)
}

async fn await_reply<T>(
    sent: std::result::Result<(), mpsc::error::SendError<GatewayCommand>>,
    rx: oneshot::Receiver<Result<T>>,
) -> std::result::Result<T, String> {
    if sent.is_err() {
        return Err("gateway is shutting down".into());
    }
    match rx.await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err("gateway dropped the request".into()),
    }
}

fn respond<T: serde::Serialize>(result: std::result::Result<T, String>) -> Value {
    match result {
        Ok(data) => ok_response(json!(data)),
        Err(e) => error_response(&e),
    }
}

fn ok_response(data: Value) -> Value {
    json!({ "ok": true, "data": data })
}

fn error_response(message: &str) -> Value {
    json!({ "ok": false, "error": message })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_cmd_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(8);
        let response = dispatch_request(&tx, &events, json!({ "to": "x" })).await;
        assert_eq!(response["ok"], false);
    }

    #[tokio::test]
    async fn unknown_cmd_rejected() {
        let (tx, _rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(8);
        let response = dispatch_request(&tx, &events, json!({ "cmd": "frobnicate" })).await;
        assert_eq!(response["ok"], false);
        assert!(response["error"].as_str().unwrap_or("").contains("frobnicate"));
    }

    #[tokio::test]
    async fn send_requires_fields() {
        let (tx, _rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(8);
        let response = dispatch_request(&tx, &events, json!({ "cmd": "send" })).await;
        assert_eq!(response["ok"], false);
    }

    #[tokio::test]
    async fn stop_acknowledges() {
        let (tx, mut rx) = mpsc::channel(1);
        let (events, _) = broadcast::channel(8);
        let response = dispatch_request(&tx, &events, json!({ "cmd": "stop" })).await;
        assert_eq!(response["ok"], true);
        assert!(matches!(rx.recv().await, Some(GatewayCommand::Stop)));
    }
}

//! Minimal IPC client: one request line, one response line.
//!
//! The daemon pushes event lines (objects with a `type` field) on the
//! same connection; the client skips those and returns the first
//! response object (the one carrying `ok`).

use std::path::Path;
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Baseline deadline for a request round-trip.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Sends one request to the daemon socket and awaits its response.
///
/// `extra_wait` extends the deadline for long-polling requests.
pub async fn request(
    socket: &Path,
    request: Value,
    extra_wait: Option<Duration>,
) -> Result<Value, String> {
    let deadline = REQUEST_TIMEOUT + extra_wait.unwrap_or_default();
    tokio::time::timeout(deadline, round_trip(socket, request))
        .await
        .map_err(|_| "request timed out — is the daemon responding?".to_string())?
}

async fn round_trip(socket: &Path, request: Value) -> Result<Value, String> {
    let stream = UnixStream::connect(socket).await.map_err(|e| {
        format!(
            "cannot reach the daemon at '{}' — is it running? ({e})",
            socket.display()
        )
    })?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = request.to_string();
    line.push('\n');
    write_half
        .write_all(line.as_bytes())
        .await
        .map_err(|e| format!("failed to send request: {e}"))?;

    let mut lines = BufReader::new(read_half).lines();
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| format!("failed to read response: {e}"))?
            .ok_or_else(|| "daemon closed the connection".to_string())?;
        if line.trim().is_empty() {
            continue;
        }
        let value: Value =
            serde_json::from_str(&line).map_err(|e| format!("malformed response: {e}"))?;
        // Event lines carry `type`; responses carry `ok`.
        if value.get("ok").is_some() {
            return Ok(value);
        }
    }
}

/// Unwraps `{ok, data?, error?}` into the data value.
pub fn into_data(response: Value) -> Result<Value, String> {
    if response.get("ok").and_then(Value::as_bool) == Some(true) {
        Ok(response.get("data").cloned().unwrap_or(Value::Null))
    } else {
        Err(response
            .get("error")
            .and_then(Value::as_str)
            .unwrap_or("unknown daemon error")
            .to_string())
    }
}

//! Messaging commands: send, recv, inbox, outbox.

use std::time::Duration;

use serde_json::{json, Value};

use crate::{ipc_client, Ctx};

pub async fn send(
    ctx: &Ctx,
    to: &str,
    message: &str,
    as_identity: Option<&str>,
) -> Result<Value, String> {
    let mut request = json!({ "cmd": "send", "to": to, "content": message });
    if let Some(selector) = as_identity {
        request["as"] = Value::String(selector.to_string());
    }
    let response = ipc_client::request(&ctx.data.socket_path(), request, None).await?;
    ipc_client::into_data(response)
}

pub async fn recv(
    ctx: &Ctx,
    since: Option<i64>,
    timeout: Option<u64>,
    as_identity: Option<&str>,
) -> Result<Value, String> {
    let mut request = json!({ "cmd": "recv" });
    if let Some(since) = since {
        request["since"] = json!(since);
    }
    if let Some(timeout) = timeout {
        request["timeout"] = json!(timeout);
    }
    if let Some(selector) = as_identity {
        request["as"] = Value::String(selector.to_string());
    }

    let extra_wait = timeout.map(Duration::from_millis);
    let response = ipc_client::request(&ctx.data.socket_path(), request, extra_wait).await?;
    ipc_client::into_data(response)
}

/// `inbox` / `outbox` snapshots share a shape.
pub async fn mailbox(ctx: &Ctx, which: &str, as_identity: Option<&str>) -> Result<Value, String> {
    let mut request = json!({ "cmd": which });
    if let Some(selector) = as_identity {
        request["as"] = Value::String(selector.to_string());
    }
    let response = ipc_client::request(&ctx.data.socket_path(), request, None).await?;
    ipc_client::into_data(response)
}

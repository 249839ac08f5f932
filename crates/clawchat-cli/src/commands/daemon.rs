//! Daemon lifecycle: start (spawn the daemon binary), status, stop.

use clap::Subcommand;
use serde_json::{json, Value};

use crate::{ipc_client, Ctx};

#[derive(Subcommand)]
pub enum DaemonAction {
    /// Spawn the clawchat-daemon binary in the background.
    Start,
    /// Probe the running daemon.
    Status {
        /// Identity to report on.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Ask the daemon to shut down.
    Stop,
}

pub async fn run(ctx: &Ctx, action: DaemonAction) -> Result<Value, String> {
    match action {
        DaemonAction::Start => start(ctx),
        DaemonAction::Status { as_identity } => status(ctx, as_identity.as_deref()).await,
        DaemonAction::Stop => stop(ctx).await,
    }
}

fn start(ctx: &Ctx) -> Result<Value, String> {
    if ctx.data.socket_path().exists() {
        return Err("a daemon appears to be running already (socket exists)".into());
    }

    let mut command = std::process::Command::new("clawchat-daemon");
    command
        .arg("--data-dir")
        .arg(ctx.data.root())
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null());
    if let Some(passphrase) = &ctx.passphrase {
        command.env("CLAWCHAT_PASSPHRASE", passphrase);
    }

    let child = command
        .spawn()
        .map_err(|e| format!("failed to start clawchat-daemon: {e}"))?;

    Ok(json!({ "started": true, "pid": child.id() }))
}

async fn status(ctx: &Ctx, as_identity: Option<&str>) -> Result<Value, String> {
    let pid = std::fs::read_to_string(ctx.data.pid_path())
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());

    let mut request = json!({ "cmd": "status" });
    if let Some(selector) = as_identity {
        request["as"] = Value::String(selector.to_string());
    }

    match ipc_client::request(&ctx.data.socket_path(), request, None).await {
        Ok(response) => {
            let data = ipc_client::into_data(response)?;
            Ok(json!({ "running": true, "pid": pid, "status": data }))
        }
        Err(_) => Ok(json!({ "running": false, "pid": pid })),
    }
}

async fn stop(ctx: &Ctx) -> Result<Value, String> {
    let response =
        ipc_client::request(&ctx.data.socket_path(), json!({ "cmd": "stop" }), None).await?;
    ipc_client::into_data(response)
}

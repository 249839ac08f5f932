//! Headless Clawchat gateway daemon.
//!
//! Reads `gateway-config.json` from the data directory (or detects a
//! legacy single-identity root), loads the configured identities with
//! the passphrase from `--passphrase` / `CLAWCHAT_PASSPHRASE`, and
//! runs the gateway until `stop` or INT/TERM.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use clawchat_gateway::command::GatewayCommand;
use clawchat_gateway::config::{GatewayConfig, IdentityConfig, DEFAULT_P2P_PORT};
use clawchat_gateway::Gateway;
use clawchat_storage::DataLayout;
use clawchat_types::{ClawchatError, Result};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

/// Clawchat gateway — agent-to-agent encrypted messaging daemon.
#[derive(Parser)]
#[command(name = "clawchat-daemon", version, about)]
struct Args {
    /// Data directory (default: $CLAWCHAT_HOME, else ~/.clawchat).
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Identity passphrase (or set CLAWCHAT_PASSPHRASE).
    #[arg(long, env = "CLAWCHAT_PASSPHRASE", hide_env_values = true)]
    passphrase: Option<String>,

    /// Override the configured P2P port.
    #[arg(long)]
    p2p_port: Option<u16>,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    if let Err(e) = run(Args::parse()).await {
        eprintln!("clawchat-daemon: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let data = args
        .data_dir
        .map(DataLayout::new)
        .unwrap_or_else(DataLayout::default_root);

    let passphrase = args.passphrase.ok_or_else(|| ClawchatError::Config {
        reason: "no passphrase: pass --passphrase or set CLAWCHAT_PASSPHRASE".into(),
    })?;

    let mut config = load_or_synthesize_config(&data, &passphrase)?;
    if let Some(port) = args.p2p_port {
        config.p2p_port = port;
    }

    let gateway = Gateway::new(data, config.clone(), &passphrase)?;
    let command_tx = gateway.command_sender();

    // Optional WebSocket bridge.
    let (bridge_shutdown, bridge_shutdown_rx) = tokio::sync::watch::channel(false);
    if let Some(ws) = config.ws_bridge.clone() {
        let bridge_commands = command_tx.clone();
        let bridge_events = gateway.event_sender();
        tokio::spawn(async move {
            if let Err(e) =
                clawchat_bridge::serve(ws, bridge_commands, bridge_events, bridge_shutdown_rx)
                    .await
            {
                tracing::error!(%e, "bridge exited with error");
            }
        });
    }

    // INT/TERM map to the stop command.
    let signal_commands = command_tx.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("signal received; stopping");
        let _ = signal_commands.send(GatewayCommand::Stop).await;
    });

    gateway.run().await?;
    let _ = bridge_shutdown.send(true);
    Ok(())
}

/// Loads `gateway-config.json`, or synthesizes a single-identity
/// config for a legacy data root.
fn load_or_synthesize_config(data: &DataLayout, passphrase: &str) -> Result<GatewayConfig> {
    let path = data.config_path();
    if path.is_file() {
        return GatewayConfig::load(&path);
    }

    if data.is_legacy() {
        let identity = clawchat_identity::store::load(data.root(), passphrase)?;
        let mut config = GatewayConfig::new(DEFAULT_P2P_PORT);
        config.add_identity(IdentityConfig {
            principal: identity.principal().clone(),
            nick: identity.nick().map(str::to_string),
            autoload: true,
            allow_local: false,
            allowed_remote_peers: vec!["*".into()],
            openclaw_wake: false,
        })?;
        tracing::info!(
            principal = %identity.principal(),
            "legacy data root; synthesized single-identity config"
        );
        return Ok(config);
    }

    Err(ClawchatError::Config {
        reason: format!(
            "no gateway config at '{}' — run 'clawchat gateway init' first",
            path.display()
        ),
    })
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            tracing::warn!(%e, "SIGTERM handler unavailable");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

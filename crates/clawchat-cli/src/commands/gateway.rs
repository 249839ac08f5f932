//! Offline gateway-config.json management.

use clap::Subcommand;
use serde_json::{json, Value};

use clawchat_gateway::config::{GatewayConfig, IdentityConfig, DEFAULT_P2P_PORT};
use clawchat_types::Principal;

use crate::Ctx;

#[derive(Subcommand)]
pub enum GatewayAction {
    /// Write a fresh gateway-config.json.
    Init {
        /// P2P listen port.
        #[arg(long, default_value_t = DEFAULT_P2P_PORT)]
        p2p_port: u16,
        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },
    /// Identity entries in the config.
    Identity {
        #[command(subcommand)]
        action: GatewayIdentityAction,
    },
}

#[derive(Subcommand)]
pub enum GatewayIdentityAction {
    /// Add an identity entry.
    Add {
        /// The identity's principal.
        principal: String,
        /// Display nick.
        #[arg(long)]
        nick: Option<String>,
        /// Skip loading at daemon startup.
        #[arg(long)]
        no_autoload: bool,
        /// Admit any local: sender.
        #[arg(long)]
        allow_local: bool,
        /// Allowed remote principal, or "*" (repeatable).
        #[arg(long = "allow")]
        allowed: Vec<String>,
        /// Invoke the wake hook on deliveries.
        #[arg(long)]
        wake: bool,
    },
    /// List configured identities.
    List,
}

pub fn run(ctx: &Ctx, action: GatewayAction) -> Result<Value, String> {
    match action {
        GatewayAction::Init { p2p_port, force } => init(ctx, p2p_port, force),
        GatewayAction::Identity { action } => match action {
            GatewayIdentityAction::Add {
                principal,
                nick,
                no_autoload,
                allow_local,
                allowed,
                wake,
            } => add(ctx, &principal, nick, !no_autoload, allow_local, allowed, wake),
            GatewayIdentityAction::List => list(ctx),
        },
    }
}

fn init(ctx: &Ctx, p2p_port: u16, force: bool) -> Result<Value, String> {
    let path = ctx.data.config_path();
    if path.is_file() && !force {
        return Err(format!(
            "config already exists at '{}' (use --force to overwrite)",
            path.display()
        ));
    }
    let config = GatewayConfig::new(p2p_port);
    config.save(&path).map_err(|e| e.to_string())?;
    Ok(json!({ "config": path, "p2pPort": p2p_port }))
}

#[allow(clippy::too_many_arguments)]
fn add(
    ctx: &Ctx,
    principal: &str,
    nick: Option<String>,
    autoload: bool,
    allow_local: bool,
    allowed: Vec<String>,
    wake: bool,
) -> Result<Value, String> {
    let path = ctx.data.config_path();
    let mut config = GatewayConfig::load(&path).map_err(|e| e.to_string())?;

    let principal = Principal::parse(principal).map_err(|e| e.to_string())?;
    config
        .add_identity(IdentityConfig {
            principal: principal.clone(),
            nick,
            autoload,
            allow_local,
            allowed_remote_peers: allowed,
            openclaw_wake: wake,
        })
        .map_err(|e| e.to_string())?;
    config.save(&path).map_err(|e| e.to_string())?;

    Ok(json!({ "added": principal }))
}

fn list(ctx: &Ctx) -> Result<Value, String> {
    let config = GatewayConfig::load(&ctx.data.config_path()).map_err(|e| e.to_string())?;
    serde_json::to_value(&config.identities).map_err(|e| e.to_string())
}

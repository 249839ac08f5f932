//! Clawchat CLI client.
//!
//! Thin front-end over the daemon's IPC socket plus offline identity
//! and gateway-config management. Every invocation writes exactly one
//! JSON value to stdout and exits 0 on success, nonzero on error.

mod commands;
mod ipc_client;
mod output;

#[cfg(test)]
mod tests;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use clawchat_storage::DataLayout;

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

/// Clawchat — peer-to-peer encrypted messaging for agents.
#[derive(Parser)]
#[command(name = "clawchat", version, about)]
struct Cli {
    /// Data directory (default: $CLAWCHAT_HOME, else ~/.clawchat).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Identity passphrase for offline operations.
    #[arg(
        long,
        global = true,
        env = "CLAWCHAT_PASSPHRASE",
        hide_env_values = true
    )]
    passphrase: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, recover, and inspect identities.
    Identity {
        #[command(subcommand)]
        action: commands::identity::IdentityAction,
    },
    /// Manage gateway-config.json.
    Gateway {
        #[command(subcommand)]
        action: commands::gateway::GatewayAction,
    },
    /// Start, query, and stop the daemon.
    Daemon {
        #[command(subcommand)]
        action: commands::daemon::DaemonAction,
    },
    /// Send a message.
    Send {
        /// Recipient principal.
        to: String,
        /// Message body.
        message: String,
        /// Identity to send as (nick or principal).
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Receive messages, optionally long-polling.
    Recv {
        /// Only messages newer than this timestamp (ms since epoch).
        #[arg(long)]
        since: Option<i64>,
        /// Block up to this many milliseconds for new deliveries.
        #[arg(long)]
        timeout: Option<u64>,
        /// Identity to receive as.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Full inbox snapshot.
    Inbox {
        /// Identity to inspect.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Full outbox snapshot.
    Outbox {
        /// Identity to inspect.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Peer book operations.
    Peers {
        #[command(subcommand)]
        action: commands::peers::PeersAction,
    },
}

// ---------------------------------------------------------------------------
// Shared context
// ---------------------------------------------------------------------------

/// Global options threaded into every command handler.
pub struct Ctx {
    pub data: DataLayout,
    pub passphrase: Option<String>,
}

impl Ctx {
    /// The passphrase, or an error message for offline commands that
    /// need one.
    pub fn require_passphrase(&self) -> Result<&str, String> {
        self.passphrase
            .as_deref()
            .ok_or_else(|| "no passphrase: pass --passphrase or set CLAWCHAT_PASSPHRASE".into())
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let ctx = Ctx {
        data: cli
            .data_dir
            .map(DataLayout::new)
            .unwrap_or_else(DataLayout::default_root),
        passphrase: cli.passphrase,
    };

    let result = dispatch(&ctx, cli.command).await;
    match result {
        Ok(value) => {
            output::print_value(&value);
        }
        Err(e) => {
            output::print_error(&e);
            std::process::exit(1);
        }
    }
}

async fn dispatch(ctx: &Ctx, command: Commands) -> Result<serde_json::Value, String> {
    match command {
        Commands::Identity { action } => commands::identity::run(ctx, action),
        Commands::Gateway { action } => commands::gateway::run(ctx, action),
        Commands::Daemon { action } => commands::daemon::run(ctx, action).await,
        Commands::Send {
            to,
            message,
            as_identity,
        } => commands::message::send(ctx, &to, &message, as_identity.as_deref()).await,
        Commands::Recv {
            since,
            timeout,
            as_identity,
        } => commands::message::recv(ctx, since, timeout, as_identity.as_deref()).await,
        Commands::Inbox { as_identity } => {
            commands::message::mailbox(ctx, "inbox", as_identity.as_deref()).await
        }
        Commands::Outbox { as_identity } => {
            commands::message::mailbox(ctx, "outbox", as_identity.as_deref()).await
        }
        Commands::Peers { action } => commands::peers::run(ctx, action).await,
    }
}

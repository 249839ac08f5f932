//! Peer book commands: list, add, remove, resolve, connect.

use clap::Subcommand;
use serde_json::{json, Value};

use crate::{ipc_client, Ctx};

#[derive(Subcommand)]
pub enum PeersAction {
    /// List peers with live connection state.
    List {
        /// Identity whose peer book to read.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Add or extend a peer record.
    Add {
        /// The peer's principal.
        principal: String,
        /// A multi-address or legacy host:port.
        address: Option<String>,
        /// Local display alias.
        #[arg(long)]
        alias: Option<String>,
        /// PX-1 sharing class: public, friends, or private.
        #[arg(long)]
        visibility: Option<String>,
        /// Identity whose peer book to extend.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Remove a peer record.
    Remove {
        /// The peer's principal.
        principal: String,
        /// Identity whose peer book to edit.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Resolve a principal's contact record over PX-1.
    Resolve {
        /// The principal to resolve.
        principal: String,
        /// Only ask the session with this remote.
        #[arg(long)]
        through: Option<String>,
        /// Identity to resolve as.
        #[arg(long = "as")]
        as_identity: Option<String>,
    },
    /// Dial a multi-address and authenticate.
    Connect {
        /// Target multi-address or legacy host:port.
        multiaddr: String,
    },
}

pub async fn run(ctx: &Ctx, action: PeersAction) -> Result<Value, String> {
    let (request, extra_wait) = match action {
        PeersAction::List { as_identity } => (with_as(json!({ "cmd": "peers" }), as_identity), None),
        PeersAction::Add {
            principal,
            address,
            alias,
            visibility,
            as_identity,
        } => {
            let mut request = json!({ "cmd": "peer_add", "principal": principal });
            if let Some(address) = address {
                request["address"] = Value::String(address);
            }
            if let Some(alias) = alias {
                request["alias"] = Value::String(alias);
            }
            if let Some(visibility) = visibility {
                request["visibility"] = Value::String(visibility);
            }
            (with_as(request, as_identity), None)
        }
        PeersAction::Remove {
            principal,
            as_identity,
        } => (
            with_as(json!({ "cmd": "peer_remove", "principal": principal }), as_identity),
            None,
        ),
        PeersAction::Resolve {
            principal,
            through,
            as_identity,
        } => {
            let mut request = json!({ "cmd": "peer_resolve", "principal": principal });
            if let Some(through) = through {
                request["through"] = Value::String(through);
            }
            (
                with_as(request, as_identity),
                Some(std::time::Duration::from_secs(15)),
            )
        }
        PeersAction::Connect { multiaddr } => {
            (json!({ "cmd": "connect", "multiaddr": multiaddr }), None)
        }
    };

    let response = ipc_client::request(&ctx.data.socket_path(), request, extra_wait).await?;
    ipc_client::into_data(response)
}

fn with_as(mut request: Value, as_identity: Option<String>) -> Value {
    if let Some(selector) = as_identity {
        request["as"] = Value::String(selector);
    }
    request
}

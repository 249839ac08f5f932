//! Commands into the gateway event loop.
//!
//! The IPC server, the WebSocket bridge, and tests all drive the
//! gateway through this channel-based API: one [`GatewayCommand`] in,
//! one `oneshot` reply out. The event loop is the only task that
//! touches gateway state.

use serde::Serialize;
use tokio::sync::oneshot;

use clawchat_types::{Message, MessageId, PeerRecord, Principal, Result, Timestamp};

use clawchat_protocol::PxRecord;

/// A peer book record plus its live connection state.
#[derive(Clone, Debug, Serialize)]
pub struct PeerInfo {
    /// The stored record.
    #[serde(flatten)]
    pub record: PeerRecord,
    /// True when an authenticated session to this principal exists.
    pub connected: bool,
}

/// `status` command payload.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusInfo {
    /// Principal of the selected identity.
    pub principal: Principal,
    /// The transport peer id.
    pub peer_id: String,
    /// Configured P2P port.
    pub p2p_port: u16,
    /// Active listen addresses.
    pub multiaddrs: Vec<String>,
    /// Principals with authenticated sessions on the selected identity.
    pub connected_peers: Vec<Principal>,
    /// Inbox size of the selected identity.
    pub inbox_count: usize,
    /// Outbox size of the selected identity.
    pub outbox_count: usize,
    /// All loaded principals.
    pub loaded_identities: Vec<Principal>,
}

/// One request into the event loop.
pub enum GatewayCommand {
    /// Queue an outbound message and attempt immediate delivery.
    Send {
        /// `--as` selector (nick or principal); default identity when
        /// absent.
        as_identity: Option<String>,
        /// Recipient principal string.
        to: String,
        /// Message body.
        content: String,
        /// Replies with the generated message id.
        reply: oneshot::Sender<Result<MessageId>>,
    },
    /// Inbox entries newer than `since` plus the resolved principal —
    /// the first half of the `recv` long-poll.
    Recv {
        as_identity: Option<String>,
        since: Timestamp,
        reply: oneshot::Sender<Result<(Principal, Vec<Message>)>>,
    },
    /// Full inbox snapshot.
    Inbox {
        as_identity: Option<String>,
        reply: oneshot::Sender<Result<Vec<Message>>>,
    },
    /// Full outbox snapshot.
    Outbox {
        as_identity: Option<String>,
        reply: oneshot::Sender<Result<Vec<Message>>>,
    },
    /// Peer book with live `connected` flags.
    Peers {
        as_identity: Option<String>,
        reply: oneshot::Sender<Result<Vec<PeerInfo>>>,
    },
    /// Add or extend a peer record.
    PeerAdd {
        as_identity: Option<String>,
        principal: String,
        address: Option<String>,
        alias: Option<String>,
        /// PX-1 sharing class: "public", "friends", or "private".
        visibility: Option<String>,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Remove a peer record.
    PeerRemove {
        as_identity: Option<String>,
        principal: String,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Best-effort PX-1 resolve of a principal's contact record.
    PeerResolve {
        as_identity: Option<String>,
        principal: String,
        /// Restrict the query to the session with this remote.
        through: Option<String>,
        reply: oneshot::Sender<Result<Option<PxRecord>>>,
    },
    /// Daemon status for one identity.
    Status {
        as_identity: Option<String>,
        reply: oneshot::Sender<Result<StatusInfo>>,
    },
    /// Active listen addresses.
    Multiaddrs {
        reply: oneshot::Sender<Result<Vec<String>>>,
    },
    /// Dial a multi-address and authenticate as the default identity.
    Connect {
        multiaddr: String,
        reply: oneshot::Sender<Result<Principal>>,
    },
    /// Begin orderly shutdown.
    Stop,
}

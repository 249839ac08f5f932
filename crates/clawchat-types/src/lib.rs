//! Core shared types for the Clawchat agent messaging gateway.
//!
//! Every crate in the workspace builds on the types defined here —
//! principals, mailbox messages, peer records, gateway events, and the
//! unified [`ClawchatError`] enum. No other crate defines shared types.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// IdentityMode
// ---------------------------------------------------------------------------

/// The two identity flavors a gateway can host.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityMode {
    /// Standalone Ed25519 keypair; principal embeds the public key.
    Local,
    /// BIP39-seeded secp256k1 wallet; principal carries the chain address.
    Stacks,
}

impl fmt::Display for IdentityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Stacks => write!(f, "stacks"),
        }
    }
}

// ---------------------------------------------------------------------------
// Principal
// ---------------------------------------------------------------------------

/// Stable string identifier for an actor, prefixed by identity mode.
///
/// - `local:<64 lowercase hex chars>` — the Ed25519 public key itself.
/// - `stacks:<c32check address>` — the wallet address (`SP…` / `ST…`).
///
/// Principal → identity is injective within a gateway process.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    /// Prefix for local-mode principals.
    pub const LOCAL_PREFIX: &'static str = "local:";
    /// Prefix for stacks-mode principals.
    pub const STACKS_PREFIX: &'static str = "stacks:";

    /// Parses and validates a principal string.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(hex_part) = s.strip_prefix(Self::LOCAL_PREFIX) {
            if hex_part.len() != 64
                || !hex_part.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase())
            {
                return Err(ClawchatError::Protocol {
                    reason: format!(
                        "local principal must carry 64 lowercase hex chars, got '{s}'"
                    ),
                });
            }
            return Ok(Self(s.to_string()));
        }

        if let Some(addr) = s.strip_prefix(Self::STACKS_PREFIX) {
            if addr.is_empty() || !addr.starts_with('S') {
                return Err(ClawchatError::Protocol {
                    reason: format!("stacks principal must carry an S-prefixed address, got '{s}'"),
                });
            }
            return Ok(Self(s.to_string()));
        }

        Err(ClawchatError::Protocol {
            reason: format!("principal must begin with 'local:' or 'stacks:', got '{s}'"),
        })
    }

    /// Builds a local-mode principal from a 32-byte Ed25519 public key.
    pub fn local_from_public_key(public_key: &[u8; 32]) -> Self {
        Self(format!("{}{}", Self::LOCAL_PREFIX, hex::encode(public_key)))
    }

    /// Builds a stacks-mode principal from a c32check address.
    pub fn stacks_from_address(address: &str) -> Self {
        Self(format!("{}{}", Self::STACKS_PREFIX, address))
    }

    /// Returns the identity mode encoded in the prefix.
    pub fn mode(&self) -> IdentityMode {
        if self.0.starts_with(Self::STACKS_PREFIX) {
            IdentityMode::Stacks
        } else {
            IdentityMode::Local
        }
    }

    /// Returns the part after the mode prefix.
    pub fn suffix(&self) -> &str {
        self.0
            .split_once(':')
            .map(|(_, rest)| rest)
            .unwrap_or(&self.0)
    }

    /// Returns the full principal string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Principal {
    type Err = ClawchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// NodeKey
// ---------------------------------------------------------------------------

/// Ephemeral 32-byte Ed25519 public key that terminates a transport
/// session. Bound to a principal only by a valid attestation.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeKey([u8; 32]);

impl NodeKey {
    /// Fixed byte length of a node key.
    pub const LEN: usize = 32;

    /// Creates a `NodeKey` from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<NodeKey> for String {
    fn from(k: NodeKey) -> String {
        k.to_string()
    }
}

impl TryFrom<String> for NodeKey {
    type Error = ClawchatError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let bytes = hex::decode(&s).map_err(|_| ClawchatError::Protocol {
            reason: "node key is not valid hex".into(),
        })?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| ClawchatError::Protocol {
            reason: "node key must be 32 bytes".into(),
        })?;
        Ok(Self(arr))
    }
}

impl FromStr for NodeKey {
    type Err = ClawchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// MessageId
// ---------------------------------------------------------------------------

/// Random 128-bit message identifier, rendered as 32 hex chars.
///
/// Unique within a mailbox; senders must generate fresh ids, receivers
/// drop duplicates silently.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MessageId([u8; 16]);

impl MessageId {
    /// Fixed byte length of a message id.
    pub const LEN: usize = 16;

    /// Generates a fresh random id from OS entropy.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Creates a `MessageId` from raw bytes.
    pub fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<MessageId> for String {
    fn from(id: MessageId) -> String {
        id.to_string()
    }
}

impl TryFrom<String> for MessageId {
    type Error = ClawchatError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        let bytes = hex::decode(&s).map_err(|_| ClawchatError::Protocol {
            reason: "message id is not valid hex".into(),
        })?;
        let arr: [u8; 16] = bytes.try_into().map_err(|_| ClawchatError::Protocol {
            reason: "message id must be 16 bytes".into(),
        })?;
        Ok(Self(arr))
    }
}

impl FromStr for MessageId {
    type Err = ClawchatError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Timestamp
// ---------------------------------------------------------------------------

/// Milliseconds since the Unix epoch, UTC.
#[derive(
    Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    /// Creates a `Timestamp` from raw epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns epoch milliseconds.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Returns epoch seconds (truncating).
    pub fn as_secs(&self) -> i64 {
        self.0 / 1000
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// MessageStatus
// ---------------------------------------------------------------------------

/// Delivery state of a mailbox message.
///
/// `Pending`/`Sent`/`Failed` appear only in outboxes; `Delivered` only
/// in inboxes. `Failed` is set exclusively by administrative action.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// Queued in the sender's outbox, not yet on the wire.
    Pending,
    /// Written to an authenticated session.
    Sent,
    /// Accepted into a recipient's inbox.
    Delivered,
    /// Administratively abandoned.
    Failed,
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Sent => write!(f, "sent"),
            Self::Delivered => write!(f, "delivered"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A mailbox entry — one direct message between two principals.
///
/// Inbox messages are authenticated: `from` equals the remote end of
/// the session that delivered them.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Random 128-bit identifier, unique within a mailbox.
    pub id: MessageId,
    /// Sender principal.
    pub from: Principal,
    /// Sender's display nick at send time, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_nick: Option<String>,
    /// Recipient principal.
    pub to: Principal,
    /// Message body, treated as UTF-8 text at the boundary.
    pub content: String,
    /// Creation time, ms since epoch.
    pub timestamp: Timestamp,
    /// Current delivery state.
    pub status: MessageStatus,
}

// ---------------------------------------------------------------------------
// Visibility
// ---------------------------------------------------------------------------

/// PX-1 sharing class of a peer record.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Gossipable to anyone.
    #[default]
    Public,
    /// Shared only over authenticated sessions.
    Friends,
    /// Never shared.
    Private,
}

// ---------------------------------------------------------------------------
// PeerRecord
// ---------------------------------------------------------------------------

/// A peer book entry, keyed by remote principal within one identity.
///
/// Addresses form a set and merge on every learn event; `verified` is
/// true only when this gateway itself authenticated a session with the
/// principal — gossip never upgrades it.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    /// Remote principal this record describes.
    pub principal: Principal,
    /// Known multi-addresses, deduplicated.
    #[serde(default)]
    pub addresses: BTreeSet<String>,
    /// Local display alias, if assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    /// Node public key observed at last authentication, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_key: Option<NodeKey>,
    /// True iff this gateway authenticated a session with the peer.
    #[serde(default)]
    pub verified: bool,
    /// PX-1 sharing class.
    #[serde(default)]
    pub visibility: Visibility,
    /// Principal that gossiped this record, for non-first-hand entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<Principal>,
    /// When the record was first created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<Timestamp>,
    /// Last authentication or gossip sighting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Timestamp>,
}

impl PeerRecord {
    /// Creates a minimal record for a principal with no addresses.
    pub fn new(principal: Principal) -> Self {
        Self {
            principal,
            addresses: BTreeSet::new(),
            alias: None,
            node_key: None,
            verified: false,
            visibility: Visibility::default(),
            source: None,
            first_seen: Some(Timestamp::now()),
            last_seen: None,
        }
    }
}

// ---------------------------------------------------------------------------
// GatewayEvent
// ---------------------------------------------------------------------------

/// Push events fanned out to IPC subscribers and the WebSocket bridge.
#[derive(Clone, Debug)]
pub enum GatewayEvent {
    /// The daemon finished startup; fires before any other event.
    Started,
    /// A message was delivered into an identity's inbox.
    Message {
        /// The receiving identity.
        identity: Principal,
        /// The delivered message.
        message: Message,
    },
    /// A session reached the authenticated state.
    PeerConnected {
        /// Local identity side of the session.
        identity: Principal,
        /// Remote principal.
        remote: Principal,
    },
    /// A session closed.
    PeerDisconnected {
        /// Local identity side of the session.
        identity: Principal,
        /// Remote principal.
        remote: Principal,
    },
    /// A background failure worth surfacing.
    Error {
        /// Short human-readable description.
        message: String,
    },
}

impl GatewayEvent {
    /// Renders the event as one IPC event object (`type` field instead
    /// of `ok`).
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Started => serde_json::json!({ "type": "started" }),
            Self::Message { identity, message } => serde_json::json!({
                "type": "message",
                "identity": identity,
                "message": message,
            }),
            Self::PeerConnected { identity, remote } => serde_json::json!({
                "type": "p2p:connected",
                "identity": identity,
                "remote": remote,
            }),
            Self::PeerDisconnected { identity, remote } => serde_json::json!({
                "type": "p2p:disconnected",
                "identity": identity,
                "remote": remote,
            }),
            Self::Error { message } => serde_json::json!({
                "type": "error",
                "message": message,
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ClawchatError
// ---------------------------------------------------------------------------

/// Central error type for the Clawchat system.
///
/// One variant per error kind the gateway distinguishes. All crates in
/// the workspace convert their internal failures into these variants.
#[derive(Debug, Error)]
pub enum ClawchatError {
    /// An identity, peer, or message could not be found.
    #[error("not found: {what}")]
    NotFound {
        /// What was looked up.
        what: String,
    },

    /// Authentication failed: bad passphrase, invalid attestation, or
    /// an ACL deny.
    #[error("auth error: {reason}")]
    Auth {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A dial or stream operation failed.
    #[error("transport error: {reason}")]
    Transport {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// A malformed frame, bad encoding, or wrong protocol version.
    #[error("protocol error: {reason}")]
    Protocol {
        /// Human-readable description of the failure.
        reason: String,
    },

    /// An invalid configuration file or value.
    #[error("config error: {reason}")]
    Config {
        /// Human-readable description of the problem.
        reason: String,
    },

    /// A uniqueness violation (duplicate nick, identity exists).
    #[error("conflict: {reason}")]
    Conflict {
        /// Human-readable description of the collision.
        reason: String,
    },

    /// A disk read/write failure on durable state. Mailbox write
    /// failures are fatal to the daemon after a brief retry.
    #[error("storage error: {reason}")]
    Storage {
        /// Human-readable description of the failure.
        reason: String,
    },
}

/// Convenience result type using [`ClawchatError`].
pub type Result<T> = std::result::Result<T, ClawchatError>;

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

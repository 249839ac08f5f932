//! SNaP2P session engine.
//!
//! A session pairs one local identity with one remote principal over
//! a single transport stream. The dialer speaks first: it sends its
//! hello (attestation + target principal) and then reads the
//! responder's. The responder reads first so it can pick the hosted
//! identity the dialer asked for, then answers with that identity's
//! attestation.
//!
//! Either side closes on: an invalid attestation, an attested node
//! key that differs from the one the transport reports, an oversize
//! frame, or a read error. After authentication the stream is split;
//! a reader task forwards inbound frames to the event loop and a
//! writer task drains the outbound queue.

use std::collections::HashMap;
use std::time::Duration;

use futures::{AsyncReadExt, AsyncWriteExt};
use libp2p::PeerId;
use tokio::sync::{mpsc, oneshot};

use clawchat_identity::attestation::{create_attestation, verify_attestation};
use clawchat_identity::Identity;
use clawchat_protocol::frame::{read_frame, write_frame, Frame, HelloFrame};
use clawchat_types::{ClawchatError, NodeKey, Principal, Result, Timestamp};

use crate::manager::HandshakeCatalog;

/// Deadline for a dial plus handshake.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Outbound frame queue depth per session.
const SESSION_QUEUE_SIZE: usize = 64;

// ---------------------------------------------------------------------------
// Events & commands
// ---------------------------------------------------------------------------

/// What session tasks report back to the event loop.
pub enum SessionEvent {
    /// An inbound handshake completed; the loop should register the
    /// session and start its I/O tasks.
    InboundEstablished {
        /// Transport peer on the other end.
        peer: PeerId,
        /// The local identity that answered.
        local: Principal,
        /// The authenticated remote principal.
        remote: Principal,
        /// Node key bound by the remote's attestation.
        remote_node_key: NodeKey,
        /// The authenticated stream.
        stream: libp2p::Stream,
    },
    /// An inbound handshake failed; log-only.
    HandshakeFailed {
        /// Transport peer on the other end.
        peer: PeerId,
        /// Why, distinguishable in logs from a timeout.
        reason: String,
    },
    /// A frame arrived on an authenticated session.
    Frame {
        /// The session it arrived on.
        session_id: u64,
        /// The decoded frame.
        frame: Frame,
    },
    /// A session's stream ended.
    Closed {
        /// The session that closed.
        session_id: u64,
        /// Close cause for logs.
        reason: String,
    },
}

/// One queued outbound frame.
pub struct SessionCommand {
    /// Frame to write.
    pub frame: Frame,
    /// Optional write acknowledgement for callers that need
    /// transport-level success (the delivery engine does).
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

// ---------------------------------------------------------------------------
// Handshakes
// ---------------------------------------------------------------------------

/// Drives the dialer half of the handshake on a fresh stream.
///
/// Returns the authenticated remote principal. `target` names the
/// principal we want on the other end; `None` accepts whichever
/// identity the responder answers with (used by `connect`).
pub async fn handshake_outbound(
    stream: &mut libp2p::Stream,
    identity: &Identity,
    gateway_node_key: NodeKey,
    remote_transport_key: NodeKey,
    target: Option<&Principal>,
) -> Result<Principal> {
    let attestation = create_attestation(identity, gateway_node_key, None)?;
    write_frame(
        stream,
        &Frame::Hello(HelloFrame {
            attestation,
            target: target.cloned(),
        }),
    )
    .await?;

    let hello = expect_hello(read_frame(stream).await?)?;
    check_remote_attestation(&hello, remote_transport_key)?;
    Ok(hello.attestation.principal)
}

/// Drives the responder half of the handshake on an accepted stream.
///
/// Returns `(local identity principal, remote principal)`.
pub async fn handshake_inbound(
    stream: &mut libp2p::Stream,
    catalog: &HandshakeCatalog,
    gateway_node_key: NodeKey,
    remote_transport_key: NodeKey,
) -> Result<(Principal, Principal)> {
    let hello = expect_hello(read_frame(stream).await?)?;
    check_remote_attestation(&hello, remote_transport_key)?;
    let remote = hello.attestation.principal.clone();

    let (local, identity) = catalog.select(hello.target.as_ref())?;
    let attestation = create_attestation(&identity, gateway_node_key, None)?;
    write_frame(
        stream,
        &Frame::Hello(HelloFrame {
            attestation,
            target: Some(remote.clone()),
        }),
    )
    .await?;

    Ok((local, remote))
}

fn expect_hello(frame: Frame) -> Result<HelloFrame> {
    match frame {
        Frame::Hello(hello) => Ok(hello),
        other => Err(ClawchatError::Protocol {
            reason: format!("expected hello frame, got {}", other.kind()),
        }),
    }
}

fn check_remote_attestation(hello: &HelloFrame, remote_transport_key: NodeKey) -> Result<()> {
    verify_attestation(&hello.attestation)?;
    if hello.attestation.node_key != remote_transport_key {
        return Err(ClawchatError::Auth {
            reason: format!(
                "attested node key {} does not match transport key {}",
                hello.attestation.node_key, remote_transport_key
            ),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Session I/O tasks
// ---------------------------------------------------------------------------

/// Splits an authenticated stream into reader and writer tasks.
///
/// The reader forwards frames to `events`; the writer drains the
/// returned queue. Dropping every queue sender closes the write half,
/// which ends the session.
pub fn spawn_session_io(
    session_id: u64,
    stream: libp2p::Stream,
    events: mpsc::Sender<SessionEvent>,
) -> mpsc::Sender<SessionCommand> {
    let (tx, mut rx) = mpsc::channel::<SessionCommand>(SESSION_QUEUE_SIZE);
    let (mut read_half, mut write_half) = stream.split();

    // Reader: frames in order until the stream ends.
    tokio::spawn(async move {
        loop {
            match read_frame(&mut read_half).await {
                Ok(frame) => {
                    if events
                        .send(SessionEvent::Frame { session_id, frame })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                Err(e) => {
                    let _ = events
                        .send(SessionEvent::Closed {
                            session_id,
                            reason: e.to_string(),
                        })
                        .await;
                    return;
                }
            }
        }
    });

    // Writer: queue until all senders drop, then half-close.
    tokio::spawn(async move {
        while let Some(SessionCommand { frame, reply }) = rx.recv().await {
            let result = write_frame(&mut write_half, &frame).await;
            let failed = result.is_err();
            if let Some(reply) = reply {
                let _ = reply.send(result);
            } else if failed {
                tracing::debug!(session_id, "session write failed");
            }
            if failed {
                break;
            }
        }
        let _ = write_half.close().await;
    });

    tx
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

/// One authenticated session's loop-side bookkeeping.
pub struct Session {
    /// Loop-assigned id.
    pub id: u64,
    /// Local identity principal.
    pub local: Principal,
    /// Authenticated remote principal.
    pub remote: Principal,
    /// Node key from the remote's attestation.
    pub remote_node_key: NodeKey,
    /// Transport peer behind the session.
    pub peer: PeerId,
    /// Outbound frame queue.
    pub tx: mpsc::Sender<SessionCommand>,
    /// When the session authenticated.
    pub created_at: Timestamp,
    /// Most recent successful send or receive.
    pub last_used: Timestamp,
}

/// All live sessions, indexed by id and by (local, remote) pair.
///
/// Invariant: at most one authenticated session per pair; registering
/// a duplicate evicts the older session.
#[derive(Default)]
pub struct SessionTable {
    next_id: u64,
    by_id: HashMap<u64, Session>,
    by_pair: HashMap<(Principal, Principal), u64>,
}

impl SessionTable {
    /// Allocates the next session id.
    pub fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Registers an authenticated session, returning the evicted
    /// older session for the same pair, if any.
    pub fn register(&mut self, session: Session) -> Option<Session> {
        let pair = (session.local.clone(), session.remote.clone());
        let evicted = self
            .by_pair
            .insert(pair, session.id)
            .and_then(|old_id| self.by_id.remove(&old_id));
        self.by_id.insert(session.id, session);
        evicted
    }

    /// Removes a session by id (stream closed).
    pub fn remove(&mut self, session_id: u64) -> Option<Session> {
        let session = self.by_id.remove(&session_id)?;
        let pair = (session.local.clone(), session.remote.clone());
        // Only clear the pair index if it still points at this session.
        if self.by_pair.get(&pair) == Some(&session_id) {
            self.by_pair.remove(&pair);
        }
        Some(session)
    }

    /// Looks up a session by id.
    pub fn get(&self, session_id: u64) -> Option<&Session> {
        self.by_id.get(&session_id)
    }

    /// Mutable lookup by id.
    pub fn get_mut(&mut self, session_id: u64) -> Option<&mut Session> {
        self.by_id.get_mut(&session_id)
    }

    /// The authenticated session for a (local, remote) pair.
    pub fn for_pair(&self, local: &Principal, remote: &Principal) -> Option<&Session> {
        let id = self.by_pair.get(&(local.clone(), remote.clone()))?;
        self.by_id.get(id)
    }

    /// All sessions of one local identity, most recently used first.
    pub fn for_identity(&self, local: &Principal) -> Vec<&Session> {
        let mut sessions: Vec<&Session> = self
            .by_id
            .values()
            .filter(|s| &s.local == local)
            .collect();
        sessions.sort_by(|a, b| b.last_used.cmp(&a.last_used).then(a.remote.cmp(&b.remote)));
        sessions
    }

    /// Remote principals connected to one local identity.
    pub fn connected_remotes(&self, local: &Principal) -> Vec<Principal> {
        let mut remotes: Vec<Principal> = self
            .by_id
            .values()
            .filter(|s| &s.local == local)
            .map(|s| s.remote.clone())
            .collect();
        remotes.sort();
        remotes.dedup();
        remotes
    }

    /// Whether any session exists to `remote` on `local`.
    pub fn is_connected(&self, local: &Principal, remote: &Principal) -> bool {
        self.by_pair.contains_key(&(local.clone(), remote.clone()))
    }

    /// Every live session.
    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.by_id.values()
    }

    /// Drains the table for shutdown.
    pub fn drain(&mut self) -> Vec<Session> {
        self.by_pair.clear();
        self.by_id.drain().map(|(_, s)| s).collect()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Whether no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

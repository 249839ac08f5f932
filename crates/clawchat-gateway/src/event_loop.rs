//! The gateway event loop.
//!
//! One task owns all mutable daemon state — the identity manager, the
//! session table, pending PX resolves, and the peer address cache —
//! and multiplexes:
//!
//! 1. Commands from IPC / bridge / tests.
//! 2. Transport events (incoming streams, connection lifecycle).
//! 3. Session events (frames, closures, finished handshakes).
//! 4. The 5 s pending-delivery tick.
//! 5. The 60 s PX-1 broadcast tick.
//!
//! Handshakes and per-session I/O run in their own tasks; every
//! result funnels back here, so state mutations are serialized.

use std::collections::HashMap;
use std::time::Duration;

use libp2p::{Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;

use clawchat_network::keys::node_key_from_peer_id;
use clawchat_network::{normalize_multiaddr, NetworkEvent, NetworkHandle};
use clawchat_protocol::frame::Frame;
use clawchat_protocol::px::PxRecord;
use clawchat_storage::DataLayout;
use clawchat_types::{
    ClawchatError, GatewayEvent, Message, MessageId, MessageStatus, NodeKey, Principal, Result,
    Timestamp,
};

use crate::command::{GatewayCommand, PeerInfo, StatusInfo};
use crate::config::GatewayConfig;
use crate::manager::IdentityManager;
use crate::session::{
    handshake_inbound, handshake_outbound, spawn_session_io, Session, SessionEvent, SessionTable,
    HANDSHAKE_TIMEOUT,
};
use crate::wake::{self, WakeMode};

/// Pending-delivery retry period.
pub const RETRY_TICK: Duration = Duration::from_secs(5);

/// PX-1 broadcast period.
pub const PX_TICK: Duration = Duration::from_secs(60);

/// Wait on a session write acknowledgement.
pub(crate) const SEND_ACK_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for a `peer_resolve` round.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(10);

/// Command channel capacity.
const COMMAND_CHANNEL_SIZE: usize = 256;

/// Session event channel capacity, sized for delivery bursts.
const SESSION_EVENT_CHANNEL_SIZE: usize = 1024;

/// Broadcast fan-out capacity for IPC / bridge subscribers.
const EVENT_FANOUT_SIZE: usize = 256;

// ---------------------------------------------------------------------------
// Pending PX resolves
// ---------------------------------------------------------------------------

/// An in-flight `peer_resolve` waiting on PX responses.
pub(crate) struct PendingResolve {
    /// Sessions the request went out on.
    pub session_ids: Vec<u64>,
    /// Outstanding answers before the fallback fires.
    pub remaining: usize,
    /// The principal being resolved.
    pub principal: Principal,
    /// Identity whose peer book serves as fallback.
    pub local: Principal,
    /// Caller reply slot; taken on first answer.
    pub reply: Option<oneshot::Sender<Result<Option<PxRecord>>>>,
    /// When the fallback fires regardless.
    pub deadline: Instant,
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

/// The daemon core. Construct with [`Gateway::new`], then drive with
/// [`Gateway::run`].
pub struct Gateway {
    pub(crate) data: DataLayout,
    pub(crate) config: GatewayConfig,
    pub(crate) manager: IdentityManager,
    pub(crate) node_key: NodeKey,
    pub(crate) network: NetworkHandle,
    net_events: mpsc::UnboundedReceiver<NetworkEvent>,
    pub(crate) sessions: SessionTable,
    pub(crate) session_events_tx: mpsc::Sender<SessionEvent>,
    session_events_rx: mpsc::Receiver<SessionEvent>,
    pub(crate) events: broadcast::Sender<GatewayEvent>,
    command_tx: mpsc::Sender<GatewayCommand>,
    command_rx: mpsc::Receiver<GatewayCommand>,
    pub(crate) peer_addrs: HashMap<PeerId, Multiaddr>,
    pub(crate) pending_resolves: Vec<PendingResolve>,
    wake_hook: Option<String>,
    ipc_shutdown: watch::Sender<bool>,
    stopping: bool,
    fatal: Option<String>,
}

impl Gateway {
    /// Loads identities, brings up the transport, and assembles the
    /// loop. Config errors abort here, before anything binds.
    pub fn new(data: DataLayout, config: GatewayConfig, passphrase: &str) -> Result<Self> {
        config.validate()?;

        let mut manager = IdentityManager::new();
        for entry in config.autoload_identities() {
            manager.load(&data, entry, passphrase)?;
        }

        // The transport node key comes from the default identity's
        // stored keypair: a stable PeerId across restarts. Stacks
        // identities store a distinct node keypair for exactly this.
        let default = manager.default_principal()?.clone();
        let seed = manager.get(&default)?.identity.transport_seed();
        let node_key = manager.get(&default)?.identity.stored_node_key();

        let (network, net_events, _net_task) =
            clawchat_network::spawn(&seed, config.p2p_port)?;

        let (session_events_tx, session_events_rx) = mpsc::channel(SESSION_EVENT_CHANNEL_SIZE);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
        let (events, _) = broadcast::channel(EVENT_FANOUT_SIZE);
        let (ipc_shutdown, _) = watch::channel(false);
        let wake_hook = config.wake_hook_program();

        Ok(Self {
            data,
            config,
            manager,
            node_key,
            network,
            net_events,
            sessions: SessionTable::default(),
            session_events_tx,
            session_events_rx,
            events,
            command_tx,
            command_rx,
            peer_addrs: HashMap::new(),
            pending_resolves: Vec::new(),
            wake_hook,
            ipc_shutdown,
            stopping: false,
            fatal: None,
        })
    }

    /// Sender for driving the gateway (IPC server, bridge, tests).
    pub fn command_sender(&self) -> mpsc::Sender<GatewayCommand> {
        self.command_tx.clone()
    }

    /// Event fan-out for IPC subscribers and the bridge.
    pub fn event_sender(&self) -> broadcast::Sender<GatewayEvent> {
        self.events.clone()
    }

    /// The gateway's transport node key.
    pub fn node_key(&self) -> NodeKey {
        self.node_key
    }

    /// Runs until `stop` (or a fatal mailbox failure), then shuts
    /// down in order: IPC accept, retry tick, sessions, transport,
    /// pid file and socket.
    pub async fn run(mut self) -> Result<()> {
        self.write_pid_file()?;
        self.start_ipc()?;

        // `started` strictly precedes every other event.
        let _ = self.events.send(GatewayEvent::Started);
        tracing::info!(
            peer_id = %self.network.local_peer_id(),
            identities = self.manager.principals().len(),
            "gateway started"
        );

        let mut retry_tick = tokio::time::interval(RETRY_TICK);
        let mut px_tick = tokio::time::interval(PX_TICK);

        while !self.stopping {
            tokio::select! {
                Some(cmd) = self.command_rx.recv() => {
                    self.handle_command(cmd).await;
                }

                Some(event) = self.net_events.recv() => {
                    self.handle_net_event(event);
                }

                Some(event) = self.session_events_rx.recv() => {
                    self.handle_session_event(event).await;
                }

                _ = retry_tick.tick() => {
                    self.expire_resolves();
                    self.process_pending_tick().await;
                }

                _ = px_tick.tick() => {
                    self.px_broadcast().await;
                }
            }

            if let Some(reason) = self.fatal.take() {
                tracing::error!(%reason, "fatal storage failure; shutting down");
                let _ = self.events.send(GatewayEvent::Error { message: reason });
                self.stopping = true;
            }
        }

        self.shutdown_sequence().await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: GatewayCommand) {
        match cmd {
            GatewayCommand::Send {
                as_identity,
                to,
                content,
                reply,
            } => {
                let result = self.queue_and_send(as_identity.as_deref(), &to, content).await;
                let _ = reply.send(result);
            }

            GatewayCommand::Recv {
                as_identity,
                since,
                reply,
            } => {
                let result = (|| {
                    let principal = self.manager.resolve(as_identity.as_deref())?.clone();
                    let state = self.manager.get(&principal)?;
                    let messages = state.inbox.newer_than(since)?;
                    Ok((principal, messages))
                })();
                let _ = reply.send(result);
            }

            GatewayCommand::Inbox { as_identity, reply } => {
                let result = self
                    .manager
                    .resolve_state(as_identity.as_deref())
                    .and_then(|s| s.inbox.snapshot());
                let _ = reply.send(result);
            }

            GatewayCommand::Outbox { as_identity, reply } => {
                let result = self
                    .manager
                    .resolve_state(as_identity.as_deref())
                    .and_then(|s| s.outbox.snapshot());
                let _ = reply.send(result);
            }

            GatewayCommand::Peers { as_identity, reply } => {
                let result = (|| {
                    let principal = self.manager.resolve(as_identity.as_deref())?.clone();
                    let state = self.manager.get(&principal)?;
                    let records = state.peers.snapshot()?;
                    Ok(records
                        .into_iter()
                        .map(|record| PeerInfo {
                            connected: self.sessions.is_connected(&principal, &record.principal),
                            record,
                        })
                        .collect())
                })();
                let _ = reply.send(result);
            }

            GatewayCommand::PeerAdd {
                as_identity,
                principal,
                address,
                alias,
                visibility,
                reply,
            } => {
                let result = (|| {
                    let state = self.manager.resolve_state(as_identity.as_deref())?;
                    let principal = Principal::parse(&principal)?;
                    let address = match address {
                        Some(raw) => Some(normalize_multiaddr(&raw)?.to_string()),
                        None => None,
                    };
                    let visibility = match visibility.as_deref() {
                        None => None,
                        Some("public") => Some(clawchat_types::Visibility::Public),
                        Some("friends") => Some(clawchat_types::Visibility::Friends),
                        Some("private") => Some(clawchat_types::Visibility::Private),
                        Some(other) => {
                            return Err(ClawchatError::Protocol {
                                reason: format!("unknown visibility '{other}'"),
                            });
                        }
                    };
                    state.peers.add(&principal, address, alias, visibility)
                })();
                let _ = reply.send(result);
            }

            GatewayCommand::PeerRemove {
                as_identity,
                principal,
                reply,
            } => {
                let result = (|| {
                    let state = self.manager.resolve_state(as_identity.as_deref())?;
                    let principal = Principal::parse(&principal)?;
                    state.peers.remove(&principal)
                })();
                let _ = reply.send(result);
            }

            GatewayCommand::PeerResolve {
                as_identity,
                principal,
                through,
                reply,
            } => {
                self.start_resolve(as_identity.as_deref(), &principal, through.as_deref(), reply);
            }

            GatewayCommand::Status { as_identity, reply } => {
                let result = self.build_status(as_identity.as_deref()).await;
                let _ = reply.send(result);
            }

            GatewayCommand::Multiaddrs { reply } => {
                let result = self
                    .network
                    .listeners()
                    .await
                    .map(|addrs| addrs.iter().map(|a| a.to_string()).collect());
                let _ = reply.send(result);
            }

            GatewayCommand::Connect { multiaddr, reply } => {
                let result = self.connect(&multiaddr).await;
                let _ = reply.send(result);
            }

            GatewayCommand::Stop => {
                tracing::info!("stop command received");
                self.stopping = true;
            }
        }
    }

    /// `send`: queue in the outbox, then try to deliver right away.
    async fn queue_and_send(
        &mut self,
        selector: Option<&str>,
        to: &str,
        content: String,
    ) -> Result<MessageId> {
        let to = Principal::parse(to).map_err(|_| ClawchatError::Protocol {
            reason: format!("invalid recipient '{to}'"),
        })?;

        let local = self.manager.resolve(selector)?.clone();
        let state = self.manager.get(&local)?;
        if !state.acl.permits(&to) {
            return Err(ClawchatError::Auth {
                reason: format!("recipient {to} is not in the allow list of {local}"),
            });
        }

        let message = Message {
            id: MessageId::generate(),
            from: local.clone(),
            from_nick: state.identity.nick().map(str::to_string),
            to,
            content,
            timestamp: Timestamp::now(),
            status: MessageStatus::Pending,
        };
        let id = message.id;

        if let Err(e) = state.outbox.insert(message.clone()) {
            self.flag_fatal(&e);
            return Err(e);
        }

        // Immediate attempt; failure just leaves the entry pending for
        // the retry tick.
        self.try_deliver_entry(&local, &message).await;
        Ok(id)
    }

    async fn build_status(&mut self, selector: Option<&str>) -> Result<StatusInfo> {
        let principal = self.manager.resolve(selector)?.clone();
        let state = self.manager.get(&principal)?;
        let inbox_count = state.inbox.len()?;
        let outbox_count = state.outbox.len()?;

        let multiaddrs = self
            .network
            .listeners()
            .await?
            .iter()
            .map(|a| a.to_string())
            .collect();

        Ok(StatusInfo {
            peer_id: self.network.local_peer_id().to_string(),
            p2p_port: self.config.p2p_port,
            multiaddrs,
            connected_peers: self.sessions.connected_remotes(&principal),
            inbox_count,
            outbox_count,
            loaded_identities: self.manager.principals(),
            principal,
        })
    }

    /// `connect`: dial, authenticate as the default identity, report
    /// the remote principal.
    async fn connect(&mut self, multiaddr: &str) -> Result<Principal> {
        let addr = normalize_multiaddr(multiaddr)?;
        let local = self.manager.default_principal()?.clone();
        let identity = std::sync::Arc::clone(&self.manager.get(&local)?.identity);
        let node_key = self.node_key;
        let network = self.network.clone();

        let handshake = async {
            let peer = network.dial(addr).await?;
            let remote_key = node_key_from_peer_id(&peer)?;
            let mut stream = network.open_stream(peer).await?;
            let remote =
                handshake_outbound(&mut stream, &identity, node_key, remote_key, None).await?;
            Ok::<_, ClawchatError>((peer, remote_key, remote, stream))
        };

        let (peer, remote_key, remote, stream) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake)
                .await
                .map_err(|_| ClawchatError::Transport {
                    reason: "dial + handshake timed out".into(),
                })??;

        let session_id = self.register_session(local, remote.clone(), remote_key, peer, stream);
        self.on_session_authenticated(session_id).await;
        Ok(remote)
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    fn handle_net_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::IncomingStream { peer, stream } => {
                self.spawn_inbound_handshake(peer, stream);
            }
            NetworkEvent::ConnectionEstablished { peer, address } => {
                self.peer_addrs.insert(peer, address);
            }
            NetworkEvent::ConnectionClosed { peer } => {
                self.peer_addrs.remove(&peer);
            }
            NetworkEvent::NewListenAddr { address } => {
                tracing::info!(%address, "transport listening");
            }
        }
    }

    /// Inbound handshakes run off-loop; only the outcome comes back.
    fn spawn_inbound_handshake(&self, peer: PeerId, stream: libp2p::Stream) {
        let remote_key = match node_key_from_peer_id(&peer) {
            Ok(key) => key,
            Err(e) => {
                tracing::warn!(%peer, %e, "rejecting stream from opaque peer id");
                return;
            }
        };

        let catalog = self.manager.handshake_catalog();
        let node_key = self.node_key;
        let events = self.session_events_tx.clone();

        tokio::spawn(async move {
            let mut stream = stream;
            let outcome = tokio::time::timeout(
                HANDSHAKE_TIMEOUT,
                handshake_inbound(&mut stream, &catalog, node_key, remote_key),
            )
            .await;

            let event = match outcome {
                Ok(Ok((local, remote))) => SessionEvent::InboundEstablished {
                    peer,
                    local,
                    remote,
                    remote_node_key: remote_key,
                    stream,
                },
                Ok(Err(e)) => SessionEvent::HandshakeFailed {
                    peer,
                    reason: format!("attestation rejected: {e}"),
                },
                Err(_) => SessionEvent::HandshakeFailed {
                    peer,
                    reason: "handshake timed out".into(),
                },
            };
            let _ = events.send(event).await;
        });
    }

    // -----------------------------------------------------------------------
    // Session events
    // -----------------------------------------------------------------------

    async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::InboundEstablished {
                peer,
                local,
                remote,
                remote_node_key,
                stream,
            } => {
                let session_id =
                    self.register_session(local, remote, remote_node_key, peer, stream);
                self.on_session_authenticated(session_id).await;
            }

            SessionEvent::HandshakeFailed { peer, reason } => {
                tracing::warn!(%peer, %reason, "inbound handshake failed");
            }

            SessionEvent::Frame { session_id, frame } => {
                if let Some(session) = self.sessions.get_mut(session_id) {
                    session.last_used = Timestamp::now();
                } else {
                    tracing::debug!(session_id, "frame for unknown session dropped");
                    return;
                }
                match frame {
                    Frame::Chat(chat) => self.handle_inbound_chat(session_id, chat),
                    Frame::PxPush { peers } => self.handle_px_push(session_id, peers),
                    Frame::PxRequest { principal } => {
                        self.handle_px_request(session_id, &principal);
                    }
                    Frame::PxResponse { record } => self.handle_px_response(session_id, record),
                    Frame::Hello(_) => {
                        tracing::warn!(session_id, "hello after authentication; closing");
                        self.close_session(session_id, "unexpected hello");
                    }
                }
            }

            SessionEvent::Closed { session_id, reason } => {
                if let Some(session) = self.sessions.remove(session_id) {
                    tracing::info!(
                        local = %session.local,
                        remote = %session.remote,
                        %reason,
                        "session closed"
                    );
                    let _ = self.events.send(GatewayEvent::PeerDisconnected {
                        identity: session.local,
                        remote: session.remote,
                    });
                }
            }
        }
    }

    /// Registers an authenticated session: eviction of any older
    /// session for the pair, peer book upkeep, and the `session`
    /// event — strictly before any message from the session.
    pub(crate) fn register_session(
        &mut self,
        local: Principal,
        remote: Principal,
        remote_node_key: NodeKey,
        peer: PeerId,
        stream: libp2p::Stream,
    ) -> u64 {
        let id = self.sessions.next_id();
        let tx = spawn_session_io(id, stream, self.session_events_tx.clone());
        let now = Timestamp::now();

        if let Some(evicted) = self.sessions.register(Session {
            id,
            local: local.clone(),
            remote: remote.clone(),
            remote_node_key,
            peer,
            tx,
            created_at: now,
            last_used: now,
        }) {
            tracing::debug!(
                old = evicted.id,
                new = id,
                remote = %remote,
                "duplicate session; older one evicted"
            );
        }

        if let Ok(state) = self.manager.get(&local) {
            let observed = self.peer_addrs.get(&peer).map(|a| a.to_string());
            if let Err(e) = state.peers.mark_authenticated(&remote, remote_node_key, observed, now)
            {
                tracing::warn!(%e, "peer book update failed");
            }
        }

        tracing::info!(session_id = id, %local, %remote, "session authenticated");
        let _ = self.events.send(GatewayEvent::PeerConnected {
            identity: local,
            remote,
        });
        id
    }

    /// Post-authentication work: one PX push, then flush any pending
    /// outbox entries addressed to the new remote.
    pub(crate) async fn on_session_authenticated(&mut self, session_id: u64) {
        self.px_push_session(session_id).await;

        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let (local, remote) = (session.local.clone(), session.remote.clone());

        let pending = match self.manager.get(&local).and_then(|s| s.outbox.pending()) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!(%e, "outbox read failed");
                return;
            }
        };
        for entry in pending.iter().filter(|m| m.to == remote) {
            if !self.send_chat_on_session(session_id, &local, entry).await {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound chat (router + ACL)
    // -----------------------------------------------------------------------

    fn handle_inbound_chat(&mut self, session_id: u64, chat: clawchat_protocol::ChatFrame) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let (local, remote) = (session.local.clone(), session.remote.clone());
        let Ok(state) = self.manager.get(&local) else {
            return;
        };

        // ACL: silent to the sender, logged and surfaced locally.
        if !state.acl.permits(&remote) {
            tracing::warn!(%local, %remote, "inbound message denied by ACL");
            let _ = self.events.send(GatewayEvent::Error {
                message: format!("acl denied sender {remote} for identity {local}"),
            });
            return;
        }

        let message = Message {
            id: chat.id,
            from: remote,
            from_nick: chat.from_nick,
            to: local.clone(),
            content: chat.content,
            timestamp: chat.timestamp,
            status: MessageStatus::Delivered,
        };

        let wake = state.wake;
        let wake_mode = WakeMode::for_content(&message.content);
        match state.inbox.insert(message.clone()) {
            Ok(true) => {
                let _ = self.events.send(GatewayEvent::Message {
                    identity: local.clone(),
                    message,
                });
                if wake {
                    if let Some(hook) = &self.wake_hook {
                        wake::invoke(hook, wake_mode, &local);
                    }
                }
            }
            Ok(false) => {
                // Duplicate id: drop silently per protocol.
            }
            Err(e) => self.flag_fatal(&e),
        }
    }

    // -----------------------------------------------------------------------
    // PX resolve plumbing
    // -----------------------------------------------------------------------

    fn start_resolve(
        &mut self,
        selector: Option<&str>,
        principal: &str,
        through: Option<&str>,
        reply: oneshot::Sender<Result<Option<PxRecord>>>,
    ) {
        let prepared = (|| {
            let local = self.manager.resolve(selector)?.clone();
            let target = Principal::parse(principal)?;
            let through = through.map(Principal::parse).transpose()?;
            Ok::<_, ClawchatError>((local, target, through))
        })();

        let (local, target, through) = match prepared {
            Ok(parts) => parts,
            Err(e) => {
                let _ = reply.send(Err(e));
                return;
            }
        };

        let session_ids: Vec<u64> = self
            .sessions
            .for_identity(&local)
            .into_iter()
            .filter(|s| through.as_ref().map_or(true, |t| &s.remote == t))
            .map(|s| s.id)
            .collect();

        if session_ids.is_empty() {
            let _ = reply.send(self.local_record(&local, &target));
            return;
        }

        for &sid in &session_ids {
            self.send_px_request(sid, &target);
        }

        self.pending_resolves.push(PendingResolve {
            remaining: session_ids.len(),
            session_ids,
            principal: target,
            local,
            reply: Some(reply),
            deadline: Instant::now() + RESOLVE_TIMEOUT,
        });
    }

    /// Answers a resolve from the local peer book.
    pub(crate) fn local_record(
        &self,
        local: &Principal,
        target: &Principal,
    ) -> Result<Option<PxRecord>> {
        let state = self.manager.get(local)?;
        Ok(state
            .peers
            .get(target)?
            .as_ref()
            .and_then(PxRecord::from_peer_record))
    }

    /// Fails over expired resolves to the local peer book.
    fn expire_resolves(&mut self) {
        let now = Instant::now();
        let drained: Vec<PendingResolve> = self.pending_resolves.drain(..).collect();
        let mut kept = Vec::with_capacity(drained.len());
        for mut pending in drained {
            if now < pending.deadline && pending.reply.is_some() {
                kept.push(pending);
                continue;
            }
            if let Some(reply) = pending.reply.take() {
                let fallback = self.local_record(&pending.local, &pending.principal);
                let _ = reply.send(fallback);
            }
        }
        self.pending_resolves = kept;
    }

    // -----------------------------------------------------------------------
    // Session send helper
    // -----------------------------------------------------------------------

    /// Sends one outbox entry on a session, waiting for the transport
    /// write. Marks the entry `sent` on success; drops the session on
    /// failure and leaves the entry pending.
    pub(crate) async fn send_chat_on_session(
        &mut self,
        session_id: u64,
        local: &Principal,
        entry: &Message,
    ) -> bool {
        let Some(session) = self.sessions.get(session_id) else {
            return false;
        };
        let frame = Frame::Chat(clawchat_protocol::ChatFrame {
            id: entry.id,
            content: entry.content.clone(),
            timestamp: entry.timestamp,
            from_nick: entry.from_nick.clone(),
        });

        let (ack_tx, ack_rx) = oneshot::channel();
        let queued = session
            .tx
            .send(crate::session::SessionCommand {
                frame,
                reply: Some(ack_tx),
            })
            .await
            .is_ok();

        let written = queued
            && matches!(
                tokio::time::timeout(SEND_ACK_TIMEOUT, ack_rx).await,
                Ok(Ok(Ok(())))
            );

        if !written {
            tracing::warn!(session_id, to = %entry.to, "send failed; dropping session");
            self.close_session(session_id, "write failed");
            return false;
        }

        if let Some(session) = self.sessions.get_mut(session_id) {
            session.last_used = Timestamp::now();
        }

        match self
            .manager
            .get(local)
            .and_then(|s| s.outbox.update_status(&entry.id, MessageStatus::Sent))
        {
            Ok(()) => true,
            Err(e @ ClawchatError::Storage { .. }) => {
                self.flag_fatal(&e);
                false
            }
            Err(e) => {
                tracing::warn!(%e, "outbox status update failed");
                false
            }
        }
    }

    /// Drops a session from the table; its queue senders go with it,
    /// which closes the stream.
    pub(crate) fn close_session(&mut self, session_id: u64, reason: &str) {
        if let Some(session) = self.sessions.remove(session_id) {
            tracing::debug!(session_id, %reason, remote = %session.remote, "closing session");
            let _ = self.events.send(GatewayEvent::PeerDisconnected {
                identity: session.local,
                remote: session.remote,
            });
        }
    }

    /// Records a fatal mailbox failure; the loop exits on next turn.
    pub(crate) fn flag_fatal(&mut self, error: &ClawchatError) {
        if matches!(error, ClawchatError::Storage { .. }) && self.fatal.is_none() {
            self.fatal = Some(error.to_string());
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn write_pid_file(&self) -> Result<()> {
        clawchat_identity::store::create_private_dir(self.data.root())?;
        std::fs::write(self.data.pid_path(), format!("{}\n", std::process::id())).map_err(|e| {
            ClawchatError::Storage {
                reason: format!("failed to write pid file: {e}"),
            }
        })
    }

    fn start_ipc(&mut self) -> Result<()> {
        let listener = crate::ipc::bind(&self.data.socket_path())?;
        let command_tx = self.command_tx.clone();
        let events = self.events.clone();
        let shutdown = self.ipc_shutdown.subscribe();
        tokio::spawn(crate::ipc::serve(listener, command_tx, events, shutdown));
        Ok(())
    }

    async fn shutdown_sequence(&mut self) {
        tracing::info!("shutting down");

        // Stop accepting IPC, then close sessions (peers see EOF).
        let _ = self.ipc_shutdown.send(true);
        for session in self.sessions.drain() {
            drop(session);
        }
        self.network.shutdown().await;

        let _ = std::fs::remove_file(self.data.socket_path());
        let _ = std::fs::remove_file(self.data.pid_path());
        tracing::info!("shutdown complete");
    }
}

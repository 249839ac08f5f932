//! The transport node task and its handle.
//!
//! The libp2p swarm must be polled continuously, so it lives in a
//! dedicated tokio task. The gateway talks to it through a cloneable
//! [`NetworkHandle`] (command channel + stream control) and receives
//! [`NetworkEvent`]s on a bounded channel. Dial completion is matched
//! to the originating request by libp2p connection id.

use std::collections::HashMap;

use futures::StreamExt;
use libp2p::swarm::dial_opts::DialOpts;
use libp2p::swarm::{ConnectionId, NetworkBehaviour, SwarmEvent};
use libp2p::{noise, tcp, yamux, Multiaddr, PeerId};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use clawchat_types::ClawchatError;
use clawchat_types::Result as ClawchatResult;

use crate::keys::keypair_from_seed;
use crate::SNAP2P_PROTOCOL;

/// Command channel capacity; callers feel backpressure when the swarm
/// task is overloaded.
const COMMAND_CHANNEL_SIZE: usize = 64;

/// Idle connection timeout. Sessions hold their streams open, which
/// keeps the underlying connection alive past this.
const IDLE_TIMEOUT_SECS: u64 = 60;

// ---------------------------------------------------------------------------
// Behaviour
// ---------------------------------------------------------------------------

/// Swarm behaviour: just the raw-stream protocol. Discovery is PX-1's
/// job, one layer up.
#[derive(NetworkBehaviour)]
struct GatewayBehaviour {
    stream: libp2p_stream::Behaviour,
}

// ---------------------------------------------------------------------------
// Commands & events
// ---------------------------------------------------------------------------

enum NetworkCommand {
    Dial {
        addr: Multiaddr,
        reply: oneshot::Sender<ClawchatResult<PeerId>>,
    },
    Listeners {
        reply: oneshot::Sender<Vec<Multiaddr>>,
    },
    ConnectedPeers {
        reply: oneshot::Sender<Vec<PeerId>>,
    },
    Shutdown,
}

/// Events the gateway consumes from the transport.
pub enum NetworkEvent {
    /// A remote opened a SNaP2P stream toward us.
    IncomingStream {
        /// Remote transport endpoint.
        peer: PeerId,
        /// The raw bidirectional stream, pre-handshake.
        stream: libp2p::Stream,
    },
    /// A connection to a peer is up (either direction).
    ConnectionEstablished {
        /// Remote transport endpoint.
        peer: PeerId,
        /// The remote address of the connection.
        address: Multiaddr,
    },
    /// The last connection to a peer closed.
    ConnectionClosed {
        /// Remote transport endpoint.
        peer: PeerId,
    },
    /// A new local listen address is active.
    NewListenAddr {
        /// The address, without the `/p2p` suffix.
        address: Multiaddr,
    },
}

// ---------------------------------------------------------------------------
// NetworkHandle
// ---------------------------------------------------------------------------

/// Cloneable handle to the transport task.
#[derive(Clone)]
pub struct NetworkHandle {
    cmd_tx: mpsc::Sender<NetworkCommand>,
    control: libp2p_stream::Control,
    local_peer_id: PeerId,
}

impl NetworkHandle {
    /// The gateway's own peer id.
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Dials a multi-address, resolving once the connection is up.
    ///
    /// Callers wrap this in their own deadline; the transport reports
    /// failure as soon as libp2p does.
    pub async fn dial(&self, addr: Multiaddr) -> ClawchatResult<PeerId> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetworkCommand::Dial {
                addr,
                reply: reply_tx,
            })
            .await
            .map_err(|_| transport_gone())?;
        reply_rx.await.map_err(|_| transport_gone())?
    }

    /// Opens a SNaP2P stream on an established connection.
    pub async fn open_stream(&self, peer: PeerId) -> ClawchatResult<libp2p::Stream> {
        let mut control = self.control.clone();
        control
            .open_stream(peer, SNAP2P_PROTOCOL)
            .await
            .map_err(|e| ClawchatError::Transport {
                reason: format!("failed to open stream to {peer}: {e}"),
            })
    }

    /// Current listen addresses.
    pub async fn listeners(&self) -> ClawchatResult<Vec<Multiaddr>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetworkCommand::Listeners { reply: reply_tx })
            .await
            .map_err(|_| transport_gone())?;
        reply_rx.await.map_err(|_| transport_gone())
    }

    /// Peers with at least one live connection.
    pub async fn connected_peers(&self) -> ClawchatResult<Vec<PeerId>> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(NetworkCommand::ConnectedPeers { reply: reply_tx })
            .await
            .map_err(|_| transport_gone())?;
        reply_rx.await.map_err(|_| transport_gone())
    }

    /// Asks the transport task to exit, dropping all connections.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(NetworkCommand::Shutdown).await;
    }
}

fn transport_gone() -> ClawchatError {
    ClawchatError::Transport {
        reason: "transport task is gone".into(),
    }
}

// ---------------------------------------------------------------------------
// Spawn
// ---------------------------------------------------------------------------

/// Builds the swarm from a stored Ed25519 seed, binds the TCP listener
/// on `port`, and spawns the transport task.
pub fn spawn(
    seed: &[u8; 32],
    port: u16,
) -> ClawchatResult<(NetworkHandle, mpsc::UnboundedReceiver<NetworkEvent>, JoinHandle<()>)> {
    let keypair = keypair_from_seed(seed)?;
    let local_peer_id = PeerId::from(keypair.public());

    let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| ClawchatError::Transport {
            reason: format!("failed to configure TCP transport: {e}"),
        })?
        .with_behaviour(|_| GatewayBehaviour {
            stream: libp2p_stream::Behaviour::new(),
        })
        .map_err(|e| ClawchatError::Transport {
            reason: format!("failed to build behaviour: {e}"),
        })?
        .with_swarm_config(|cfg| {
            cfg.with_idle_connection_timeout(std::time::Duration::from_secs(IDLE_TIMEOUT_SECS))
        })
        .build();

    let mut control = swarm.behaviour().stream.new_control();
    let mut incoming = control
        .accept(SNAP2P_PROTOCOL)
        .map_err(|e| ClawchatError::Transport {
            reason: format!("failed to register stream protocol: {e}"),
        })?;

    let listen: Multiaddr = format!("/ip4/0.0.0.0/tcp/{port}")
        .parse()
        .map_err(|e| ClawchatError::Transport {
            reason: format!("invalid listen address: {e}"),
        })?;
    swarm
        .listen_on(listen)
        .map_err(|e| ClawchatError::Transport {
            reason: format!("failed to listen on port {port}: {e}"),
        })?;

    let (cmd_tx, mut cmd_rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    // Unbounded so a busy consumer can never stall swarm polling.
    let (event_tx, event_rx) = mpsc::unbounded_channel();

    let handle = NetworkHandle {
        cmd_tx,
        control,
        local_peer_id,
    };

    let task = tokio::spawn(async move {
        let mut pending_dials: HashMap<ConnectionId, oneshot::Sender<ClawchatResult<PeerId>>> =
            HashMap::new();

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    dispatch_swarm_event(event, &mut pending_dials, &event_tx);
                }

                Some((peer, stream)) = incoming.next() => {
                    if event_tx
                        .send(NetworkEvent::IncomingStream { peer, stream })
                        .is_err()
                    {
                        break;
                    }
                }

                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(NetworkCommand::Dial { addr, reply }) => {
                            let opts = DialOpts::unknown_peer_id().address(addr.clone()).build();
                            let connection_id = opts.connection_id();
                            match swarm.dial(opts) {
                                Ok(()) => {
                                    pending_dials.insert(connection_id, reply);
                                }
                                Err(e) => {
                                    let _ = reply.send(Err(ClawchatError::Transport {
                                        reason: format!("dial {addr} failed: {e}"),
                                    }));
                                }
                            }
                        }
                        Some(NetworkCommand::Listeners { reply }) => {
                            let _ = reply.send(swarm.listeners().cloned().collect());
                        }
                        Some(NetworkCommand::ConnectedPeers { reply }) => {
                            let _ = reply.send(swarm.connected_peers().cloned().collect());
                        }
                        Some(NetworkCommand::Shutdown) | None => break,
                    }
                }
            }
        }

        tracing::info!("transport task exited");
    });

    Ok((handle, event_rx, task))
}

fn dispatch_swarm_event(
    event: SwarmEvent<GatewayBehaviourEvent>,
    pending_dials: &mut HashMap<ConnectionId, oneshot::Sender<ClawchatResult<PeerId>>>,
    event_tx: &mpsc::UnboundedSender<NetworkEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            tracing::info!(%address, "listening");
            let _ = event_tx.send(NetworkEvent::NewListenAddr { address });
        }

        SwarmEvent::ConnectionEstablished {
            peer_id,
            connection_id,
            endpoint,
            ..
        } => {
            tracing::debug!(peer = %peer_id, ?endpoint, "connection established");
            if let Some(reply) = pending_dials.remove(&connection_id) {
                let _ = reply.send(Ok(peer_id));
            }
            let _ = event_tx.send(NetworkEvent::ConnectionEstablished {
                peer: peer_id,
                address: endpoint.get_remote_address().clone(),
            });
        }

        SwarmEvent::ConnectionClosed {
            peer_id,
            num_established,
            cause,
            ..
        } => {
            tracing::debug!(peer = %peer_id, ?cause, num_established, "connection closed");
            if num_established == 0 {
                let _ = event_tx.send(NetworkEvent::ConnectionClosed { peer: peer_id });
            }
        }

        SwarmEvent::OutgoingConnectionError {
            connection_id,
            peer_id,
            error,
        } => {
            tracing::warn!(?peer_id, %error, "outgoing connection error");
            if let Some(reply) = pending_dials.remove(&connection_id) {
                let _ = reply.send(Err(ClawchatError::Transport {
                    reason: format!("dial failed: {error}"),
                }));
            }
        }

        SwarmEvent::IncomingConnectionError {
            local_addr,
            send_back_addr,
            error,
            ..
        } => {
            tracing::warn!(%local_addr, %send_back_addr, %error, "incoming connection error");
        }

        other => {
            tracing::trace!(?other, "unhandled swarm event");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{AsyncReadExt, AsyncWriteExt};

    /// Two nodes on loopback: dial, open a stream, echo bytes.
    #[tokio::test]
    async fn dial_and_stream_roundtrip() -> ClawchatResult<()> {
        let (node_a, mut events_a, _task_a) = spawn(&[0x11; 32], 0)?;
        let (node_b, mut events_b, _task_b) = spawn(&[0x22; 32], 0)?;

        // Wait for B's listen address.
        let addr_b = loop {
            match events_b.recv().await {
                Some(NetworkEvent::NewListenAddr { address }) => break address,
                Some(_) => continue,
                None => panic!("B's event channel closed"),
            }
        };

        let peer_b = node_a.dial(addr_b).await?;
        assert_eq!(peer_b, node_b.local_peer_id());

        let mut stream = node_a.open_stream(peer_b).await?;
        stream.write_all(b"ping").await.expect("write");
        stream.flush().await.expect("flush");

        // B sees the incoming stream and echoes.
        let mut inbound = loop {
            match events_b.recv().await {
                Some(NetworkEvent::IncomingStream { peer, stream }) => {
                    assert_eq!(peer, node_a.local_peer_id());
                    break stream;
                }
                Some(_) => continue,
                None => panic!("B's event channel closed"),
            }
        };
        let mut buf = [0u8; 4];
        inbound.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"ping");
        inbound.write_all(b"pong").await.expect("write");
        inbound.flush().await.expect("flush");

        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.expect("read");
        assert_eq!(&buf, b"pong");

        // A observed the outbound connection too.
        let connected = node_a.connected_peers().await?;
        assert!(connected.contains(&peer_b));

        // Drain A's events without blocking the test.
        while events_a.try_recv().is_ok() {}

        node_a.shutdown().await;
        node_b.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn dial_unreachable_address_errors() -> ClawchatResult<()> {
        let (node, _events, _task) = spawn(&[0x33; 32], 0)?;
        // TEST-NET-1 address; nothing listens there.
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(10),
            node.dial("/ip4/192.0.2.1/tcp/1".parse().expect("addr")),
        )
        .await;
        match result {
            Ok(Ok(_)) => panic!("dial unexpectedly succeeded"),
            Ok(Err(_)) | Err(_) => {}
        }
        node.shutdown().await;
        Ok(())
    }
}

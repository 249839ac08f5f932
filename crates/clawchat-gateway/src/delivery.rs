//! Pending-message delivery engine.
//!
//! Every 5 s the event loop snapshots each identity's pending outbox
//! entries and walks them:
//!
//! 1. An authenticated session to the recipient → send on it. A
//!    transport error drops the session and falls through.
//! 2. No peer book addresses → fire PX resolve requests on every
//!    authenticated session; the answers merge into the peer book and
//!    the next tick picks them up.
//! 3. Dial each candidate address (10 s dial + handshake deadline).
//!    If the authenticated remote is the recipient, send; otherwise
//!    close the stream and try the next address.
//!
//! Entries retry forever while pending. Failures are logged, never
//! fatal; `failed` is reserved for administrative action.

use std::sync::Arc;

use libp2p::Multiaddr;

use clawchat_network::keys::node_key_from_peer_id;
use clawchat_types::{ClawchatError, Message, Principal, Result};

use crate::event_loop::Gateway;
use crate::session::{handshake_outbound, HANDSHAKE_TIMEOUT};

impl Gateway {
    /// One retry tick over a snapshot of all pending entries. Entries
    /// queued while the tick runs wait for the next one.
    pub(crate) async fn process_pending_tick(&mut self) {
        for local in self.manager.principals() {
            let pending = match self.manager.get(&local).and_then(|s| s.outbox.pending()) {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::warn!(%local, %e, "outbox read failed");
                    continue;
                }
            };
            for entry in &pending {
                self.try_deliver_entry(&local, entry).await;
            }
        }
    }

    /// One delivery attempt for one outbox entry. Returns whether the
    /// entry reached `sent`.
    pub(crate) async fn try_deliver_entry(&mut self, local: &Principal, entry: &Message) -> bool {
        // Step 1: reuse the authenticated session if there is one.
        if let Some(session) = self.sessions.for_pair(local, &entry.to) {
            let session_id = session.id;
            if self.send_chat_on_session(session_id, local, entry).await {
                return true;
            }
            // Session dropped on failure; continue with addresses.
        }

        // Step 2: candidate addresses from the peer book.
        let addresses = self
            .manager
            .get(local)
            .and_then(|s| s.peers.addresses_for(&entry.to))
            .unwrap_or_default();

        if addresses.is_empty() {
            // Opportunistic PX resolve through every live session;
            // responses land in the peer book for the next tick.
            let session_ids: Vec<u64> = self
                .sessions
                .for_identity(local)
                .iter()
                .map(|s| s.id)
                .collect();
            for session_id in session_ids {
                self.send_px_request(session_id, &entry.to);
            }
            return false;
        }

        // Step 3: dial candidates in order.
        for raw in addresses {
            let Ok(addr) = raw.parse::<Multiaddr>() else {
                tracing::debug!(%raw, "skipping unparseable peer address");
                continue;
            };
            match self.dial_and_authenticate(local, &entry.to, addr).await {
                Ok(Some(session_id)) => {
                    if self.send_chat_on_session(session_id, local, entry).await {
                        return true;
                    }
                }
                Ok(None) => {
                    tracing::debug!(%raw, expected = %entry.to, "address answered as another principal");
                }
                Err(e) => {
                    tracing::debug!(%raw, %e, "delivery dial failed");
                }
            }
        }

        false
    }

    /// Dials one address and drives SNaP2P to authenticated.
    ///
    /// `Ok(Some(id))` when the expected principal answered (the
    /// session is registered and PX-pushed); `Ok(None)` when a
    /// different principal did (stream closed).
    async fn dial_and_authenticate(
        &mut self,
        local: &Principal,
        expected: &Principal,
        addr: Multiaddr,
    ) -> Result<Option<u64>> {
        let identity = Arc::clone(&self.manager.get(local)?.identity);
        let network = self.network.clone();
        let node_key = self.node_key;
        let target = expected.clone();

        let attempt = async move {
            let peer = network.dial(addr).await?;
            let remote_key = node_key_from_peer_id(&peer)?;
            let mut stream = network.open_stream(peer).await?;
            let remote =
                handshake_outbound(&mut stream, &identity, node_key, remote_key, Some(&target))
                    .await?;
            Ok::<_, ClawchatError>((peer, remote_key, remote, stream))
        };

        let (peer, remote_key, remote, stream) =
            tokio::time::timeout(HANDSHAKE_TIMEOUT, attempt)
                .await
                .map_err(|_| ClawchatError::Transport {
                    reason: "dial + handshake timed out".into(),
                })??;

        if &remote != expected {
            drop(stream);
            return Ok(None);
        }

        let session_id =
            self.register_session(local.clone(), remote, remote_key, peer, stream);
        // Push our contacts once; the caller sends the entry itself,
        // and any other pending mail for this pair goes next tick.
        self.px_push_session(session_id).await;
        Ok(Some(session_id))
    }
}

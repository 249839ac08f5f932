//! PX-1 peer exchange scheduling and frame handling.
//!
//! Pushes happen once per new authenticated session and on a 60 s
//! broadcast tick. Every push leads with the sending identity's own
//! contact record (principal, node key, current listen addresses) so
//! second-hand peers learn dialable addresses, followed by the
//! identity's verified records, visibility-filtered and capped.
//!
//! Received records are advisory: they merge into the peer book but
//! never flip `verified` — only the peer's own attestation during a
//! handshake does that.

use clawchat_protocol::frame::Frame;
use clawchat_protocol::px::{PxRecord, MAX_PX_RECORDS_PER_PUSH};
use clawchat_types::{Principal, Timestamp, Visibility};

use crate::event_loop::Gateway;
use crate::session::SessionCommand;

impl Gateway {
    /// 60 s tick: push to every authenticated session.
    pub(crate) async fn px_broadcast(&mut self) {
        let session_ids: Vec<u64> = self.sessions.iter().map(|s| s.id).collect();
        for session_id in session_ids {
            self.px_push_session(session_id).await;
        }
    }

    /// One push to one session.
    pub(crate) async fn px_push_session(&mut self, session_id: u64) {
        let listeners: Vec<String> = match self.network.listeners().await {
            Ok(addrs) => addrs.iter().map(|a| a.to_string()).collect(),
            Err(e) => {
                tracing::debug!(%e, "listener query failed; skipping px push");
                return;
            }
        };

        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let (local, remote) = (session.local.clone(), session.remote.clone());
        let Ok(state) = self.manager.get(&local) else {
            return;
        };

        let mut records = Vec::with_capacity(MAX_PX_RECORDS_PER_PUSH);
        records.push(PxRecord {
            principal: local.clone(),
            node_key: Some(self.node_key),
            addresses: listeners,
            visibility: Visibility::Public,
            last_seen: Some(Timestamp::now()),
        });

        match state.peers.verified() {
            Ok(verified) => {
                for record in verified {
                    if records.len() >= MAX_PX_RECORDS_PER_PUSH {
                        break;
                    }
                    // The recipient knows itself.
                    if record.principal == remote {
                        continue;
                    }
                    if let Some(px) = PxRecord::from_peer_record(&record) {
                        records.push(px);
                    }
                }
            }
            Err(e) => {
                tracing::warn!(%e, "peer book read failed during px push");
            }
        }

        self.send_px_frame(session_id, Frame::PxPush { peers: records });
    }

    /// Fires a targeted resolve request on one session.
    pub(crate) fn send_px_request(&self, session_id: u64, principal: &Principal) {
        self.send_px_frame(
            session_id,
            Frame::PxRequest {
                principal: principal.clone(),
            },
        );
    }

    /// Best-effort px frame send; dropped when the queue is full.
    fn send_px_frame(&self, session_id: u64, frame: Frame) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        if session
            .tx
            .try_send(SessionCommand { frame, reply: None })
            .is_err()
        {
            tracing::debug!(session_id, "px frame dropped; session queue full");
        }
    }

    /// Merges an unsolicited batch of gossiped records.
    pub(crate) fn handle_px_push(&mut self, session_id: u64, records: Vec<PxRecord>) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let (local, remote) = (session.local.clone(), session.remote.clone());
        let Ok(state) = self.manager.get(&local) else {
            return;
        };

        for record in records.into_iter().take(MAX_PX_RECORDS_PER_PUSH) {
            // Records about our own identities carry nothing we need.
            if self.manager.is_local_identity(&record.principal) {
                continue;
            }
            if Principal::parse(record.principal.as_str()).is_err() {
                continue;
            }
            if let Err(e) = state.peers.merge_gossip(
                &record.principal,
                record.node_key,
                &record.addresses,
                record.visibility,
                &remote,
                record.last_seen,
            ) {
                tracing::warn!(%e, "gossip merge failed");
            }
        }
    }

    /// Answers a targeted resolve from the local peer book.
    pub(crate) fn handle_px_request(&mut self, session_id: u64, principal: &Principal) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let local = session.local.clone();
        let record = self.local_record(&local, principal).unwrap_or_default();
        self.send_px_frame(session_id, Frame::PxResponse { record });
    }

    /// Handles a resolve answer: merge it, then settle any pending
    /// `peer_resolve` calls waiting on this session.
    pub(crate) fn handle_px_response(&mut self, session_id: u64, record: Option<PxRecord>) {
        let Some(session) = self.sessions.get(session_id) else {
            return;
        };
        let (local, remote) = (session.local.clone(), session.remote.clone());

        if let Some(record) = &record {
            if !self.manager.is_local_identity(&record.principal) {
                if let Ok(state) = self.manager.get(&local) {
                    if let Err(e) = state.peers.merge_gossip(
                        &record.principal,
                        record.node_key,
                        &record.addresses,
                        record.visibility,
                        &remote,
                        record.last_seen,
                    ) {
                        tracing::warn!(%e, "resolve merge failed");
                    }
                }
            }
        }

        for pending in self.pending_resolves.iter_mut() {
            if !pending.session_ids.contains(&session_id) {
                continue;
            }
            match &record {
                Some(r) if r.principal == pending.principal => {
                    if let Some(reply) = pending.reply.take() {
                        let _ = reply.send(Ok(Some(r.clone())));
                    }
                }
                _ => {
                    pending.remaining = pending.remaining.saturating_sub(1);
                }
            }
        }

        // Resolves with no answers left fall back to the local book.
        let drained: Vec<_> = self.pending_resolves.drain(..).collect();
        let mut kept = Vec::with_capacity(drained.len());
        for mut pending in drained {
            if pending.reply.is_none() {
                continue;
            }
            if pending.remaining == 0 {
                if let Some(reply) = pending.reply.take() {
                    let fallback = self.local_record(&pending.local, &pending.principal);
                    let _ = reply.send(fallback);
                }
            } else {
                kept.push(pending);
            }
        }
        self.pending_resolves = kept;
    }
}

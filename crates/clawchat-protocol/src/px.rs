//! PX-1 peer-exchange records.
//!
//! Records gossiped over authenticated sessions are advisory: a
//! principal is bound to a node key only by its own attestation during
//! handshake, never by hearsay carried here.

use serde::{Deserialize, Serialize};

use clawchat_types::{NodeKey, PeerRecord, Principal, Timestamp, Visibility};

/// Cap on records per `px_push` frame.
pub const MAX_PX_RECORDS_PER_PUSH: usize = 64;

// ---------------------------------------------------------------------------
// PxRecord
// ---------------------------------------------------------------------------

/// One gossiped peer contact record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PxRecord {
    /// The principal this record describes.
    pub principal: Principal,
    /// Node key the gossiper observed for the principal, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_key: Option<NodeKey>,
    /// Advertised multi-addresses.
    #[serde(default)]
    pub addresses: Vec<String>,
    /// Sharing class declared by the record owner.
    #[serde(default)]
    pub visibility: Visibility,
    /// When the gossiper last saw the principal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<Timestamp>,
}

impl PxRecord {
    /// Builds the gossipable form of a peer book record.
    ///
    /// Returns `None` for `private` records — they never leave the
    /// gateway.
    pub fn from_peer_record(record: &PeerRecord) -> Option<Self> {
        if record.visibility == Visibility::Private {
            return None;
        }
        Some(Self {
            principal: record.principal.clone(),
            node_key: record.node_key,
            addresses: record.addresses.iter().cloned().collect(),
            visibility: record.visibility,
            last_seen: record.last_seen,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn peer(visibility: Visibility) -> PeerRecord {
        let mut record = PeerRecord::new(Principal::local_from_public_key(&[0x09; 32]));
        record.visibility = visibility;
        record.addresses = BTreeSet::from(["/ip4/127.0.0.1/tcp/19000".to_string()]);
        record
    }

    #[test]
    fn public_record_is_gossipable() {
        let px = PxRecord::from_peer_record(&peer(Visibility::Public)).expect("gossipable");
        assert_eq!(px.addresses.len(), 1);
        assert_eq!(px.visibility, Visibility::Public);
    }

    #[test]
    fn friends_record_is_gossipable() {
        // Pushes only ever target authenticated sessions, so `friends`
        // records travel too.
        assert!(PxRecord::from_peer_record(&peer(Visibility::Friends)).is_some());
    }

    #[test]
    fn private_record_never_leaves() {
        assert!(PxRecord::from_peer_record(&peer(Visibility::Private)).is_none());
    }
}

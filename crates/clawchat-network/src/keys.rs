//! Node key ↔ libp2p identity conversions.
//!
//! Transport endpoints are identified by Ed25519 node keys. libp2p
//! encodes such keys inline in the `PeerId` (identity multihash), so
//! the remote node key can always be recovered from the peer id the
//! transport reports — no extra exchange needed.

use libp2p::identity;
use libp2p::PeerId;

use clawchat_types::{ClawchatError, NodeKey, Result};

/// Multihash code for the identity hash, used for inline public keys.
const MULTIHASH_IDENTITY_CODE: u64 = 0x00;

/// Builds the gateway's libp2p identity from a stored Ed25519 seed.
pub fn keypair_from_seed(seed: &[u8; 32]) -> Result<identity::Keypair> {
    let mut bytes = *seed;
    identity::Keypair::ed25519_from_bytes(&mut bytes).map_err(|e| ClawchatError::Transport {
        reason: format!("invalid transport key seed: {e}"),
    })
}

/// Extracts the 32-byte Ed25519 node key from a `PeerId`.
///
/// # Errors
///
/// [`ClawchatError::Transport`] when the peer id does not inline an
/// Ed25519 key (non-identity multihash or another key type).
pub fn node_key_from_peer_id(peer: &PeerId) -> Result<NodeKey> {
    let multihash = peer.as_ref();
    if multihash.code() != MULTIHASH_IDENTITY_CODE {
        return Err(ClawchatError::Transport {
            reason: format!("peer id {peer} does not inline its public key"),
        });
    }
    let public = identity::PublicKey::try_decode_protobuf(multihash.digest()).map_err(|e| {
        ClawchatError::Transport {
            reason: format!("peer id {peer} carries an undecodable key: {e}"),
        }
    })?;
    let ed25519 = public
        .try_into_ed25519()
        .map_err(|_| ClawchatError::Transport {
            reason: format!("peer id {peer} is not an Ed25519 node"),
        })?;
    Ok(NodeKey::new(ed25519.to_bytes()))
}

/// Derives the `PeerId` a node key dials as.
pub fn peer_id_from_node_key(node_key: &NodeKey) -> Result<PeerId> {
    let ed25519 = identity::ed25519::PublicKey::try_from_bytes(node_key.as_bytes()).map_err(
        |e| ClawchatError::Transport {
            reason: format!("invalid node key: {e}"),
        },
    )?;
    Ok(PeerId::from(identity::PublicKey::from(ed25519)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_key_roundtrips_through_peer_id() -> Result<()> {
        let seed = [0x42u8; 32];
        let keypair = keypair_from_seed(&seed)?;
        let peer_id = PeerId::from(keypair.public());

        let node_key = node_key_from_peer_id(&peer_id)?;
        assert_eq!(peer_id_from_node_key(&node_key)?, peer_id);
        Ok(())
    }

    #[test]
    fn conversion_is_deterministic() -> Result<()> {
        let seed = [0x07u8; 32];
        let a = PeerId::from(keypair_from_seed(&seed)?.public());
        let b = PeerId::from(keypair_from_seed(&seed)?.public());
        assert_eq!(a, b);
        assert_eq!(node_key_from_peer_id(&a)?, node_key_from_peer_id(&b)?);
        Ok(())
    }

    #[test]
    fn different_seeds_different_node_keys() -> Result<()> {
        let a = PeerId::from(keypair_from_seed(&[1u8; 32])?.public());
        let b = PeerId::from(keypair_from_seed(&[2u8; 32])?.public());
        assert_ne!(node_key_from_peer_id(&a)?, node_key_from_peer_id(&b)?);
        Ok(())
    }
}

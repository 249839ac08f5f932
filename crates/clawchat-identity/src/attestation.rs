//! Node-key attestations.
//!
//! An attestation binds a principal to a 32-byte transport node key
//! for a bounded interval. It is generated fresh for every handshake
//! and never persisted.
//!
//! # Canonical encoding
//!
//! Signer and verifier must agree byte-for-byte. Both identity modes
//! sign the same deterministic concatenation:
//!
//! ```text
//! domain ‖ 0x00 ‖ u32be(version) ‖ u16be(len(principal)) ‖ principal
//!        ‖ node_key(32) ‖ u64be(issued_at) ‖ u64be(expires_at)
//!        ‖ u16be(len(nonce)) ‖ nonce
//! ```
//!
//! Local mode signs the encoding directly (Ed25519); stacks mode signs
//! it with recoverable ECDSA and is verified by address recovery.

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use clawchat_types::{ClawchatError, NodeKey, Principal, Result, Timestamp};

use crate::identity::{verify_for_principal, Identity};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Fixed domain-separation string.
pub const ATTESTATION_DOMAIN: &str = "snap2p-nodekey-attestation-v1";

/// Current attestation schema version.
pub const ATTESTATION_VERSION: u32 = 1;

/// Default validity window in seconds (24 h).
pub const DEFAULT_VALIDITY_SECS: u64 = 86_400;

/// Allowed clock skew on either side of the validity window.
pub const CLOCK_SKEW_SECS: u64 = 300;

/// Nonce length bounds (inclusive).
pub const NONCE_MIN_LEN: usize = 16;
/// Nonce length bounds (inclusive).
pub const NONCE_MAX_LEN: usize = 32;

/// Nonce length this implementation generates.
const NONCE_LEN: usize = 16;

// ---------------------------------------------------------------------------
// Attestation
// ---------------------------------------------------------------------------

/// A signed binding of a principal to a node public key.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attestation {
    /// Schema version; currently always 1.
    pub version: u32,
    /// The principal being bound.
    pub principal: Principal,
    /// The 32-byte transport node key.
    pub node_key: NodeKey,
    /// Seconds since epoch when issued.
    pub issued_at: u64,
    /// Seconds since epoch when the binding lapses.
    pub expires_at: u64,
    /// 16–32 random bytes.
    #[serde(with = "serde_bytes_hex")]
    pub nonce: Vec<u8>,
    /// Domain-separation string; must equal [`ATTESTATION_DOMAIN`].
    pub domain: String,
    /// Mode-dependent signature over the canonical encoding.
    #[serde(with = "serde_bytes_hex")]
    pub signature: Vec<u8>,
}

/// Hex (de)serialization for byte fields, keeping the JSON/CBOR forms
/// readable and mode-independent.
mod serde_bytes_hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ---------------------------------------------------------------------------
// Canonical encoding
// ---------------------------------------------------------------------------

/// Builds the deterministic byte string both modes sign.
pub fn canonical_bytes(
    version: u32,
    principal: &Principal,
    node_key: &NodeKey,
    issued_at: u64,
    expires_at: u64,
    nonce: &[u8],
) -> Vec<u8> {
    let principal_bytes = principal.as_str().as_bytes();
    let mut out = Vec::with_capacity(
        ATTESTATION_DOMAIN.len() + 1 + 4 + 2 + principal_bytes.len() + 32 + 8 + 8 + 2 + nonce.len(),
    );
    out.extend_from_slice(ATTESTATION_DOMAIN.as_bytes());
    out.push(0x00);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(principal_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(principal_bytes);
    out.extend_from_slice(node_key.as_bytes());
    out.extend_from_slice(&issued_at.to_be_bytes());
    out.extend_from_slice(&expires_at.to_be_bytes());
    out.extend_from_slice(&(nonce.len() as u16).to_be_bytes());
    out.extend_from_slice(nonce);
    out
}

impl Attestation {
    /// Canonical encoding of this attestation's signed fields.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        canonical_bytes(
            self.version,
            &self.principal,
            &self.node_key,
            self.issued_at,
            self.expires_at,
            &self.nonce,
        )
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Issues a fresh attestation binding `identity` to `node_key`.
///
/// `validity_secs` defaults to [`DEFAULT_VALIDITY_SECS`] when `None`.
pub fn create_attestation(
    identity: &Identity,
    node_key: NodeKey,
    validity_secs: Option<u64>,
) -> Result<Attestation> {
    let now = Timestamp::now().as_secs().max(0) as u64;
    let validity = validity_secs.unwrap_or(DEFAULT_VALIDITY_SECS);

    let mut nonce = vec![0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);

    let issued_at = now;
    let expires_at = now.saturating_add(validity);

    let payload = canonical_bytes(
        ATTESTATION_VERSION,
        identity.principal(),
        &node_key,
        issued_at,
        expires_at,
        &nonce,
    );
    let signature = identity.sign(&payload)?;

    Ok(Attestation {
        version: ATTESTATION_VERSION,
        principal: identity.principal().clone(),
        node_key,
        issued_at,
        expires_at,
        nonce,
        domain: ATTESTATION_DOMAIN.to_string(),
        signature,
    })
}

// ---------------------------------------------------------------------------
// Verify
// ---------------------------------------------------------------------------

/// Verifies an attestation against the current clock.
pub fn verify_attestation(attestation: &Attestation) -> Result<()> {
    verify_attestation_at(attestation, Timestamp::now().as_secs().max(0) as u64)
}

/// Verifies an attestation at an explicit point in time.
///
/// Rejects unless all of: version is 1; the domain matches; the nonce
/// length is within bounds; `issued_at` is not in the future beyond
/// skew; `expires_at` is not in the past beyond skew; and the
/// signature verifies for the principal's mode.
pub fn verify_attestation_at(attestation: &Attestation, now_secs: u64) -> Result<()> {
    if attestation.version != ATTESTATION_VERSION {
        return Err(ClawchatError::Auth {
            reason: format!("unsupported attestation version {}", attestation.version),
        });
    }
    if attestation.domain != ATTESTATION_DOMAIN {
        return Err(ClawchatError::Auth {
            reason: format!("attestation domain mismatch: '{}'", attestation.domain),
        });
    }
    if attestation.nonce.len() < NONCE_MIN_LEN || attestation.nonce.len() > NONCE_MAX_LEN {
        return Err(ClawchatError::Auth {
            reason: format!("attestation nonce length {} out of bounds", attestation.nonce.len()),
        });
    }
    if attestation.expires_at <= attestation.issued_at {
        return Err(ClawchatError::Auth {
            reason: "attestation expires before it is issued".into(),
        });
    }
    if attestation.issued_at > now_secs.saturating_add(CLOCK_SKEW_SECS) {
        return Err(ClawchatError::Auth {
            reason: "attestation issued in the future".into(),
        });
    }
    if attestation.expires_at.saturating_add(CLOCK_SKEW_SECS) <= now_secs {
        return Err(ClawchatError::Auth {
            reason: "attestation expired".into(),
        });
    }

    // Re-validate the principal shape before trusting its prefix.
    let principal = Principal::parse(attestation.principal.as_str())?;

    let payload = attestation.canonical_bytes();
    verify_for_principal(&principal, &payload, &attestation.signature)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

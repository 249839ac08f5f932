//! The tagged identity type and its signing operations.
//!
//! An identity is either `local` (one Ed25519 keypair that both names
//! the principal and signs) or `stacks` (a BIP39-seeded secp256k1
//! wallet that signs, plus a distinct Ed25519 node keypair for the
//! transport). Attestation creation and verification dispatch on the
//! tag — there is no trait hierarchy here, just the enum-shaped data.

use clawchat_crypto::signing::{self, Keypair, PublicKey, Signature};
use clawchat_types::{ClawchatError, IdentityMode, NodeKey, Principal, Result};
use zeroize::Zeroizing;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// A loaded identity: principal, display nick, and key material.
///
/// Constructed by [`Identity::create_local`], [`Identity::create_stacks`],
/// [`Identity::recover_stacks`], or [`crate::store::load`]. Never
/// `Clone` — each identity is owned by exactly one manager slot.
pub struct Identity {
    principal: Principal,
    mode: IdentityMode,
    nick: Option<String>,
    testnet: bool,
    /// Ed25519 pair. Local mode: the identity key itself (it also
    /// names the principal). Stacks mode: the stored node keypair.
    signing: Keypair,
    /// secp256k1 wallet secret (stacks mode only).
    wallet_secret: Option<Zeroizing<[u8; 32]>>,
    /// Recovery phrase (stacks mode only); persisted encrypted, never
    /// in plaintext.
    mnemonic: Option<Zeroizing<String>>,
}

impl Identity {
    /// Creates a fresh local-mode identity.
    pub fn create_local() -> Self {
        let signing = Keypair::generate();
        let principal = Principal::local_from_public_key(signing.public_key().as_bytes());
        Self {
            principal,
            mode: IdentityMode::Local,
            nick: None,
            testnet: false,
            signing,
            wallet_secret: None,
            mnemonic: None,
        }
    }

    /// Creates a fresh stacks-mode identity.
    ///
    /// Returns the identity and its 24-word mnemonic. The mnemonic is
    /// surfaced exactly once here; afterwards it lives only inside the
    /// encrypted identity file.
    #[cfg(feature = "stacks")]
    pub fn create_stacks(testnet: bool) -> Result<(Self, Zeroizing<String>)> {
        let phrase = clawchat_crypto::stacks::generate_mnemonic()?;
        let identity = Self::recover_stacks(&phrase, testnet)?;
        Ok((identity, phrase))
    }

    /// Stub when the `stacks` feature is compiled out.
    #[cfg(not(feature = "stacks"))]
    pub fn create_stacks(_testnet: bool) -> Result<(Self, Zeroizing<String>)> {
        Err(stacks_disabled())
    }

    /// Rebuilds a stacks-mode identity from its mnemonic.
    ///
    /// Fails on anything but a checksum-valid 24-word phrase. A fresh
    /// node keypair is generated; it is persisted on save.
    #[cfg(feature = "stacks")]
    pub fn recover_stacks(mnemonic: &str, testnet: bool) -> Result<Self> {
        use clawchat_crypto::stacks::StacksWallet;

        let wallet = StacksWallet::from_mnemonic(mnemonic, testnet)?;
        let principal = Principal::stacks_from_address(&wallet.address());
        Ok(Self {
            principal,
            mode: IdentityMode::Stacks,
            nick: None,
            testnet,
            signing: Keypair::generate(),
            wallet_secret: Some(wallet.secret_bytes()),
            mnemonic: Some(Zeroizing::new(mnemonic.trim().to_string())),
        })
    }

    /// Stub when the `stacks` feature is compiled out.
    #[cfg(not(feature = "stacks"))]
    pub fn recover_stacks(_mnemonic: &str, _testnet: bool) -> Result<Self> {
        Err(stacks_disabled())
    }

    /// Reassembles an identity from stored parts (used by the store).
    pub(crate) fn from_parts(
        principal: Principal,
        mode: IdentityMode,
        nick: Option<String>,
        testnet: bool,
        signing: Keypair,
        wallet_secret: Option<Zeroizing<[u8; 32]>>,
        mnemonic: Option<Zeroizing<String>>,
    ) -> Self {
        Self {
            principal,
            mode,
            nick,
            testnet,
            signing,
            wallet_secret,
            mnemonic,
        }
    }

    // -- Accessors ---------------------------------------------------------

    /// The identity's principal.
    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    /// The identity mode tag.
    pub fn mode(&self) -> IdentityMode {
        self.mode
    }

    /// The display nick, if set.
    pub fn nick(&self) -> Option<&str> {
        self.nick.as_deref()
    }

    /// Sets or clears the display nick (persist via the store).
    pub fn set_nick(&mut self, nick: Option<String>) {
        self.nick = nick;
    }

    /// Whether a stacks identity targets testnet.
    pub fn is_testnet(&self) -> bool {
        self.testnet
    }

    /// The stored Ed25519 public key.
    pub fn signing_public_key(&self) -> PublicKey {
        self.signing.public_key()
    }

    /// The stored node key as transported on the wire.
    pub fn stored_node_key(&self) -> NodeKey {
        NodeKey::new(*self.signing.public_key().as_bytes())
    }

    /// Seed for building the gateway's libp2p transport identity.
    ///
    /// Sensitive key material — discard the copy promptly.
    pub fn transport_seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.signing.seed_bytes())
    }

    pub(crate) fn signing_keypair(&self) -> &Keypair {
        &self.signing
    }

    pub(crate) fn wallet_secret(&self) -> Option<&Zeroizing<[u8; 32]>> {
        self.wallet_secret.as_ref()
    }

    pub(crate) fn mnemonic(&self) -> Option<&Zeroizing<String>> {
        self.mnemonic.as_ref()
    }

    // -- Signing -----------------------------------------------------------

    /// Signs `message` with the mode-appropriate key.
    ///
    /// Local: 64-byte Ed25519 signature by the identity key.
    /// Stacks: 65-byte recoverable secp256k1 signature by the wallet.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match self.mode {
            IdentityMode::Local => Ok(self.signing.sign(message).as_bytes().to_vec()),
            IdentityMode::Stacks => self.sign_stacks(message),
        }
    }

    #[cfg(feature = "stacks")]
    fn sign_stacks(&self, message: &[u8]) -> Result<Vec<u8>> {
        use clawchat_crypto::stacks::StacksWallet;

        let secret = self.wallet_secret.as_ref().ok_or_else(|| ClawchatError::Auth {
            reason: "stacks identity has no wallet key".into(),
        })?;
        let wallet = StacksWallet::from_secret_bytes(secret, self.testnet)?;
        Ok(wallet.sign_recoverable(message)?.to_vec())
    }

    #[cfg(not(feature = "stacks"))]
    fn sign_stacks(&self, _message: &[u8]) -> Result<Vec<u8>> {
        Err(stacks_disabled())
    }
}

// ---------------------------------------------------------------------------
// Verification by principal
// ---------------------------------------------------------------------------

/// Verifies `signature` over `message` against the key the principal
/// names.
///
/// Local principals embed their Ed25519 public key; stacks principals
/// are checked by recovering the signer's wallet address (the network
/// flag is inferred from the `SP`/`ST` address prefix).
pub fn verify_for_principal(principal: &Principal, message: &[u8], signature: &[u8]) -> Result<()> {
    match principal.mode() {
        IdentityMode::Local => {
            let key_bytes = hex::decode(principal.suffix()).map_err(|_| ClawchatError::Auth {
                reason: "local principal carries invalid hex".into(),
            })?;
            let arr: [u8; 32] = key_bytes.try_into().map_err(|_| ClawchatError::Auth {
                reason: "local principal key must be 32 bytes".into(),
            })?;
            let sig = Signature::from_slice(signature)?;
            signing::verify(&PublicKey::from_bytes(arr), message, &sig)
        }
        IdentityMode::Stacks => verify_stacks(principal, message, signature),
    }
}

#[cfg(feature = "stacks")]
fn verify_stacks(principal: &Principal, message: &[u8], signature: &[u8]) -> Result<()> {
    use clawchat_crypto::stacks::{recover_address, RECOVERABLE_SIG_LEN};

    let sig: &[u8; RECOVERABLE_SIG_LEN] =
        signature.try_into().map_err(|_| ClawchatError::Auth {
            reason: format!(
                "stacks signature must be {RECOVERABLE_SIG_LEN} bytes, got {}",
                signature.len()
            ),
        })?;

    let testnet = principal.suffix().starts_with("ST");
    let recovered = recover_address(message, sig, testnet)?;
    if recovered != principal.suffix() {
        return Err(ClawchatError::Auth {
            reason: format!(
                "recovered address {recovered} does not match principal {principal}"
            ),
        });
    }
    Ok(())
}

#[cfg(not(feature = "stacks"))]
fn verify_stacks(_principal: &Principal, _message: &[u8], _signature: &[u8]) -> Result<()> {
    Err(stacks_disabled())
}

#[cfg(not(feature = "stacks"))]
fn stacks_disabled() -> ClawchatError {
    ClawchatError::Config {
        reason: "stacks identity mode is not compiled into this build".into(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_identity_principal_embeds_key() {
        let id = Identity::create_local();
        assert_eq!(id.mode(), IdentityMode::Local);
        assert_eq!(
            id.principal().suffix(),
            hex::encode(id.signing_public_key().as_bytes())
        );
    }

    #[test]
    fn local_sign_verifies_for_principal() -> Result<()> {
        let id = Identity::create_local();
        let sig = id.sign(b"hello")?;
        verify_for_principal(id.principal(), b"hello", &sig)
    }

    #[test]
    fn local_verify_rejects_other_signer() -> Result<()> {
        let a = Identity::create_local();
        let b = Identity::create_local();
        let sig = a.sign(b"hello")?;
        assert!(verify_for_principal(b.principal(), b"hello", &sig).is_err());
        Ok(())
    }

    #[test]
    fn local_verify_rejects_flipped_signature() -> Result<()> {
        let id = Identity::create_local();
        let mut sig = id.sign(b"hello")?;
        sig[7] ^= 0x01;
        assert!(verify_for_principal(id.principal(), b"hello", &sig).is_err());
        Ok(())
    }

    #[cfg(feature = "stacks")]
    mod stacks {
        use super::*;

        #[test]
        fn create_returns_24_word_mnemonic() -> Result<()> {
            let (id, phrase) = Identity::create_stacks(false)?;
            assert_eq!(id.mode(), IdentityMode::Stacks);
            assert_eq!(phrase.split_whitespace().count(), 24);
            assert!(id.principal().suffix().starts_with("SP"));
            Ok(())
        }

        #[test]
        fn recover_reproduces_principal() -> Result<()> {
            let (id, phrase) = Identity::create_stacks(true)?;
            let recovered = Identity::recover_stacks(&phrase, true)?;
            assert_eq!(recovered.principal(), id.principal());
            assert!(id.principal().suffix().starts_with("ST"));
            Ok(())
        }

        #[test]
        fn recover_rejects_bad_word_count() {
            assert!(Identity::recover_stacks("one two three", false).is_err());
        }

        #[test]
        fn stacks_sign_verifies_for_principal() -> Result<()> {
            let (id, _) = Identity::create_stacks(false)?;
            let sig = id.sign(b"attestation payload")?;
            assert_eq!(sig.len(), 65);
            verify_for_principal(id.principal(), b"attestation payload", &sig)
        }

        #[test]
        fn stacks_node_key_differs_from_wallet() -> Result<()> {
            let (id, _) = Identity::create_stacks(false)?;
            // The node key is an independent Ed25519 pair, not derived
            // from the wallet.
            let (id2, _) = Identity::create_stacks(false)?;
            assert_ne!(id.stored_node_key(), id2.stored_node_key());
            Ok(())
        }
    }
}

//! Encrypted identity persistence.
//!
//! # File layout (`identity.enc`)
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----
//!   0       1   Version byte (3 current, 2 accepted on read)
//!   1      16   Argon2id salt
//!  17      12   ChaCha20-Poly1305 nonce
//!  29     var   Ciphertext of the canonical JSON payload + tag
//! ```
//!
//! The payload is a JSON object with fields `principal, address,
//! publicKey, privateKey, mnemonic, walletPublicKeyHex,
//! walletPrivateKeyHex, testnet, nick?, mode`. Version-2 files may
//! omit `mode` (inferred from the principal prefix) and `nick`.
//!
//! The file and its directory are created owner-only. An identity is
//! never rewritten without the passphrase — nick changes re-encrypt
//! with a fresh salt and nonce.

use std::path::Path;

use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use clawchat_crypto::aead::{self, AeadNonce};
use clawchat_crypto::kdf::{self, KdfParams, SALT_LEN};
use clawchat_crypto::signing::Keypair;
use clawchat_types::{ClawchatError, IdentityMode, Principal, Result};

use crate::identity::Identity;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Name of the encrypted identity file inside an identity directory.
pub const IDENTITY_FILE: &str = "identity.enc";

/// Version written by this implementation.
pub const FILE_VERSION: u8 = 3;

/// Oldest version accepted on read.
pub const FILE_VERSION_LEGACY: u8 = 2;

/// Minimum passphrase length.
pub const MIN_PASSPHRASE_LEN: usize = 12;

/// AEAD nonce length in the header.
const NONCE_LEN: usize = 12;

/// Header size: version + salt + nonce.
const HEADER_LEN: usize = 1 + SALT_LEN + NONCE_LEN;

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

/// JSON payload inside the encrypted envelope.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityPayload {
    principal: String,
    address: String,
    public_key: String,
    private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mnemonic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wallet_public_key_hex: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    wallet_private_key_hex: Option<String>,
    #[serde(default)]
    testnet: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nick: Option<String>,
    /// Absent in version-2 files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    mode: Option<String>,
}

// ---------------------------------------------------------------------------
// Save
// ---------------------------------------------------------------------------

/// Encrypts and writes an identity into `dir/identity.enc`.
///
/// # Errors
///
/// - [`ClawchatError::Config`] if the passphrase is shorter than
///   [`MIN_PASSPHRASE_LEN`] characters.
/// - [`ClawchatError::Storage`] on filesystem failures.
pub fn save(identity: &Identity, passphrase: &str, dir: &Path) -> Result<()> {
    if passphrase.chars().count() < MIN_PASSPHRASE_LEN {
        return Err(ClawchatError::Config {
            reason: format!("passphrase must be at least {MIN_PASSPHRASE_LEN} characters"),
        });
    }

    let payload = build_payload(identity)?;
    let json = Zeroizing::new(serde_json::to_vec(&payload).map_err(|e| {
        ClawchatError::Storage {
            reason: format!("failed to serialize identity payload: {e}"),
        }
    })?);

    let mut salt = [0u8; SALT_LEN];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt);
    let key = kdf::derive_file_key(passphrase.as_bytes(), &salt, &KdfParams::default())?;

    let nonce = aead::generate_nonce();
    let ciphertext = aead::encrypt(key.as_bytes(), &nonce, &json, &[])?;

    let mut data = Vec::with_capacity(HEADER_LEN + ciphertext.len());
    data.push(FILE_VERSION);
    data.extend_from_slice(&salt);
    data.extend_from_slice(nonce.as_bytes());
    data.extend_from_slice(&ciphertext);

    create_private_dir(dir)?;
    let path = dir.join(IDENTITY_FILE);
    write_private_file(&path, &data)
}

fn build_payload(identity: &Identity) -> Result<IdentityPayload> {
    let public_key = hex::encode(identity.signing_public_key().as_bytes());
    let private_key = hex::encode(*identity.transport_seed());

    let (address, wallet_public_key_hex, wallet_private_key_hex) = match identity.mode() {
        IdentityMode::Local => (public_key.clone(), None, None),
        IdentityMode::Stacks => {
            let secret = identity.wallet_secret().map(|s| hex::encode(**s));
            (
                identity.principal().suffix().to_string(),
                wallet_public_hex(identity),
                secret,
            )
        }
    };

    Ok(IdentityPayload {
        principal: identity.principal().to_string(),
        address,
        public_key,
        private_key,
        mnemonic: identity.mnemonic().map(|m| m.to_string()),
        wallet_public_key_hex,
        wallet_private_key_hex,
        testnet: identity.is_testnet(),
        nick: identity.nick().map(str::to_string),
        mode: Some(identity.mode().to_string()),
    })
}

#[cfg(feature = "stacks")]
fn wallet_public_hex(identity: &Identity) -> Option<String> {
    use clawchat_crypto::stacks::StacksWallet;

    let secret = identity.wallet_secret()?;
    StacksWallet::from_secret_bytes(secret, identity.is_testnet())
        .ok()
        .map(|w| hex::encode(w.public_key_bytes()))
}

#[cfg(not(feature = "stacks"))]
fn wallet_public_hex(_identity: &Identity) -> Option<String> {
    None
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Returns whether `dir` holds an identity file.
pub fn exists(dir: &Path) -> bool {
    dir.join(IDENTITY_FILE).is_file()
}

/// Reads and decrypts `dir/identity.enc`.
///
/// # Errors
///
/// - [`ClawchatError::NotFound`] when no identity file exists — kept
///   distinct from decryption failures so callers can prompt to create
///   one.
/// - [`ClawchatError::Auth`] for a wrong passphrase or a corrupt file.
pub fn load(dir: &Path, passphrase: &str) -> Result<Identity> {
    let path = dir.join(IDENTITY_FILE);
    if !path.is_file() {
        return Err(ClawchatError::NotFound {
            what: format!("identity file '{}'", path.display()),
        });
    }

    let data = std::fs::read(&path).map_err(|e| ClawchatError::Storage {
        reason: format!("failed to read '{}': {e}", path.display()),
    })?;

    if data.len() <= HEADER_LEN {
        return Err(ClawchatError::Auth {
            reason: "identity file truncated".into(),
        });
    }

    let version = data[0];
    if version != FILE_VERSION && version != FILE_VERSION_LEGACY {
        return Err(ClawchatError::Auth {
            reason: format!("unsupported identity file version {version}"),
        });
    }

    let salt = &data[1..1 + SALT_LEN];
    let mut nonce_bytes = [0u8; NONCE_LEN];
    nonce_bytes.copy_from_slice(&data[1 + SALT_LEN..HEADER_LEN]);
    let ciphertext = &data[HEADER_LEN..];

    let key = kdf::derive_file_key(passphrase.as_bytes(), salt, &KdfParams::default())?;
    let json = Zeroizing::new(
        aead::decrypt(
            key.as_bytes(),
            &AeadNonce::from_bytes(nonce_bytes),
            ciphertext,
            &[],
        )
        .map_err(|_| ClawchatError::Auth {
            reason: "bad passphrase or corrupt identity file".into(),
        })?,
    );

    let payload: IdentityPayload =
        serde_json::from_slice(&json).map_err(|_| ClawchatError::Auth {
            reason: "bad passphrase or corrupt identity file".into(),
        })?;

    identity_from_payload(payload)
}

fn identity_from_payload(payload: IdentityPayload) -> Result<Identity> {
    let principal = Principal::parse(&payload.principal)?;

    // v2 files carry no mode tag; the principal prefix is authoritative.
    let mode = match payload.mode.as_deref() {
        Some("local") => IdentityMode::Local,
        Some("stacks") => IdentityMode::Stacks,
        Some(other) => {
            return Err(ClawchatError::Auth {
                reason: format!("unknown identity mode '{other}'"),
            });
        }
        None => principal.mode(),
    };

    let seed = decode_key32(&payload.private_key, "privateKey")?;
    let signing = Keypair::from_seed(&seed);

    if mode == IdentityMode::Local {
        let derived = Principal::local_from_public_key(signing.public_key().as_bytes());
        if derived != principal {
            return Err(ClawchatError::Auth {
                reason: "identity key does not match principal".into(),
            });
        }
    }

    let wallet_secret = match payload.wallet_private_key_hex.as_deref() {
        Some(hex_secret) => Some(Zeroizing::new(decode_key32(hex_secret, "walletPrivateKey")?)),
        None => None,
    };

    Ok(Identity::from_parts(
        principal,
        mode,
        payload.nick,
        payload.testnet,
        signing,
        wallet_secret,
        payload.mnemonic.map(Zeroizing::new),
    ))
}

fn decode_key32(hex_str: &str, field: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_str).map_err(|_| ClawchatError::Auth {
        reason: format!("identity field '{field}' is not valid hex"),
    })?;
    bytes.try_into().map_err(|_| ClawchatError::Auth {
        reason: format!("identity field '{field}' must be 32 bytes"),
    })
}

// ---------------------------------------------------------------------------
// Nick mutation
// ---------------------------------------------------------------------------

/// Loads the identity, replaces its nick, and re-encrypts in place.
///
/// Passing `None` clears the nick. Returns the updated identity.
pub fn set_nick(dir: &Path, passphrase: &str, nick: Option<String>) -> Result<Identity> {
    let mut identity = load(dir, passphrase)?;
    identity.set_nick(nick);
    save(&identity, passphrase, dir)?;
    Ok(identity)
}

// ---------------------------------------------------------------------------
// Private file helpers
// ---------------------------------------------------------------------------

/// Creates `dir` (and parents) with owner-only permissions.
pub fn create_private_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).map_err(|e| ClawchatError::Storage {
        reason: format!("failed to create '{}': {e}", dir.display()),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700)).map_err(|e| {
            ClawchatError::Storage {
                reason: format!("failed to restrict '{}': {e}", dir.display()),
            }
        })?;
    }
    Ok(())
}

fn write_private_file(path: &Path, data: &[u8]) -> Result<()> {
    std::fs::write(path, data).map_err(|e| ClawchatError::Storage {
        reason: format!("failed to write '{}': {e}", path.display()),
    })?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).map_err(|e| {
            ClawchatError::Storage {
                reason: format!("failed to restrict '{}': {e}", path.display()),
            }
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const PASS: &str = "a long enough passphrase";

    #[test]
    fn save_load_roundtrip_local() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = Identity::create_local();
        save(&identity, PASS, dir.path())?;

        let loaded = load(dir.path(), PASS)?;
        assert_eq!(loaded.principal(), identity.principal());
        assert_eq!(loaded.mode(), IdentityMode::Local);
        assert_eq!(
            loaded.signing_public_key().as_bytes(),
            identity.signing_public_key().as_bytes()
        );
        Ok(())
    }

    #[test]
    fn wrong_passphrase_is_auth_error() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        save(&Identity::create_local(), PASS, dir.path())?;

        match load(dir.path(), "a different passphrase") {
            Err(ClawchatError::Auth { .. }) => Ok(()),
            other => panic!("expected Auth error, got {other:?}"),
        }
    }

    #[test]
    fn missing_file_is_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        match load(dir.path(), PASS) {
            Err(ClawchatError::NotFound { .. }) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn short_passphrase_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = Identity::create_local();
        assert!(save(&identity, "tooshort", dir.path()).is_err());
    }

    #[test]
    fn version_2_file_without_mode_loads() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let identity = Identity::create_local();
        save(&identity, PASS, dir.path())?;

        // Rewrite the same payload as a v2 envelope without the mode tag.
        let payload = IdentityPayload {
            principal: identity.principal().to_string(),
            address: hex::encode(identity.signing_public_key().as_bytes()),
            public_key: hex::encode(identity.signing_public_key().as_bytes()),
            private_key: hex::encode(*identity.transport_seed()),
            mnemonic: None,
            wallet_public_key_hex: None,
            wallet_private_key_hex: None,
            testnet: false,
            nick: None,
            mode: None,
        };
        let json = serde_json::to_vec(&payload).expect("serialize");

        let mut salt = [0u8; SALT_LEN];
        rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut salt);
        let key = kdf::derive_file_key(PASS.as_bytes(), &salt, &KdfParams::default())?;
        let nonce = aead::generate_nonce();
        let ciphertext = aead::encrypt(key.as_bytes(), &nonce, &json, &[])?;

        let mut data = vec![FILE_VERSION_LEGACY];
        data.extend_from_slice(&salt);
        data.extend_from_slice(nonce.as_bytes());
        data.extend_from_slice(&ciphertext);
        std::fs::write(dir.path().join(IDENTITY_FILE), &data).expect("write");

        let loaded = load(dir.path(), PASS)?;
        assert_eq!(loaded.mode(), IdentityMode::Local);
        assert_eq!(loaded.principal(), identity.principal());
        Ok(())
    }

    #[test]
    fn unsupported_version_rejected() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        save(&Identity::create_local(), PASS, dir.path())?;

        let path = dir.path().join(IDENTITY_FILE);
        let mut data = std::fs::read(&path).expect("read");
        data[0] = 9;
        std::fs::write(&path, &data).expect("write");

        assert!(load(dir.path(), PASS).is_err());
        Ok(())
    }

    #[test]
    fn set_nick_roundtrip() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        save(&Identity::create_local(), PASS, dir.path())?;

        let updated = set_nick(dir.path(), PASS, Some("agent-7".into()))?;
        assert_eq!(updated.nick(), Some("agent-7"));

        let reloaded = load(dir.path(), PASS)?;
        assert_eq!(reloaded.nick(), Some("agent-7"));

        let cleared = set_nick(dir.path(), PASS, None)?;
        assert_eq!(cleared.nick(), None);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn file_is_owner_only() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().expect("tempdir");
        save(&Identity::create_local(), PASS, dir.path())?;

        let meta = std::fs::metadata(dir.path().join(IDENTITY_FILE)).expect("metadata");
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        Ok(())
    }

    #[cfg(feature = "stacks")]
    #[test]
    fn save_load_roundtrip_stacks() -> Result<()> {
        let dir = tempfile::tempdir().expect("tempdir");
        let (identity, phrase) = Identity::create_stacks(true)?;
        save(&identity, PASS, dir.path())?;

        let loaded = load(dir.path(), PASS)?;
        assert_eq!(loaded.principal(), identity.principal());
        assert_eq!(loaded.mode(), IdentityMode::Stacks);
        assert!(loaded.is_testnet());
        // The recovery phrase survives the encrypted roundtrip.
        let recovered = Identity::recover_stacks(&phrase, true)?;
        assert_eq!(recovered.principal(), loaded.principal());
        // Signing still works with the restored wallet secret.
        let sig = loaded.sign(b"post-load")?;
        crate::identity::verify_for_principal(loaded.principal(), b"post-load", &sig)
    }
}

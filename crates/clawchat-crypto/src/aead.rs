//! ChaCha20-Poly1305 authenticated encryption.
//!
//! Identity files use the 96-bit-nonce construction; the nonce is
//! freshly random per encryption and stored alongside the ciphertext.
//! A nonce must never be reused with the same key.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use clawchat_types::{ClawchatError, Result};
use rand::rngs::OsRng;
use rand::RngCore;

// ---------------------------------------------------------------------------
// AeadNonce
// ---------------------------------------------------------------------------

/// 96-bit (12-byte) nonce for ChaCha20-Poly1305.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct AeadNonce([u8; 12]);

impl AeadNonce {
    /// Fixed byte length of a ChaCha20-Poly1305 nonce.
    pub const LEN: usize = 12;

    /// Creates an [`AeadNonce`] from raw bytes.
    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    /// Returns the underlying 12-byte array.
    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

/// Generates a fresh random nonce from OS entropy.
pub fn generate_nonce() -> AeadNonce {
    let mut bytes = [0u8; 12];
    OsRng.fill_bytes(&mut bytes);
    AeadNonce(bytes)
}

// ---------------------------------------------------------------------------
// Encrypt / Decrypt
// ---------------------------------------------------------------------------

/// Encrypts `plaintext` under `key` with the given nonce.
///
/// The returned ciphertext carries the 16-byte Poly1305 tag appended.
/// `aad` is authenticated but not encrypted; pass `&[]` if unused.
pub fn encrypt(
    key: &[u8; 32],
    nonce: &AeadNonce,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(
            Nonce::from_slice(&nonce.0),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|e| ClawchatError::Auth {
            reason: format!("ChaCha20-Poly1305 encryption failed: {e}"),
        })
}

/// Decrypts `ciphertext` (tag appended) under `key` and `nonce`.
///
/// # Errors
///
/// Returns [`ClawchatError::Auth`] when tag verification fails —
/// wrong key, wrong nonce, tampered ciphertext, or mismatched AAD.
pub fn decrypt(
    key: &[u8; 32],
    nonce: &AeadNonce,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(
            Nonce::from_slice(&nonce.0),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|e| ClawchatError::Auth {
            reason: format!("ChaCha20-Poly1305 decryption failed: {e}"),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() -> Result<()> {
        let key = [0x42u8; 32];
        let nonce = generate_nonce();
        let plaintext = b"hello clawchat";

        let ciphertext = encrypt(&key, &nonce, plaintext, b"header")?;
        assert_ne!(ciphertext.as_slice(), plaintext.as_slice());
        assert_eq!(ciphertext.len(), plaintext.len() + 16);

        let decrypted = decrypt(&key, &nonce, &ciphertext, b"header")?;
        assert_eq!(decrypted.as_slice(), plaintext.as_slice());
        Ok(())
    }

    #[test]
    fn empty_plaintext_roundtrip() -> Result<()> {
        let key = [0x01u8; 32];
        let nonce = generate_nonce();
        let ciphertext = encrypt(&key, &nonce, b"", b"")?;
        assert_eq!(ciphertext.len(), 16);
        assert!(decrypt(&key, &nonce, &ciphertext, b"")?.is_empty());
        Ok(())
    }

    #[test]
    fn wrong_key_fails() -> Result<()> {
        let nonce = generate_nonce();
        let ciphertext = encrypt(&[0x42u8; 32], &nonce, b"secret", b"")?;
        assert!(decrypt(&[0x43u8; 32], &nonce, &ciphertext, b"").is_err());
        Ok(())
    }

    #[test]
    fn wrong_nonce_fails() -> Result<()> {
        let key = [0x42u8; 32];
        let ciphertext = encrypt(&key, &generate_nonce(), b"secret", b"")?;
        assert!(decrypt(&key, &generate_nonce(), &ciphertext, b"").is_err());
        Ok(())
    }

    #[test]
    fn tampered_ciphertext_fails() -> Result<()> {
        let key = [0x42u8; 32];
        let nonce = generate_nonce();
        let mut ciphertext = encrypt(&key, &nonce, b"secret", b"")?;
        ciphertext[0] ^= 0xFF;
        assert!(decrypt(&key, &nonce, &ciphertext, b"").is_err());
        Ok(())
    }

    #[test]
    fn wrong_aad_fails() -> Result<()> {
        let key = [0x42u8; 32];
        let nonce = generate_nonce();
        let ciphertext = encrypt(&key, &nonce, b"secret", b"right")?;
        assert!(decrypt(&key, &nonce, &ciphertext, b"wrong").is_err());
        Ok(())
    }

    #[test]
    fn generated_nonces_differ() {
        assert_ne!(generate_nonce().as_bytes(), generate_nonce().as_bytes());
    }
}

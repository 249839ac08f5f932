//! Argon2id key derivation for identity encryption.
//!
//! Derives a 256-bit file key from the owner's passphrase and a random
//! salt. The work factor is fixed by the implementation; every
//! identity file stores its salt so old files keep decrypting if the
//! defaults ever change.

use clawchat_types::{ClawchatError, Result};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

/// Fixed Argon2id parameters for identity files.
///
/// | Parameter | Value   | Meaning |
/// |-----------|---------|---------|
/// | `m_cost`  | 131 072 | Memory in KiB (128 MiB, 2^17) |
/// | `t_cost`  | 3       | Passes |
/// | `p_cost`  | 1       | Lanes |
#[derive(Clone, Copy, Debug)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    /// Time cost (number of passes).
    pub t_cost: u32,
    /// Parallelism degree.
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            m_cost: 131_072,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

/// Required salt length for identity files.
pub const SALT_LEN: usize = 16;

// ---------------------------------------------------------------------------
// FileKey
// ---------------------------------------------------------------------------

/// 256-bit key derived by Argon2id, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct FileKey([u8; 32]);

impl FileKey {
    /// Fixed byte length of the derived key.
    pub const LEN: usize = 32;

    /// Returns the raw key material.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

// FileKey deliberately implements neither Clone nor Debug.

// ---------------------------------------------------------------------------
// Derivation
// ---------------------------------------------------------------------------

/// Derives a 256-bit file key from a passphrase and salt.
///
/// # Errors
///
/// - [`ClawchatError::Config`] if the salt is not [`SALT_LEN`] bytes or
///   the parameters are rejected by the library.
/// - [`ClawchatError::Auth`] if the Argon2 computation itself fails.
pub fn derive_file_key(passphrase: &[u8], salt: &[u8], params: &KdfParams) -> Result<FileKey> {
    if salt.len() != SALT_LEN {
        return Err(ClawchatError::Config {
            reason: format!("salt must be {SALT_LEN} bytes, got {}", salt.len()),
        });
    }

    let argon2_params =
        argon2::Params::new(params.m_cost, params.t_cost, params.p_cost, Some(FileKey::LEN))
            .map_err(|e| ClawchatError::Config {
                reason: format!("invalid Argon2 parameters: {e}"),
            })?;

    let argon2 = argon2::Argon2::new(
        argon2::Algorithm::Argon2id,
        argon2::Version::V0x13,
        argon2_params,
    );

    let mut output = [0u8; 32];
    argon2
        .hash_password_into(passphrase, salt, &mut output)
        .map_err(|e| ClawchatError::Auth {
            reason: format!("Argon2id derivation failed: {e}"),
        })?;

    Ok(FileKey(output))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Light parameters so the suite stays fast.
    fn test_params() -> KdfParams {
        KdfParams {
            m_cost: 256,
            t_cost: 1,
            p_cost: 1,
        }
    }

    #[test]
    fn derivation_is_deterministic() -> Result<()> {
        let salt = [0x42u8; SALT_LEN];
        let k1 = derive_file_key(b"correct horse battery staple", &salt, &test_params())?;
        let k2 = derive_file_key(b"correct horse battery staple", &salt, &test_params())?;
        assert_eq!(k1.as_bytes(), k2.as_bytes());
        Ok(())
    }

    #[test]
    fn different_passphrase_different_key() -> Result<()> {
        let salt = [0x42u8; SALT_LEN];
        let k1 = derive_file_key(b"passphrase one", &salt, &test_params())?;
        let k2 = derive_file_key(b"passphrase two", &salt, &test_params())?;
        assert_ne!(k1.as_bytes(), k2.as_bytes());
        Ok(())
    }

    #[test]
    fn different_salt_different_key() -> Result<()> {
        let k1 = derive_file_key(b"same", &[0x01u8; SALT_LEN], &test_params())?;
        let k2 = derive_file_key(b"same", &[0x02u8; SALT_LEN], &test_params())?;
        assert_ne!(k1.as_bytes(), k2.as_bytes());
        Ok(())
    }

    #[test]
    fn wrong_salt_length_rejected() {
        assert!(derive_file_key(b"pw", b"short", &test_params()).is_err());
        assert!(derive_file_key(b"pw", &[0u8; 32], &test_params()).is_err());
    }

    #[test]
    fn zero_t_cost_rejected() {
        let params = KdfParams {
            t_cost: 0,
            ..test_params()
        };
        assert!(derive_file_key(b"pw", &[0u8; SALT_LEN], &params).is_err());
    }
}

//! Stacks-mode wallet support: BIP39 mnemonics, secp256k1 keys, and
//! c32check addresses.
//!
//! Only compiled with the `stacks` cargo feature. The wallet key is
//! derived from the BIP39 seed through a tagged HMAC-SHA512 step (see
//! [`wallet_key_from_seed`]); interoperability with external wallet
//! software is not a goal — determinism and checksum validation are.
//!
//! Addresses use the c32check scheme: version byte 22 (mainnet, `SP…`)
//! or 26 (testnet, `ST…`) over `RIPEMD160(SHA256(compressed pubkey))`
//! with a 4-byte double-SHA256 checksum.

use bip39::{Language, Mnemonic};
use hmac::{Hmac, Mac};
use k256::ecdsa::{RecoveryId, Signature as EcdsaSignature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use zeroize::Zeroizing;

use clawchat_types::{ClawchatError, Result};

/// Byte length of a recoverable signature: recovery id ‖ r ‖ s.
pub const RECOVERABLE_SIG_LEN: usize = 65;

/// c32check address version for mainnet single-sig (`SP…`).
const VERSION_MAINNET: u8 = 22;

/// c32check address version for testnet single-sig (`ST…`).
const VERSION_TESTNET: u8 = 26;

// ---------------------------------------------------------------------------
// Mnemonics
// ---------------------------------------------------------------------------

/// Generates a fresh 24-word BIP39 mnemonic (256-bit entropy).
pub fn generate_mnemonic() -> Result<Zeroizing<String>> {
    let mnemonic =
        Mnemonic::generate_in(Language::English, 24).map_err(|e| ClawchatError::Auth {
            reason: format!("mnemonic generation failed: {e}"),
        })?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Lowercases and collapses whitespace so user-pasted phrases parse.
fn normalize_phrase(phrase: &str) -> Zeroizing<String> {
    Zeroizing::new(
        phrase
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    )
}

/// Validates a 24-word BIP39 mnemonic: word count, wordlist
/// membership, and checksum.
pub fn validate_mnemonic(phrase: &str) -> Result<()> {
    let words = phrase.split_whitespace().count();
    if words != 24 {
        return Err(ClawchatError::Auth {
            reason: format!("mnemonic must be 24 words, got {words}"),
        });
    }
    Mnemonic::parse_in_normalized(Language::English, &normalize_phrase(phrase))
        .map(|_| ())
        .map_err(|e| ClawchatError::Auth {
            reason: format!("invalid mnemonic: {e}"),
        })
}

/// Derives the 64-byte BIP39 seed (empty passphrase).
pub fn mnemonic_to_seed(phrase: &str) -> Result<Zeroizing<[u8; 64]>> {
    let mnemonic =
        Mnemonic::parse_in_normalized(Language::English, &normalize_phrase(phrase)).map_err(
            |e| ClawchatError::Auth {
                reason: format!("invalid mnemonic: {e}"),
            },
        )?;
    Ok(Zeroizing::new(mnemonic.to_seed("")))
}

// ---------------------------------------------------------------------------
// Wallet key derivation
// ---------------------------------------------------------------------------

type HmacSha512 = Hmac<Sha512>;

/// Derivation tag separating wallet keys from any other seed use.
const WALLET_KEY_TAG: &[u8] = b"clawchat-stacks-wallet-v1";

/// Derives the secp256k1 wallet signing key from a BIP39 seed.
///
/// `HMAC-SHA512(tag, seed ‖ counter)` is taken and its first 32 bytes
/// interpreted as a scalar; the counter bumps on the (negligible)
/// chance the candidate is not a valid key.
pub fn wallet_key_from_seed(seed: &[u8; 64]) -> Result<SigningKey> {
    for counter in 0u8..=255 {
        let mut mac =
            HmacSha512::new_from_slice(WALLET_KEY_TAG).map_err(|e| ClawchatError::Auth {
                reason: format!("HMAC init failed: {e}"),
            })?;
        mac.update(seed);
        mac.update(&[counter]);
        let out = mac.finalize().into_bytes();
        if let Ok(key) = SigningKey::from_slice(&out[..32]) {
            return Ok(key);
        }
    }
    Err(ClawchatError::Auth {
        reason: "seed yielded no valid secp256k1 scalar".into(),
    })
}

// ---------------------------------------------------------------------------
// StacksWallet
// ---------------------------------------------------------------------------

/// A secp256k1 wallet keypair plus its network flag.
pub struct StacksWallet {
    key: SigningKey,
    testnet: bool,
}

impl StacksWallet {
    /// Builds a wallet from a validated 24-word mnemonic.
    pub fn from_mnemonic(phrase: &str, testnet: bool) -> Result<Self> {
        validate_mnemonic(phrase)?;
        let seed = mnemonic_to_seed(phrase)?;
        let key = wallet_key_from_seed(&seed)?;
        Ok(Self { key, testnet })
    }

    /// Reconstructs a wallet from the raw 32-byte secret key.
    pub fn from_secret_bytes(secret: &[u8; 32], testnet: bool) -> Result<Self> {
        let key = SigningKey::from_slice(secret).map_err(|e| ClawchatError::Auth {
            reason: format!("invalid secp256k1 secret key: {e}"),
        })?;
        Ok(Self { key, testnet })
    }

    /// Returns the 32-byte secret key.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.key.to_bytes());
        Zeroizing::new(out)
    }

    /// Returns the 33-byte compressed public key.
    pub fn public_key_bytes(&self) -> [u8; 33] {
        let point = self.key.verifying_key().to_encoded_point(true);
        let mut out = [0u8; 33];
        out.copy_from_slice(point.as_bytes());
        out
    }

    /// Returns the network flag.
    pub fn is_testnet(&self) -> bool {
        self.testnet
    }

    /// Derives the c32check address for this wallet.
    pub fn address(&self) -> String {
        address_from_public_key(&self.public_key_bytes(), self.testnet)
    }

    /// Signs `message` with recoverable ECDSA over its SHA-256 digest.
    ///
    /// Output layout: `recovery_id(1) ‖ r(32) ‖ s(32)`.
    pub fn sign_recoverable(&self, message: &[u8]) -> Result<[u8; RECOVERABLE_SIG_LEN]> {
        let digest = Sha256::digest(message);
        let (sig, recid) = self
            .key
            .sign_prehash_recoverable(&digest)
            .map_err(|e| ClawchatError::Auth {
                reason: format!("recoverable signing failed: {e}"),
            })?;

        let mut out = [0u8; RECOVERABLE_SIG_LEN];
        out[0] = recid.to_byte();
        out[1..].copy_from_slice(&sig.to_bytes());
        Ok(out)
    }
}

/// Recovers the signer's c32check address from a recoverable
/// signature over `message`.
pub fn recover_address(
    message: &[u8],
    signature: &[u8; RECOVERABLE_SIG_LEN],
    testnet: bool,
) -> Result<String> {
    let recid = RecoveryId::from_byte(signature[0]).ok_or_else(|| ClawchatError::Auth {
        reason: format!("invalid recovery id byte: {}", signature[0]),
    })?;
    let sig = EcdsaSignature::from_slice(&signature[1..]).map_err(|e| ClawchatError::Auth {
        reason: format!("malformed ECDSA signature: {e}"),
    })?;

    let digest = Sha256::digest(message);
    let vk = VerifyingKey::recover_from_prehash(&digest, &sig, recid).map_err(|e| {
        ClawchatError::Auth {
            reason: format!("public key recovery failed: {e}"),
        }
    })?;

    let point = vk.to_encoded_point(true);
    let mut compressed = [0u8; 33];
    compressed.copy_from_slice(point.as_bytes());
    Ok(address_from_public_key(&compressed, testnet))
}

// ---------------------------------------------------------------------------
// c32check addresses
// ---------------------------------------------------------------------------

/// Crockford-style alphabet used by c32 encoding.
const C32_ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Derives a c32check address from a compressed secp256k1 public key.
pub fn address_from_public_key(compressed_pubkey: &[u8; 33], testnet: bool) -> String {
    let version = if testnet {
        VERSION_TESTNET
    } else {
        VERSION_MAINNET
    };
    let hash160 = hash160(compressed_pubkey);
    c32check_encode(version, &hash160)
}

/// `RIPEMD160(SHA256(data))`.
fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

/// Encodes `S` + version char + c32(payload ‖ checksum4).
fn c32check_encode(version: u8, payload: &[u8; 20]) -> String {
    let checksum = c32_checksum(version, payload);
    let mut data = Vec::with_capacity(24);
    data.extend_from_slice(payload);
    data.extend_from_slice(&checksum);

    let mut out = String::with_capacity(2 + data.len() * 8 / 5 + 1);
    out.push('S');
    out.push(C32_ALPHABET[(version & 0x1F) as usize] as char);
    out.push_str(&c32_encode(&data));
    out
}

/// Parses a c32check address back into `(version, hash160)`.
///
/// Used by address validation and the test suite.
pub fn c32check_decode(address: &str) -> Result<(u8, [u8; 20])> {
    let rest = address.strip_prefix('S').ok_or_else(|| ClawchatError::Auth {
        reason: format!("address must start with 'S': '{address}'"),
    })?;
    let mut chars = rest.chars();
    let version_char = chars.next().ok_or_else(|| ClawchatError::Auth {
        reason: "address too short".into(),
    })?;
    let version = c32_char_value(version_char)?;

    let data = c32_decode(chars.as_str(), 24)?;
    let (payload, checksum) = data.split_at(20);
    let mut hash = [0u8; 20];
    hash.copy_from_slice(payload);

    if checksum != c32_checksum(version, &hash) {
        return Err(ClawchatError::Auth {
            reason: format!("address checksum mismatch: '{address}'"),
        });
    }
    Ok((version, hash))
}

/// First four bytes of `SHA256(SHA256(version ‖ payload))`.
fn c32_checksum(version: u8, payload: &[u8; 20]) -> [u8; 4] {
    let mut first = Sha256::new();
    first.update([version]);
    first.update(payload);
    let second = Sha256::digest(first.finalize());
    let mut out = [0u8; 4];
    out.copy_from_slice(&second[..4]);
    out
}

/// Packs bytes into 5-bit c32 symbols, MSB-first with front padding.
fn c32_encode(data: &[u8]) -> String {
    let nbits = data.len() * 8;
    let pad = (5 - (nbits % 5)) % 5;

    let mut out = Vec::with_capacity(nbits / 5 + 1);
    let mut acc: u32 = 0;
    let mut acc_bits: u32 = pad as u32;
    for &byte in data {
        acc = (acc << 8) | u32::from(byte);
        acc_bits += 8;
        while acc_bits >= 5 {
            let idx = (acc >> (acc_bits - 5)) & 0x1F;
            out.push(C32_ALPHABET[idx as usize]);
            acc_bits -= 5;
            acc &= (1u32 << acc_bits) - 1;
        }
    }
    String::from_utf8(out).unwrap_or_default()
}

/// Inverse of [`c32_encode`] for a known output byte length.
fn c32_decode(s: &str, expected_len: usize) -> Result<Vec<u8>> {
    let symbol_count = s.chars().count();
    let expected_symbols = (expected_len * 8).div_ceil(5);
    if symbol_count != expected_symbols {
        return Err(ClawchatError::Auth {
            reason: format!(
                "expected {expected_symbols} c32 symbols, got {symbol_count}"
            ),
        });
    }

    // Reconstruct the padded bitstream, then drop the front padding.
    let pad = symbol_count * 5 - expected_len * 8;
    let mut bits = Vec::with_capacity(symbol_count * 5);
    for c in s.chars() {
        let value = c32_char_value(c)?;
        for j in (0..5).rev() {
            bits.push((value >> j) & 1);
        }
    }

    if bits[..pad].iter().any(|&b| b != 0) {
        return Err(ClawchatError::Auth {
            reason: "non-canonical c32 padding".into(),
        });
    }

    let mut out = vec![0u8; expected_len];
    for (i, &bit) in bits[pad..].iter().enumerate() {
        if bit == 1 {
            out[i / 8] |= 1 << (7 - (i % 8));
        }
    }
    Ok(out)
}

/// Maps a c32 symbol to its 5-bit value.
fn c32_char_value(c: char) -> Result<u8> {
    let upper = c.to_ascii_uppercase() as u8;
    C32_ALPHABET
        .iter()
        .position(|&a| a == upper)
        .map(|i| i as u8)
        .ok_or_else(|| ClawchatError::Auth {
            reason: format!("invalid c32 character: '{c}'"),
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Cryptographic primitives for the Clawchat gateway.
//!
//! - [`kdf`] — Argon2id passphrase hardening for identities at rest.
//! - [`aead`] — ChaCha20-Poly1305 authenticated encryption.
//! - [`signing`] — Ed25519 keypairs for local identities and node keys.
//! - [`stacks`] — secp256k1 wallets, BIP39 mnemonics, and c32check
//!   addresses (cargo feature `stacks`).

pub mod aead;
pub mod kdf;
pub mod signing;

#[cfg(feature = "stacks")]
pub mod stacks;

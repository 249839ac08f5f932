//! Durable per-identity state for the Clawchat gateway.
//!
//! - [`layout`] — the on-disk directory contract, with legacy
//!   single-identity detection.
//! - [`mailbox`] — inbox/outbox JSON arrays with single-writer
//!   rewrite-on-mutation persistence.
//! - [`peer_book`] — known-peer records with set-merge address
//!   semantics.
//!
//! Nothing here reaches for a process-global data directory; every
//! path is explicit configuration so several gateways can coexist in
//! one test process.

pub mod layout;
pub mod mailbox;
pub mod peer_book;

pub use layout::DataLayout;
pub use mailbox::Mailbox;
pub use peer_book::PeerBook;

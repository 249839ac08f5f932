//! Transport adapter for the Clawchat gateway.
//!
//! Wraps a libp2p swarm (TCP + Noise + Yamux) with the raw-stream
//! behaviour and exposes exactly what the session layer needs:
//! bidirectional byte streams to remote nodes identified by a stable
//! 32-byte node key, plus dialing by multi-address. Everything else —
//! hole punching, relays, discovery — is out of this crate's hands.

pub mod addr;
pub mod keys;
pub mod node;

pub use addr::normalize_multiaddr;
pub use node::{spawn, NetworkEvent, NetworkHandle};

/// The SNaP2P stream protocol id negotiated over the muxer.
pub const SNAP2P_PROTOCOL: libp2p::StreamProtocol =
    libp2p::StreamProtocol::new("/snap2p/1.0.0");

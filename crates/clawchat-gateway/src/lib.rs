//! The Clawchat gateway: one daemon hosting several cryptographic
//! identities over one peer-to-peer transport.
//!
//! The daemon authenticates sessions with node-key attestations
//! (SNaP2P), gossips peer contacts over them (PX-1), keeps durable
//! per-identity mailboxes with at-least-once outbound retry, and
//! exposes a newline-delimited JSON control plane on a Unix socket.
//!
//! Construct a [`Gateway`] from a [`config::GatewayConfig`] and a
//! data directory, then drive it with [`Gateway::run`]. Front-ends
//! talk to it through [`command::GatewayCommand`] or the IPC socket.

pub mod command;
pub mod config;
mod delivery;
pub mod event_loop;
pub mod ipc;
pub mod manager;
mod px;
pub mod session;
pub mod wake;

pub use config::GatewayConfig;
pub use event_loop::Gateway;

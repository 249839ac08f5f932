//! SNaP2P wire protocol: session frames and the PX-1 peer-exchange
//! record model.
//!
//! Frames travel over an authenticated transport stream as
//! `u32be(length) ‖ CBOR(frame)` records. The handshake exchanges
//! [`frame::HelloFrame`]s carrying node-key attestations; everything
//! after authentication is chat or peer-exchange traffic.

pub mod frame;
pub mod px;

pub use frame::{read_frame, write_frame, ChatFrame, Frame, HelloFrame};
pub use px::{PxRecord, MAX_PX_RECORDS_PER_PUSH};

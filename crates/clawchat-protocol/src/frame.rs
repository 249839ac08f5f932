//! SNaP2P frame model and length-prefixed stream codec.
//!
//! Every record on the wire is `u32be(length) ‖ CBOR(Frame)`. Control
//! frames (hello and peer exchange) are capped at 64 KiB, chat frames
//! at 256 KiB; an oversize record is a protocol error and the session
//! closes.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{Deserialize, Serialize};

use clawchat_identity::Attestation;
use clawchat_types::{ClawchatError, MessageId, Principal, Result, Timestamp};

use crate::px::PxRecord;

// ---------------------------------------------------------------------------
// Size limits
// ---------------------------------------------------------------------------

/// Maximum encoded size of a control frame (hello, px_*).
pub const MAX_CONTROL_FRAME_LEN: usize = 64 * 1024;

/// Maximum encoded size of a chat frame.
pub const MAX_CHAT_FRAME_LEN: usize = 256 * 1024;

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// One SNaP2P wire record.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Handshake record, the first frame in each direction.
    Hello(HelloFrame),
    /// A direct message after authentication.
    Chat(ChatFrame),
    /// Unsolicited batch of peer records.
    PxPush {
        /// Gossip payload, capped at [`crate::px::MAX_PX_RECORDS_PER_PUSH`].
        peers: Vec<PxRecord>,
    },
    /// Targeted request for one principal's contact record.
    PxRequest {
        /// The principal being resolved.
        principal: Principal,
    },
    /// Best-effort answer to a [`Frame::PxRequest`].
    PxResponse {
        /// The record, when the responder knows the principal.
        record: Option<PxRecord>,
    },
}

impl Frame {
    /// Encoded-size cap for this frame type.
    fn max_len(&self) -> usize {
        match self {
            Frame::Chat(_) => MAX_CHAT_FRAME_LEN,
            _ => MAX_CONTROL_FRAME_LEN,
        }
    }

    /// Short type name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::Chat(_) => "chat",
            Frame::PxPush { .. } => "px_push",
            Frame::PxRequest { .. } => "px_request",
            Frame::PxResponse { .. } => "px_response",
        }
    }
}

// ---------------------------------------------------------------------------
// HelloFrame
// ---------------------------------------------------------------------------

/// Handshake payload: the sender's attestation for its node key, plus
/// the principal it wants to reach on the other end.
///
/// A gateway hosting several identities uses `target` to pick which
/// one answers; without it the default identity does.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloFrame {
    /// Attestation binding the sender's principal to its node key.
    pub attestation: Attestation,
    /// The remote principal the sender wants to talk to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<Principal>,
}

// ---------------------------------------------------------------------------
// ChatFrame
// ---------------------------------------------------------------------------

/// A direct message. The sender principal is not carried here — it is
/// bound by the session's attestation, never by frame contents.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatFrame {
    /// Sender-generated 128-bit id; receivers drop duplicates.
    pub id: MessageId,
    /// UTF-8 message body.
    pub content: String,
    /// Sender's clock at send time, ms since epoch.
    pub timestamp: Timestamp,
    /// Sender's display nick, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_nick: Option<String>,
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Reads one length-prefixed frame from the stream.
///
/// # Errors
///
/// - [`ClawchatError::Transport`] on stream I/O failure or EOF.
/// - [`ClawchatError::Protocol`] on an oversize record or CBOR that
///   does not decode to a [`Frame`].
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| ClawchatError::Transport {
            reason: format!("stream read failed: {e}"),
        })?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_CHAT_FRAME_LEN {
        return Err(ClawchatError::Protocol {
            reason: format!("frame length {len} outside accepted range"),
        });
    }

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| ClawchatError::Transport {
            reason: format!("stream read failed: {e}"),
        })?;

    let frame: Frame =
        ciborium::from_reader(body.as_slice()).map_err(|e| ClawchatError::Protocol {
            reason: format!("malformed frame: {e}"),
        })?;

    if len > frame.max_len() {
        return Err(ClawchatError::Protocol {
            reason: format!("{} frame of {len} bytes exceeds its cap", frame.kind()),
        });
    }

    Ok(frame)
}

/// Writes one length-prefixed frame and flushes.
///
/// # Errors
///
/// - [`ClawchatError::Protocol`] if the encoded frame exceeds its cap.
/// - [`ClawchatError::Transport`] on stream I/O failure.
pub async fn write_frame<W>(writer: &mut W, frame: &Frame) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut body = Vec::new();
    ciborium::into_writer(frame, &mut body).map_err(|e| ClawchatError::Protocol {
        reason: format!("frame encoding failed: {e}"),
    })?;

    if body.len() > frame.max_len() {
        return Err(ClawchatError::Protocol {
            reason: format!(
                "{} frame of {} bytes exceeds its cap",
                frame.kind(),
                body.len()
            ),
        });
    }

    let len = (body.len() as u32).to_be_bytes();
    writer
        .write_all(&len)
        .await
        .map_err(|e| ClawchatError::Transport {
            reason: format!("stream write failed: {e}"),
        })?;
    writer
        .write_all(&body)
        .await
        .map_err(|e| ClawchatError::Transport {
            reason: format!("stream write failed: {e}"),
        })?;
    writer.flush().await.map_err(|e| ClawchatError::Transport {
        reason: format!("stream flush failed: {e}"),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

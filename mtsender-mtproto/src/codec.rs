//! The seam between the sender and whoever turns messages into packets.
//!
//! Encryption (MTProto 2.0 with the negotiated auth key) is a collaborator of
//! this workspace: it implements [`MessageCodec`] and is handed to the sender
//! at construction. [`PlainCodec`] is the unencrypted variant, used before a
//! key exists and in loopback tests.

use std::fmt;

use crate::envelope::{self, Incoming};
use crate::message::{Message, MessageId};
use crate::wire::{Cursor, WireError};

/// Turns outgoing messages into packets and incoming packets into envelopes.
pub trait MessageCodec: Send + 'static {
    /// Produce the packet for one message.
    fn pack(&mut self, message: &Message) -> Result<Vec<u8>, CodecError>;

    /// Decode one received packet.
    fn unpack(&mut self, packet: &[u8]) -> Result<Vec<Incoming>, CodecError>;

    /// The server told us to use a different salt from now on.
    fn set_salt(&mut self, _salt: i64) {}
}

// ─── CodecError ──────────────────────────────────────────────────────────────

/// Errors raised while packing or unpacking.
#[derive(Clone, Debug, PartialEq)]
pub enum CodecError {
    /// Malformed TL inside an otherwise intact packet.
    Wire(WireError),
    /// Packet shorter than its fixed header.
    FrameTooShort,
    /// The declared body length disagrees with the packet size.
    LengthMismatch {
        /// Length written in the header.
        declared: usize,
        /// Size of the whole packet.
        actual:   usize,
    },
    /// A plaintext packet carried a non-zero auth key id.
    UnexpectedAuthKeyId(u64),
    /// The server answered with a bare transport error code instead of a
    /// packet (e.g. `-404` when it no longer knows our auth key).
    InvalidBuffer {
        /// Positive error code (404, 429, …).
        code: i32,
    },
    /// A `gzip_packed` payload could not be inflated or deflated.
    Gzip(String),
    /// Failure reported by an external codec implementation.
    Other(String),
}

impl CodecError {
    /// Whether the receive loop can skip the offending packet and carry on.
    ///
    /// Transport-level failures (`InvalidBuffer`) mean the byte stream can no
    /// longer be trusted and the connection has to go.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::InvalidBuffer { .. } | Self::FrameTooShort)
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wire(e)                => write!(f, "malformed message: {e}"),
            Self::FrameTooShort          => write!(f, "packet too short"),
            Self::LengthMismatch { declared, actual } => {
                write!(f, "body length {declared} does not fit packet of {actual} bytes")
            }
            Self::UnexpectedAuthKeyId(id) => write!(f, "expected auth_key_id=0, got {id:#018x}"),
            Self::InvalidBuffer { code } => write!(f, "server sent transport error {code}"),
            Self::Gzip(e)                => write!(f, "gzip: {e}"),
            Self::Other(e)               => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CodecError {}

impl From<WireError> for CodecError {
    fn from(e: WireError) -> Self { Self::Wire(e) }
}

// ─── PlainCodec ──────────────────────────────────────────────────────────────

/// Unencrypted framing: `auth_key_id (0) | msg_id | length | body`.
///
/// Plaintext messages carry no sequence number, so everything unpacked here
/// is reported with `seq_no = 0` and never needs acknowledging.
#[derive(Debug, Default)]
pub struct PlainCodec;

impl PlainCodec {
    /// A plaintext codec.
    pub fn new() -> Self { Self }
}

impl MessageCodec for PlainCodec {
    fn pack(&mut self, message: &Message) -> Result<Vec<u8>, CodecError> {
        Ok(message.to_plaintext_bytes())
    }

    fn unpack(&mut self, packet: &[u8]) -> Result<Vec<Incoming>, CodecError> {
        if packet.len() == 4 {
            let code = i32::from_le_bytes([packet[0], packet[1], packet[2], packet[3]]);
            return Err(CodecError::InvalidBuffer { code: code.saturating_neg() });
        }
        if packet.len() < 20 {
            return Err(CodecError::FrameTooShort);
        }
        let mut cur = Cursor::from_slice(packet);
        let key_id = cur.read_i64()? as u64;
        if key_id != 0 {
            return Err(CodecError::UnexpectedAuthKeyId(key_id));
        }
        let msg_id: MessageId = cur.read_msg_id()?;
        let len = cur.read_u32()? as usize;
        if len > cur.remaining() {
            return Err(CodecError::LengthMismatch { declared: len, actual: packet.len() });
        }
        let body = cur.take(len)?;
        envelope::parse(msg_id, 0, body)
    }
}

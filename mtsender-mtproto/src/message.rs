//! MTProto message framing types.

use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// A 64-bit MTProto message identifier.
///
/// The upper 32 bits carry Unix seconds (server-corrected), the lower 32 bits
/// a sub-second fraction shifted left by two; client ids keep the two least
/// significant bits at zero.
///
/// This is the only key type of the pending table. Identifiers arriving as
/// text (logs, storage, JS bridges) go through [`FromStr`] first so equality
/// never depends on how the id happened to be written.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct MessageId(pub u64);

impl MessageId {
    /// Unix seconds encoded in the upper half of the id.
    pub fn unix_secs(self) -> i64 {
        (self.0 >> 32) as i64
    }

    /// The id as the signed `long` that appears on the wire.
    pub fn as_i64(self) -> i64 {
        self.0 as i64
    }
}

impl From<u64> for MessageId {
    fn from(v: u64) -> Self { Self(v) }
}

impl From<i64> for MessageId {
    fn from(v: i64) -> Self { Self(v as u64) }
}

impl FromStr for MessageId {
    type Err = ParseIntError;

    /// Accepts both the unsigned form and the signed `long` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s.parse::<u64>() {
            Ok(v) => Ok(Self(v)),
            Err(e) => s.parse::<i64>().map(Self::from).map_err(|_| e),
        }
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A framed MTProto message ready to be handed to a codec.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// Session-scoped sequence number (even for content-unrelated, odd for content-related).
    pub seq_no: i32,
    /// The serialized TL body (constructor ID + fields).
    pub body: Vec<u8>,
}

impl Message {
    /// Construct a new message.
    pub fn new(id: MessageId, seq_no: i32, body: Vec<u8>) -> Self {
        Self { id, seq_no, body }
    }

    /// Whether the peer has to acknowledge this message.
    pub fn is_content_related(&self) -> bool {
        self.seq_no & 1 == 1
    }

    /// Serialize the message into the plaintext wire format:
    ///
    /// ```text
    /// auth_key_id:long  (0 for plaintext)
    /// message_id:long
    /// message_data_length:int
    /// message_data:bytes
    /// ```
    pub fn to_plaintext_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + 8 + 4 + self.body.len());
        buf.extend(0i64.to_le_bytes());
        buf.extend(self.id.0.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }
}

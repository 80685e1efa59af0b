//! TL binary primitives: the [`Serializable`] trait, the read [`Cursor`] and
//! the [`RemoteCall`] seam through which callers hand in requests.
//!
//! The application schema (types, functions, codegen) is not part of this
//! workspace. Anything that can write itself as TL bytes can be invoked.
//!
//! Encoding follows the [MTProto Binary Serialization] rules.
//!
//! [MTProto Binary Serialization]: https://core.telegram.org/mtproto/serialize

use std::fmt;

use crate::message::MessageId;

/// Boxed `Vector` constructor id.
pub const ID_VECTOR: u32 = 0x1cb5c415;

// ─── Serializable ─────────────────────────────────────────────────────────────

/// Serialize `self` into TL binary format.
pub trait Serializable {
    /// Appends the serialized form of `self` to `buf`.
    fn serialize(&self, buf: &mut impl Extend<u8>);

    /// Convenience: allocate a fresh `Vec<u8>` and serialize into it.
    fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::new();
        self.serialize(&mut v);
        v
    }
}

/// Marks a request that can be sent as an RPC call.
///
/// The response comes back as the raw result buffer; decoding it is the
/// caller's business.
pub trait RemoteCall: Serializable {
    /// Name used in logs and error diagnostics.
    fn name(&self) -> &str;
}

/// A request that is already serialized.
#[derive(Clone, Debug, PartialEq)]
pub struct RawCall {
    /// Diagnostic name, e.g. `"help.getConfig"`.
    pub name: String,
    /// TL bytes, constructor id included.
    pub body: Vec<u8>,
}

impl RawCall {
    /// Wrap pre-serialized bytes.
    pub fn new(name: impl Into<String>, body: Vec<u8>) -> Self {
        Self { name: name.into(), body }
    }
}

impl Serializable for RawCall {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.body.iter().copied());
    }
}

impl RemoteCall for RawCall {
    fn name(&self) -> &str { &self.name }
}

// ─── integers ────────────────────────────────────────────────────────────────

impl Serializable for i32 {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.to_le_bytes());
    }
}

impl Serializable for u32 {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.to_le_bytes());
    }
}

impl Serializable for i64 {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.to_le_bytes());
    }
}

impl Serializable for MessageId {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        buf.extend(self.0.to_le_bytes());
    }
}

// ─── strings / bytes ─────────────────────────────────────────────────────────

/// TL string encoding: a length-prefixed, 4-byte aligned byte string.
///
/// * If `len ≤ 253`: `[len as u8][data][0-padding to align to 4 bytes]`
/// * If `len ≥ 254`: `[0xfe][len as 3 LE bytes][data][0-padding]`
impl Serializable for &[u8] {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        let len = self.len();
        let header_len = if len <= 253 {
            buf.extend([len as u8]);
            1
        } else {
            buf.extend([
                0xfe,
                (len & 0xff) as u8,
                ((len >> 8) & 0xff) as u8,
                ((len >> 16) & 0xff) as u8,
            ]);
            4
        };
        let padding = (4 - ((header_len + len) % 4)) % 4;
        buf.extend(self.iter().copied());
        buf.extend(std::iter::repeat(0u8).take(padding));
    }
}

impl Serializable for Vec<u8> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_slice().serialize(buf);
    }
}

impl Serializable for &str {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_bytes().serialize(buf);
    }
}

impl Serializable for String {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        self.as_bytes().serialize(buf);
    }
}

// ─── vectors ─────────────────────────────────────────────────────────────────

/// Boxed `Vector<T>`, prefixed with constructor ID `0x1cb5c415`.
impl<T: Serializable> Serializable for Vec<T> {
    fn serialize(&self, buf: &mut impl Extend<u8>) {
        ID_VECTOR.serialize(buf);
        (self.len() as i32).serialize(buf);
        for item in self { item.serialize(buf); }
    }
}

// ─── WireError ───────────────────────────────────────────────────────────────

/// Errors that can occur while reading TL bytes.
#[derive(Clone, Debug, PartialEq)]
pub enum WireError {
    /// Ran out of bytes before the value was fully read.
    UnexpectedEof,
    /// Decoded a constructor ID that doesn't fit here.
    UnexpectedConstructor {
        /// The offending constructor id.
        id: u32,
    },
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "unexpected end of buffer"),
            Self::UnexpectedConstructor { id } => {
                write!(f, "unexpected constructor id: {id:#010x}")
            }
        }
    }
}

impl std::error::Error for WireError {}

// ─── Cursor ──────────────────────────────────────────────────────────────────

/// A zero-copy cursor over an in-memory byte slice.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Create a cursor positioned at the start of `buf`.
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Current byte offset.
    pub fn pos(&self) -> usize { self.pos }

    /// Remaining bytes.
    pub fn remaining(&self) -> usize { self.buf.len() - self.pos }

    /// Borrow `n` bytes and advance past them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos.checked_add(n).ok_or(WireError::UnexpectedEof)?;
        let out = self.buf.get(self.pos..end).ok_or(WireError::UnexpectedEof)?;
        self.pos = end;
        Ok(out)
    }

    /// Borrow everything that is left.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    /// Peek at the next constructor id without consuming it.
    pub fn peek_u32(&self) -> Option<u32> {
        let b = self.buf.get(self.pos..self.pos + 4)?;
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Read a single byte.
    pub fn read_byte(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }

    /// Read a little-endian `u32`.
    pub fn read_u32(&mut self) -> Result<u32, WireError> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    /// Read a little-endian `i32`.
    pub fn read_i32(&mut self) -> Result<i32, WireError> {
        self.read_u32().map(|v| v as i32)
    }

    /// Read a little-endian `i64`.
    pub fn read_i64(&mut self) -> Result<i64, WireError> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(i64::from_le_bytes(b))
    }

    /// Read a message id (`long`).
    pub fn read_msg_id(&mut self) -> Result<MessageId, WireError> {
        self.read_i64().map(MessageId::from)
    }

    /// Read a TL `bytes` value, skipping its alignment padding.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let first = self.read_byte()?;
        let (len, header_len) = if first != 0xfe {
            (first as usize, 1)
        } else {
            let b = self.take(3)?;
            (b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16, 4)
        };
        let data = self.take(len)?.to_vec();
        let padding = (4 - ((header_len + len) % 4)) % 4;
        self.take(padding)?;
        Ok(data)
    }

    /// Read a TL `string`. Invalid UTF-8 is replaced rather than rejected;
    /// error messages are diagnostics, not data.
    pub fn read_string(&mut self) -> Result<String, WireError> {
        self.read_bytes().map(|b| String::from_utf8_lossy(&b).into_owned())
    }

    /// Read a boxed `Vector<long>`.
    pub fn read_msg_id_vector(&mut self) -> Result<Vec<MessageId>, WireError> {
        let id = self.read_u32()?;
        if id != ID_VECTOR {
            return Err(WireError::UnexpectedConstructor { id });
        }
        let len = self.read_i32()?.max(0) as usize;
        (0..len).map(|_| self.read_msg_id()).collect()
    }
}

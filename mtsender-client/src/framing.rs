//! MTProto packet framing over a [`ByteStream`].

use crate::errors::TransportError;
use crate::transport::ByteStream;

/// Packets larger than this are treated as a framing mismatch.
const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

/// Which framing wraps each packet on the byte stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Framing {
    /// [MTProto Abridged]: init byte `0xef`, then a length in 4-byte words,
    /// one byte below `0x7f` or `0x7f` followed by three little-endian bytes.
    ///
    /// [MTProto Abridged]: https://core.telegram.org/mtproto/mtproto-transports#abridged
    #[default]
    Abridged,
    /// [MTProto Intermediate]: init `0xeeeeeeee`, then a 4-byte little-endian
    /// byte length.
    ///
    /// [MTProto Intermediate]: https://core.telegram.org/mtproto/mtproto-transports#intermediate
    Intermediate,
}

impl Framing {
    /// Bytes written once, before the first packet.
    pub fn init_bytes(self) -> &'static [u8] {
        match self {
            Self::Abridged     => &[0xef],
            Self::Intermediate => &[0xee, 0xee, 0xee, 0xee],
        }
    }

    /// Prefix `payload` with its length header.
    ///
    /// Abridged lengths count 4-byte words, so an Abridged payload whose
    /// length is not a multiple of 4 is rejected with
    /// [`TransportError::Framing`].
    pub fn encode(self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if payload.len() > MAX_PACKET_LEN {
            return Err(TransportError::Framing(format!(
                "packet of {} bytes exceeds {MAX_PACKET_LEN}",
                payload.len()
            )));
        }
        let mut out = Vec::with_capacity(payload.len() + 4);
        match self {
            Self::Abridged => {
                if payload.len() % 4 != 0 {
                    return Err(TransportError::Framing(format!(
                        "abridged packet of {} bytes is not 4-byte aligned",
                        payload.len()
                    )));
                }
                let words = payload.len() / 4;
                if words < 0x7f {
                    out.push(words as u8);
                } else {
                    out.extend_from_slice(&[
                        0x7f,
                        (words & 0xff) as u8,
                        ((words >> 8) & 0xff) as u8,
                        ((words >> 16) & 0xff) as u8,
                    ]);
                }
            }
            Self::Intermediate => {
                out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            }
        }
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Read the next packet (header stripped) from `stream`.
    pub async fn read_packet(self, stream: &ByteStream) -> Result<Vec<u8>, TransportError> {
        let len = match self {
            Self::Abridged => {
                let h = stream.read_exactly(1).await?[0];
                let words = if h < 0x7f {
                    h as usize
                } else {
                    let b = stream.read_exactly(3).await?;
                    b[0] as usize | (b[1] as usize) << 8 | (b[2] as usize) << 16
                };
                words * 4
            }
            Self::Intermediate => {
                let b = stream.read_exactly(4).await?;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
        };
        if len == 0 || len > MAX_PACKET_LEN {
            return Err(TransportError::Framing(format!(
                "implausible packet length {len} ({self:?})"
            )));
        }
        stream.read_exactly(len).await
    }
}

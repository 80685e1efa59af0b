//! Service envelopes: what a decrypted message body can be, and how the
//! handful of service messages the sender writes itself are encoded.

use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::codec::CodecError;
use crate::message::{Message, MessageId};
use crate::wire::{Cursor, Serializable};

// ─── MTProto envelope constructor IDs ────────────────────────────────────────

/// `rpc_result`
pub const ID_RPC_RESULT:            u32 = 0xf35c6d01;
/// `rpc_error`
pub const ID_RPC_ERROR:             u32 = 0x2144ca19;
/// `msg_container`
pub const ID_MSG_CONTAINER:         u32 = 0x73f1f8dc;
/// `gzip_packed`
pub const ID_GZIP_PACKED:           u32 = 0x3072cfa1;
/// `ping`
pub const ID_PING:                  u32 = 0x7abe77ec;
/// `pong`
pub const ID_PONG:                  u32 = 0x347773c5;
/// `msgs_ack`
pub const ID_MSGS_ACK:              u32 = 0x62d6b459;
/// `bad_server_salt`
pub const ID_BAD_SERVER_SALT:       u32 = 0xedab447b;
/// `bad_msg_notification`
pub const ID_BAD_MSG_NOTIFY:        u32 = 0xa7eff811;
/// `new_session_created`
pub const ID_NEW_SESSION:           u32 = 0x9ec20908;
/// `msg_detailed_info`
pub const ID_MSG_DETAILED_INFO:     u32 = 0x276d3ec6;
/// `msg_new_detailed_info`
pub const ID_MSG_NEW_DETAILED_INFO: u32 = 0x809db6df;
/// `future_salts`
pub const ID_FUTURE_SALTS:          u32 = 0xae500895;
/// `msgs_state_req`
pub const ID_MSGS_STATE_REQ:        u32 = 0xda69fb52;
/// `msg_resend_req`
pub const ID_MSG_RESEND_REQ:        u32 = 0x7d861a08;
/// `msgs_state_info`
pub const ID_MSGS_STATE_INFO:       u32 = 0x04deb57d;
/// `msgs_all_info`
pub const ID_MSGS_ALL_INFO:         u32 = 0x8cc0d131;

/// Largest `msg_container` body the server accepts, in bytes.
pub const MAX_CONTAINER_SIZE: usize = 1_044_456 - 8;

/// Per-message header inside a container: `msg_id`, `seqno` and `bytes`.
pub const CONTAINER_ITEM_OVERHEAD: usize = 16;

/// Bodies shorter than this are never worth compressing.
const GZIP_MIN_LEN: usize = 512;

// ─── Envelope ─────────────────────────────────────────────────────────────────

/// One decoded server message.
#[allow(missing_docs)]
#[derive(Clone, Debug, PartialEq)]
pub enum Envelope {
    /// `rpc_result` carrying a successful result.
    RpcResult { req_msg_id: MessageId, body: Vec<u8> },
    /// `rpc_result` carrying an `rpc_error`.
    RpcError { req_msg_id: MessageId, code: i32, message: String },
    /// `msgs_ack`: the server received these messages.
    Ack { msg_ids: Vec<MessageId> },
    /// Answer to one of our pings.
    Pong { ping_msg_id: MessageId, ping_id: i64 },
    /// The salt used for `bad_msg_id` is wrong; resend with `new_salt`.
    BadServerSalt { bad_msg_id: MessageId, error_code: i32, new_salt: i64 },
    /// The server rejected `bad_msg_id` (clock skew, sequence, …).
    BadMsgNotification { bad_msg_id: MessageId, bad_msg_seqno: i32, error_code: i32 },
    /// The server started a new session for us.
    NewSessionCreated { first_msg_id: MessageId, server_salt: i64 },
    /// `msg_detailed_info` / `msg_new_detailed_info`: the answer is
    /// `answer_msg_id`, which only needs acknowledging.
    DetailedInfo { answer_msg_id: MessageId },
    /// `future_salts` answering our request `req_msg_id`.
    FutureSalts { req_msg_id: MessageId, body: Vec<u8> },
    /// `msgs_state_req` / `msg_resend_req`: the server wants a status report.
    StateRequest { msg_ids: Vec<MessageId> },
    /// `msgs_all_info`: informational, needs no reaction.
    AllInfo,
    /// Anything else: updates and unsolicited objects, passed through raw.
    Update { body: Vec<u8> },
}

/// A decoded message plus the header it arrived with.
#[derive(Clone, Debug, PartialEq)]
pub struct Incoming {
    /// Server-generated id; its upper half is the server clock.
    pub msg_id:   MessageId,
    /// Sequence number; odd means the server expects an acknowledgement.
    pub seq_no:   i32,
    /// The body.
    pub envelope: Envelope,
}

impl Incoming {
    /// Whether this message must be acknowledged.
    pub fn needs_ack(&self) -> bool {
        self.seq_no & 1 == 1
    }
}

// ─── Parsing ─────────────────────────────────────────────────────────────────

/// Decode a message body. Containers and gzip wrappers are flattened, so one
/// body may yield several items.
pub fn parse(msg_id: MessageId, seq_no: i32, body: &[u8]) -> Result<Vec<Incoming>, CodecError> {
    let mut out = Vec::new();
    parse_into(msg_id, seq_no, body, &mut out)?;
    Ok(out)
}

fn parse_into(
    msg_id: MessageId,
    seq_no: i32,
    body:   &[u8],
    out:    &mut Vec<Incoming>,
) -> Result<(), CodecError> {
    let mut cur = Cursor::from_slice(body);
    let cid = match cur.read_u32() {
        Ok(id) => id,
        // Bodies too short to carry a constructor are passed through untouched.
        Err(_) => {
            out.push(Incoming { msg_id, seq_no, envelope: Envelope::Update { body: body.to_vec() } });
            return Ok(());
        }
    };

    let envelope = match cid {
        ID_MSG_CONTAINER => {
            let count = cur.read_i32()?.max(0);
            for _ in 0..count {
                let inner_id  = cur.read_msg_id()?;
                let inner_seq = cur.read_i32()?;
                let len       = cur.read_i32()?.max(0) as usize;
                let inner     = cur.take(len)?;
                parse_into(inner_id, inner_seq, inner, out)?;
            }
            return Ok(());
        }
        ID_GZIP_PACKED => {
            let packed = cur.read_bytes()?;
            let inner  = gunzip(&packed)?;
            return parse_into(msg_id, seq_no, &inner, out);
        }
        ID_RPC_RESULT => {
            let req_msg_id = cur.read_msg_id()?;
            parse_rpc_result(req_msg_id, cur.rest())?
        }
        ID_MSGS_ACK => Envelope::Ack { msg_ids: cur.read_msg_id_vector()? },
        ID_PONG => {
            let ping_msg_id = cur.read_msg_id()?;
            let ping_id     = cur.read_i64()?;
            Envelope::Pong { ping_msg_id, ping_id }
        }
        ID_BAD_SERVER_SALT => {
            let bad_msg_id = cur.read_msg_id()?;
            let _seqno     = cur.read_i32()?;
            let error_code = cur.read_i32()?;
            let new_salt   = cur.read_i64()?;
            Envelope::BadServerSalt { bad_msg_id, error_code, new_salt }
        }
        ID_BAD_MSG_NOTIFY => {
            let bad_msg_id    = cur.read_msg_id()?;
            let bad_msg_seqno = cur.read_i32()?;
            let error_code    = cur.read_i32()?;
            Envelope::BadMsgNotification { bad_msg_id, bad_msg_seqno, error_code }
        }
        ID_NEW_SESSION => {
            let first_msg_id = cur.read_msg_id()?;
            let _unique_id   = cur.read_i64()?;
            let server_salt  = cur.read_i64()?;
            Envelope::NewSessionCreated { first_msg_id, server_salt }
        }
        ID_MSG_DETAILED_INFO => {
            let _msg_id       = cur.read_msg_id()?;
            let answer_msg_id = cur.read_msg_id()?;
            Envelope::DetailedInfo { answer_msg_id }
        }
        ID_MSG_NEW_DETAILED_INFO => Envelope::DetailedInfo { answer_msg_id: cur.read_msg_id()? },
        ID_FUTURE_SALTS => {
            let req_msg_id = cur.read_msg_id()?;
            Envelope::FutureSalts { req_msg_id, body: body.to_vec() }
        }
        ID_MSGS_STATE_REQ | ID_MSG_RESEND_REQ => {
            Envelope::StateRequest { msg_ids: cur.read_msg_id_vector()? }
        }
        ID_MSGS_ALL_INFO => Envelope::AllInfo,
        _ => Envelope::Update { body: body.to_vec() },
    };

    out.push(Incoming { msg_id, seq_no, envelope });
    Ok(())
}

fn parse_rpc_result(req_msg_id: MessageId, result: &[u8]) -> Result<Envelope, CodecError> {
    let mut cur = Cursor::from_slice(result);
    match cur.peek_u32() {
        Some(ID_RPC_ERROR) => {
            cur.read_u32()?;
            let code    = cur.read_i32()?;
            let message = cur.read_string()?;
            Ok(Envelope::RpcError { req_msg_id, code, message })
        }
        Some(ID_GZIP_PACKED) => {
            cur.read_u32()?;
            let inner = gunzip(&cur.read_bytes()?)?;
            parse_rpc_result(req_msg_id, &inner)
        }
        _ => Ok(Envelope::RpcResult { req_msg_id, body: result.to_vec() }),
    }
}

fn gunzip(packed: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::new();
    GzDecoder::new(packed)
        .read_to_end(&mut out)
        .map_err(|e| CodecError::Gzip(e.to_string()))?;
    Ok(out)
}

// ─── Encoding ────────────────────────────────────────────────────────────────

/// `msgs_ack#62d6b459 msg_ids:Vector<long>`
pub fn msgs_ack(msg_ids: &[MessageId]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12 + msg_ids.len() * 8);
    ID_MSGS_ACK.serialize(&mut buf);
    msg_ids.to_vec().serialize(&mut buf);
    buf
}

/// `msg_container#73f1f8dc messages:vector<message>`
///
/// Each message keeps the id and sequence number it was packed with; the
/// container itself is packed afterwards as a non-content-related message.
pub fn msg_container(messages: &[Message]) -> Vec<u8> {
    let size: usize = messages.iter().map(|m| m.body.len() + CONTAINER_ITEM_OVERHEAD).sum();
    let mut buf = Vec::with_capacity(8 + size);
    ID_MSG_CONTAINER.serialize(&mut buf);
    (messages.len() as i32).serialize(&mut buf);
    for m in messages {
        m.id.serialize(&mut buf);
        m.seq_no.serialize(&mut buf);
        (m.body.len() as i32).serialize(&mut buf);
        buf.extend_from_slice(&m.body);
    }
    buf
}

/// `ping#7abe77ec ping_id:long`
pub fn ping(ping_id: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(12);
    ID_PING.serialize(&mut buf);
    ping_id.serialize(&mut buf);
    buf
}

/// `msgs_state_info#04deb57d req_msg_id:long info:string`, reporting every
/// queried message as "not received" (status byte 1) so the server resends.
pub fn msgs_state_info(req_msg_id: MessageId, count: usize) -> Vec<u8> {
    let mut buf = Vec::new();
    ID_MSGS_STATE_INFO.serialize(&mut buf);
    req_msg_id.serialize(&mut buf);
    vec![1u8; count].serialize(&mut buf);
    buf
}

/// Wrap `body` in `gzip_packed` when it is content-related, large enough and
/// actually shrinks; otherwise return it unchanged.
pub fn gzip_if_smaller(content_related: bool, body: Vec<u8>) -> Vec<u8> {
    if !content_related || body.len() <= GZIP_MIN_LEN {
        return body;
    }
    match gzip_packed(&body) {
        Ok(packed) if packed.len() < body.len() => packed,
        Ok(_) => body,
        Err(e) => {
            log::warn!("[envelope] gzip failed ({e}), sending uncompressed");
            body
        }
    }
}

/// `gzip_packed#3072cfa1 packed_data:bytes`
pub fn gzip_packed(body: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(body).map_err(|e| CodecError::Gzip(e.to_string()))?;
    let packed = enc.finish().map_err(|e| CodecError::Gzip(e.to_string()))?;
    let mut buf = Vec::with_capacity(packed.len() + 8);
    ID_GZIP_PACKED.serialize(&mut buf);
    packed.serialize(&mut buf);
    Ok(buf)
}

//! MTProto message bookkeeping for mtsender.
//!
//! This crate handles:
//! * Message identifiers, sequence numbers and the server clock offset
//! * The per-request delivery lifecycle (sent / confirmed / resend)
//! * The pending-request table keyed by message id
//! * Parsing of service envelopes (`rpc_result`, `msgs_ack`, `pong`, …)
//! * The [`MessageCodec`] seam for whoever encrypts and decrypts packets
//!
//! It does no I/O: sockets, framing and dispatch live in
//! `mtsender-client`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod envelope;
pub mod message;
pub mod pending;
pub mod request;
pub mod state;
pub mod wire;

pub use codec::{CodecError, MessageCodec, PlainCodec};
pub use envelope::{Envelope, Incoming};
pub use message::{Message, MessageId};
pub use pending::PendingTable;
pub use request::{RESEND_THRESHOLD, RequestState};
pub use state::MessageState;
pub use wire::{Cursor, RawCall, RemoteCall, Serializable, WireError};

//! Per-connection message state: ids, sequence numbers, clock offset, salt.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::message::{Message, MessageId};

/// Tracks per-connection MTProto session state.
///
/// A `MessageState` is cheap to create and is [`reset`](Self::reset) whenever
/// the owning connection is re-established; the clock offset survives resets
/// because it describes the local clock, not the connection.
///
/// # Example
///
/// ```rust
/// use mtsender_mtproto::MessageState;
///
/// let mut state = MessageState::new(42);
/// let a = state.next_msg_id();
/// let b = state.next_msg_id();
/// assert!(b > a);
/// assert_eq!(state.next_seq_no(true) & 1, 1);
/// ```
#[derive(Debug)]
pub struct MessageState {
    session_id:  i64,
    /// Number of content-related messages sent so far.
    sequence:    i32,
    last_msg_id: u64,
    /// Server time minus local time, in seconds.
    time_offset: i32,
    /// Current server salt to include in outgoing messages.
    pub salt:    i64,
}

impl MessageState {
    /// Create a state for the given session id.
    pub fn new(session_id: i64) -> Self {
        Self { session_id, sequence: 0, last_msg_id: 0, time_offset: 0, salt: 0 }
    }

    /// Create a state with a random session id.
    pub fn random() -> Result<Self, getrandom::Error> {
        mtsender_crypto::random_i64().map(Self::new)
    }

    /// Start a fresh session on a new connection.
    pub fn reset(&mut self, session_id: i64) {
        self.session_id  = session_id;
        self.sequence    = 0;
        self.last_msg_id = 0;
    }

    /// The current session id.
    pub fn session_id(&self) -> i64 { self.session_id }

    /// Current clock offset (server − local) in seconds.
    pub fn time_offset(&self) -> i32 { self.time_offset }

    /// Seed the clock offset, e.g. from a persisted session.
    pub fn set_time_offset(&mut self, offset: i32) {
        self.time_offset = offset;
        self.last_msg_id = 0;
    }

    /// Allocate a new message id from the system clock.
    pub fn next_msg_id(&mut self) -> MessageId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.msg_id_at(now)
    }

    /// Allocate a new message id as if the local clock read `since_epoch`.
    ///
    /// Ids are strictly increasing: when the clock has not advanced (or went
    /// backwards) the previous id plus four is used.
    pub fn msg_id_at(&mut self, since_epoch: Duration) -> MessageId {
        let secs  = since_epoch.as_secs() as i64 + i64::from(self.time_offset);
        let nanos = u64::from(since_epoch.subsec_nanos());
        let mut id = ((secs.max(0) as u64) << 32) | (nanos << 2);
        if self.last_msg_id >= id {
            id = self.last_msg_id + 4;
        }
        self.last_msg_id = id;
        MessageId(id)
    }

    /// Return the sequence number for the next message.
    ///
    /// Content-related messages (RPC calls) get an odd number and advance the
    /// counter; acks, pings and other service messages get the current even
    /// slot.
    pub fn next_seq_no(&mut self, content_related: bool) -> i32 {
        if content_related {
            let n = self.sequence * 2 + 1;
            self.sequence += 1;
            n
        } else {
            self.sequence * 2
        }
    }

    /// Shift the sequence counter after a `bad_msg_notification` (codes 32/33).
    pub fn bump_sequence(&mut self, delta: i32) {
        self.sequence = (self.sequence + delta).max(0);
    }

    /// Recompute the clock offset from a message id known to be correct
    /// (one the server generated). Returns the new offset.
    pub fn update_time_offset(&mut self, correct: MessageId) -> i32 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64;
        self.update_time_offset_at(correct, now)
    }

    /// [`update_time_offset`](Self::update_time_offset) with an explicit local
    /// clock reading.
    pub fn update_time_offset_at(&mut self, correct: MessageId, now_secs: i64) -> i32 {
        let old = self.time_offset;
        let offset = correct.unix_secs() - now_secs;
        self.time_offset = offset.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        if self.time_offset != old {
            self.last_msg_id = 0;
            log::debug!(
                "[mtproto] time offset updated (old {old}, good id {correct}, new {})",
                self.time_offset
            );
        }
        self.time_offset
    }

    /// Stamp `body` with a fresh id and sequence number.
    pub fn pack(&mut self, body: Vec<u8>, content_related: bool) -> Message {
        let id     = self.next_msg_id();
        let seq_no = self.next_seq_no(content_related);
        Message::new(id, seq_no, body)
    }
}

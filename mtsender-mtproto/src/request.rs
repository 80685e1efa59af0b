//! Delivery lifecycle of a single request.
//!
//! ```text
//! Created ──on_send_success──▶ Sent ──on_confirm──▶ Confirmed
//!                               │                      │
//!                     need_resend() == true        on_response
//!                               ▼                      ▼
//!                          on_resent ──▶ Sent       Responded
//! ```
//!
//! This type only tracks transport-level delivery confidence. Whether an RPC
//! failed is decided later from the decoded response.

use std::time::{Duration, Instant};

/// How long a confirmed request may stay unacknowledged before it is due for
/// a resend.
pub const RESEND_THRESHOLD: Duration = Duration::from_millis(3000);

/// Per-request lifecycle flags.
#[derive(Clone, Debug)]
pub struct RequestState {
    sent:             bool,
    send_time:        Option<Instant>,
    sequence:         i32,
    dirty:            bool,
    confirmed:        bool,
    confirm_received: bool,
    responded:        bool,
}

impl RequestState {
    /// A request that has not been handed to the transport yet.
    ///
    /// `confirmed` says whether the server is expected to acknowledge it
    /// (content-related messages are, service messages are not).
    pub fn new(sequence: i32, confirmed: bool) -> Self {
        Self {
            sent: false,
            send_time: None,
            sequence,
            dirty: false,
            confirmed,
            confirm_received: false,
            responded: false,
        }
    }

    /// Record one physical send attempt.
    pub fn on_send_success(&mut self) {
        self.on_send_success_at(Instant::now());
    }

    /// [`on_send_success`](Self::on_send_success) with an explicit clock.
    pub fn on_send_success_at(&mut self, now: Instant) {
        self.send_time = Some(now);
        self.sent = true;
    }

    /// The server acknowledged the message.
    pub fn on_confirm(&mut self) {
        self.confirm_received = true;
    }

    /// A response (result or error) arrived.
    pub fn on_response(&mut self) {
        self.responded = true;
    }

    /// Force a resend regardless of timing.
    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// The caller acted on [`need_resend`](Self::need_resend) and re-packed the
    /// request under `sequence`; the next [`on_send_success`](Self::on_send_success)
    /// starts a new attempt.
    pub fn on_resent(&mut self, sequence: i32) {
        self.sequence = sequence;
        self.dirty = false;
        self.sent = false;
        self.send_time = None;
        self.confirm_received = false;
    }

    /// Whether the request should be sent again, using the default threshold.
    pub fn need_resend(&self) -> bool {
        self.need_resend_at(Instant::now(), RESEND_THRESHOLD)
    }

    /// Pure resend predicate:
    /// `dirty || (confirmed && !confirm_received && now - send_time > threshold)`.
    pub fn need_resend_at(&self, now: Instant, threshold: Duration) -> bool {
        if self.dirty {
            return true;
        }
        if !self.confirmed || self.confirm_received {
            return false;
        }
        match self.send_time {
            Some(t) => now.saturating_duration_since(t) > threshold,
            None    => false,
        }
    }

    /// Handed to the transport at least once since the last resend.
    pub fn sent(&self) -> bool { self.sent }
    /// When the current attempt was handed to the transport.
    pub fn send_time(&self) -> Option<Instant> { self.send_time }
    /// Sequence number of the current attempt.
    pub fn sequence(&self) -> i32 { self.sequence }
    /// Externally forced resend.
    pub fn dirty(&self) -> bool { self.dirty }
    /// Whether a server acknowledgement is expected.
    pub fn confirmed(&self) -> bool { self.confirmed }
    /// Whether the acknowledgement arrived.
    pub fn confirm_received(&self) -> bool { self.confirm_received }
    /// Whether a response arrived.
    pub fn responded(&self) -> bool { self.responded }
}

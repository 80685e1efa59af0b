//! The dispatch path: one byte stream, one pending table, one message state.
//!
//! A [`Sender`] writes requests and runs a receive loop that matches every
//! incoming envelope against the pending table. Nothing here retries on its
//! own: resend candidates are exposed through
//! [`resend_candidates`](Sender::resend_candidates) and acted on by whoever
//! schedules them.
//!
//! Acknowledgements are held back for [`ACK_DELAY`]. A request written in
//! that window carries them along: both go out in one `msg_container`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::LevelFilter;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use mtsender_mtproto::envelope::{self, CONTAINER_ITEM_OVERHEAD, MAX_CONTAINER_SIZE};
use mtsender_mtproto::{
    CodecError, Envelope, Incoming, MessageCodec, MessageId, MessageState, PendingTable,
    RESEND_THRESHOLD, RemoteCall, RequestState, Serializable,
};

use crate::Config;
use crate::errors::{InvocationError, RpcError, TransportError};
use crate::events::{ConnectionNotifier, Origin};
use crate::framing::Framing;
use crate::logging::Logger;
use crate::session::Session;
use crate::transport::{ByteStream, CloseReason};

type Reply = oneshot::Sender<Result<Vec<u8>, InvocationError>>;

/// How long received messages wait for an acknowledgement to share a packet
/// with an outgoing request.
pub const ACK_DELAY: Duration = Duration::from_millis(100);

/// Construction parameters for [`Sender::start`].
pub struct SenderParams {
    pub dc_id:            i32,
    pub framing:          Framing,
    pub codec:            Box<dyn MessageCodec>,
    /// Clock offset carried over from the session.
    pub time_offset:      i32,
    pub resend_threshold: Duration,
    pub log_level:        LevelFilter,
    pub notifier:         ConnectionNotifier,
    /// Where unsolicited server objects (updates) are delivered.
    pub updates:          mpsc::UnboundedSender<Vec<u8>>,
}

impl SenderParams {
    /// Defaults for everything but the codec and the channels.
    pub fn new(
        dc_id:    i32,
        codec:    Box<dyn MessageCodec>,
        notifier: ConnectionNotifier,
        updates:  mpsc::UnboundedSender<Vec<u8>>,
    ) -> Self {
        Self {
            dc_id,
            framing: Framing::default(),
            codec,
            time_offset: 0,
            resend_threshold: RESEND_THRESHOLD,
            log_level: LevelFilter::Info,
            notifier,
            updates,
        }
    }
}

// ─── Dispatch state ──────────────────────────────────────────────────────────

struct PendingRequest {
    lifecycle: RequestState,
    name:      String,
    /// Original body, kept so the request can be re-packed under a new id.
    body:      Vec<u8>,
    reply:     Reply,
}

struct Dispatch {
    state:       MessageState,
    codec:       Box<dyn MessageCodec>,
    pending:     PendingTable<PendingRequest>,
    pending_ack: Vec<MessageId>,
    /// Container id → the request it carried.
    containers:  HashMap<MessageId, MessageId>,
}

impl Dispatch {
    /// The pending request the server means by `id`: the request itself, or
    /// the one carried by the container `id`.
    fn resolve(&self, id: MessageId) -> Option<MessageId> {
        if self.pending.contains(id) {
            return Some(id);
        }
        self.containers.get(&id).copied().filter(|req| self.pending.contains(*req))
    }
}

/// What the receive loop does after a packet.
enum Flow {
    Continue,
    /// Stop reading and close the stream; the event was already emitted.
    Stop,
}

struct SenderInner {
    dc_id:            i32,
    stream:           ByteStream,
    framing:          Framing,
    dispatch:         Mutex<Dispatch>,
    notifier:         ConnectionNotifier,
    updates:          mpsc::UnboundedSender<Vec<u8>>,
    resend_threshold: Duration,
    shutdown:         CancellationToken,
    acks_queued:      Notify,
    log:              Logger,
}

/// Handle to one live connection. Cheap to clone.
#[derive(Clone)]
pub struct Sender {
    inner: Arc<SenderInner>,
}

impl Sender {
    /// Take over `stream`: write the framing header, spawn the receive loop
    /// and report [`Origin::Connect`].
    pub fn start(stream: ByteStream, params: SenderParams) -> Result<Self, InvocationError> {
        let mut state = MessageState::random()
            .map_err(|e| InvocationError::Codec(CodecError::Other(format!("getrandom: {e}"))))?;
        state.set_time_offset(params.time_offset);

        stream.write(params.framing.init_bytes())?;

        let inner = Arc::new(SenderInner {
            dc_id:            params.dc_id,
            stream,
            framing:          params.framing,
            dispatch:         Mutex::new(Dispatch {
                state,
                codec:       params.codec,
                pending:     PendingTable::new(),
                pending_ack: Vec::new(),
                containers:  HashMap::new(),
            }),
            notifier:         params.notifier,
            updates:          params.updates,
            resend_threshold: params.resend_threshold,
            shutdown:         CancellationToken::new(),
            acks_queued:      Notify::new(),
            log:              Logger::new(params.log_level, params.dc_id),
        });

        tokio::spawn(receive_loop(Arc::clone(&inner)));
        tokio::spawn(ack_loop(Arc::clone(&inner)));
        inner.log.info(format_args!("connected ({:?} framing)", inner.framing));
        inner.notifier.connected(Origin::Connect);
        Ok(Self { inner })
    }

    /// Open a stream to the session's datacenter through `config.connector`
    /// and start a sender on it.
    pub async fn connect(
        session:  &Session,
        config:   &Config,
        notifier: &ConnectionNotifier,
        updates:  &mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<Self, InvocationError> {
        let target   = session.dc()?;
        let auth_key = session.auth_key().ok();
        let stream   = config.connector.connect(&target, config.test_servers, config.premium).await?;
        if let Some(online) = &config.network {
            stream.close_when_offline(online.clone());
        }
        Self::start(stream, SenderParams {
            dc_id:            target.id,
            framing:          config.framing,
            codec:            config.codec_factory.codec(auth_key.as_ref()),
            time_offset:      session.time_offset()?,
            resend_threshold: config.resend_threshold,
            log_level:        config.log.level,
            notifier:         notifier.clone(),
            updates:          updates.clone(),
        })
    }

    /// Datacenter this sender talks to.
    pub fn dc_id(&self) -> i32 { self.inner.dc_id }

    /// Whether the stream is still open.
    pub fn is_connected(&self) -> bool {
        !self.inner.stream.is_closed()
    }

    /// Current server clock offset in seconds.
    pub fn time_offset(&self) -> i32 {
        self.inner.dispatch().map(|d| d.state.time_offset()).unwrap_or_default()
    }

    /// Number of requests awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.inner.dispatch().map(|d| d.pending.len()).unwrap_or_default()
    }

    /// Send `request` and wait for its raw result body.
    ///
    /// Dropping the returned future withdraws the request: it leaves the
    /// pending table and is never resent.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<Vec<u8>, InvocationError> {
        let (tx, rx) = oneshot::channel();
        self.inner.send_request(request.name().to_string(), request.to_bytes(), tx)?;
        InFlight { inner: &self.inner, reply: Some(rx) }.wait().await
    }

    /// Send a `ping` and wait for the matching `pong`.
    pub async fn ping(&self) -> Result<(), InvocationError> {
        let ping_id = mtsender_crypto::random_i64()
            .map_err(|e| InvocationError::Codec(CodecError::Other(format!("getrandom: {e}"))))?;
        let (tx, rx) = oneshot::channel();
        self.inner.send_request("ping".to_string(), envelope::ping(ping_id), tx)?;
        InFlight { inner: &self.inner, reply: Some(rx) }.wait().await.map(|_| ())
    }

    /// Ids of in-flight requests that should be sent again.
    pub fn resend_candidates(&self) -> Vec<MessageId> {
        self.resend_candidates_at(Instant::now())
    }

    /// [`resend_candidates`](Self::resend_candidates) with an explicit clock.
    pub fn resend_candidates_at(&self, now: Instant) -> Vec<MessageId> {
        let Ok(d) = self.inner.dispatch() else { return Vec::new() };
        let mut ids: Vec<MessageId> = d
            .pending
            .iter()
            .filter(|(_, p)| !p.reply.is_closed())
            .filter(|(_, p)| p.lifecycle.need_resend_at(now, self.inner.resend_threshold))
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    /// Re-pack the request pending under `id` with a fresh id and sequence
    /// number and send it again. Returns the new id, or `None` if nothing is
    /// pending under `id` or its caller stopped waiting.
    pub fn resend(&self, id: MessageId) -> Result<Option<MessageId>, InvocationError> {
        self.inner.resend(id)
    }

    /// Close the connection and fail every pending request with
    /// [`InvocationError::Dropped`].
    pub fn disconnect(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        self.inner.stream.close();
        self.inner.fail_all(|| InvocationError::Dropped);
        self.inner.log.info(format_args!("disconnected"));
        self.inner.notifier.disconnected(Origin::ExplicitClose);
    }
}

// ─── Sending ─────────────────────────────────────────────────────────────────

impl SenderInner {
    fn dispatch(&self) -> Result<MutexGuard<'_, Dispatch>, InvocationError> {
        self.dispatch.lock().map_err(|_| {
            log::error!("{} dispatch state poisoned", self.log.tag());
            InvocationError::Dropped
        })
    }

    /// Pack, frame and write `body`. A service body in `along` is packed
    /// first and shares one `msg_container` with it. Returns the id and
    /// sequence number of `body`.
    fn transmit(
        &self,
        d:               &mut Dispatch,
        along:           Option<Vec<u8>>,
        body:            &[u8],
        content_related: bool,
    ) -> Result<(MessageId, i32), InvocationError> {
        let along   = along.map(|service| d.state.pack(service, false));
        let body    = envelope::gzip_if_smaller(content_related, body.to_vec());
        let message = d.state.pack(body, content_related);
        let stamp   = (message.id, message.seq_no);

        let Some(service) = along else {
            let packet = d.codec.pack(&message)?;
            self.stream.write(&self.framing.encode(&packet)?)?;
            return Ok(stamp);
        };
        let container = d.state.pack(envelope::msg_container(&[service, message]), false);
        let packet    = d.codec.pack(&container)?;
        self.stream.write(&self.framing.encode(&packet)?)?;
        if content_related {
            d.containers.insert(container.id, stamp.0);
        }
        Ok(stamp)
    }

    /// Send queued acknowledgements as one `msgs_ack`.
    fn flush_acks(&self, d: &mut Dispatch) -> Result<(), InvocationError> {
        if d.pending_ack.is_empty() {
            return Ok(());
        }
        let body = envelope::msgs_ack(&d.pending_ack);
        self.transmit(d, None, &body, false)?;
        self.log.debug(format_args!("acknowledged {} message(s)", d.pending_ack.len()));
        d.pending_ack.clear();
        Ok(())
    }

    /// Write a content-related `body`, taking queued acknowledgements along
    /// in the same container when they fit.
    fn transmit_request(&self, d: &mut Dispatch, body: &[u8]) -> Result<(MessageId, i32), InvocationError> {
        if d.pending_ack.is_empty() {
            return self.transmit(d, None, body, true);
        }
        let acks = envelope::msgs_ack(&d.pending_ack);
        if acks.len() + body.len() + 2 * CONTAINER_ITEM_OVERHEAD > MAX_CONTAINER_SIZE {
            self.flush_acks(d)?;
            return self.transmit(d, None, body, true);
        }
        let stamp = self.transmit(d, Some(acks), body, true)?;
        self.log.debug(format_args!("{} ack(s) batched with {}", d.pending_ack.len(), stamp.0));
        d.pending_ack.clear();
        Ok(stamp)
    }

    fn send_request(&self, name: String, body: Vec<u8>, reply: Reply) -> Result<MessageId, InvocationError> {
        let mut d = self.dispatch()?;
        let Dispatch { containers, pending, .. } = &mut *d;
        containers.retain(|_, req| pending.contains(*req));

        let (msg_id, seq_no) = self.transmit_request(&mut d, &body)?;
        let mut lifecycle = RequestState::new(seq_no, true);
        lifecycle.on_send_success();
        self.log.debug(format_args!("→ {name} as {msg_id}"));
        d.pending.insert(msg_id, PendingRequest { lifecycle, name, body, reply });
        Ok(msg_id)
    }

    fn resend(&self, id: MessageId) -> Result<Option<MessageId>, InvocationError> {
        let mut d = self.dispatch()?;
        let Some(mut req) = d.pending.take(id) else {
            return Ok(None);
        };
        if req.reply.is_closed() {
            self.log.debug(format_args!("{} abandoned by its caller, not resending", req.name));
            return Ok(None);
        }
        let (new_id, seq_no) = match self.transmit_request(&mut d, &req.body) {
            Ok(v) => v,
            Err(e) => {
                // Keep the entry so teardown can still fail it.
                d.pending.insert(id, req);
                return Err(e);
            }
        };
        req.lifecycle.on_resent(seq_no);
        req.lifecycle.on_send_success();
        self.log.debug(format_args!("resent {} ({id} → {new_id})", req.name));
        d.pending.insert(new_id, req);
        Ok(Some(new_id))
    }

    /// Drop every request whose caller stopped waiting.
    fn withdraw_abandoned(&self) {
        let Ok(mut d) = self.dispatch() else { return };
        for (id, req) in d.pending.retain(|_, req| !req.reply.is_closed()) {
            self.log.debug(format_args!("{} ({id}) cancelled", req.name));
        }
    }

    fn fail_all(&self, err: impl Fn() -> InvocationError) {
        let drained = match self.dispatch() {
            Ok(mut d) => d.pending.drain(),
            Err(_)    => return,
        };
        if !drained.is_empty() {
            self.log.info(format_args!("failing {} pending request(s)", drained.len()));
        }
        for (_, req) in drained {
            let _ = req.reply.send(Err(err()));
        }
    }
}

/// The waiting side of one request. Dropped before its reply arrived, it
/// withdraws the request from the pending table.
struct InFlight<'a> {
    inner: &'a SenderInner,
    reply: Option<oneshot::Receiver<Result<Vec<u8>, InvocationError>>>,
}

impl InFlight<'_> {
    async fn wait(mut self) -> Result<Vec<u8>, InvocationError> {
        let Some(rx) = self.reply.as_mut() else {
            return Err(InvocationError::Dropped);
        };
        let outcome = rx.await;
        self.reply = None;
        outcome.map_err(|_| InvocationError::Dropped)?
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(rx) = self.reply.take() {
            drop(rx);
            self.inner.withdraw_abandoned();
        }
    }
}

// ─── Receiving ───────────────────────────────────────────────────────────────

/// Send acknowledgements no request picked up within [`ACK_DELAY`].
async fn ack_loop(inner: Arc<SenderInner>) {
    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = inner.acks_queued.notified() => {}
        }
        tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            _ = tokio::time::sleep(ACK_DELAY) => {}
        }
        let Ok(mut d) = inner.dispatch() else { return };
        if let Err(e) = inner.flush_acks(&mut d) {
            inner.log.warn(format_args!("could not send acks: {e}"));
        }
    }
}

async fn receive_loop(inner: Arc<SenderInner>) {
    loop {
        let packet = tokio::select! {
            _ = inner.shutdown.cancelled() => return,
            p = inner.framing.read_packet(&inner.stream) => p,
        };
        let flow = match packet {
            Ok(packet) => inner.handle_packet(&packet),
            Err(TransportError::Closed) => {
                inner.on_stream_closed();
                return;
            }
            Err(e) => {
                inner.log.warn(format_args!("{e}, reconnect required"));
                inner.notifier.disconnected(Origin::InvalidBuffer { code: 0 });
                Flow::Stop
            }
        };
        if let Flow::Stop = flow {
            inner.shutdown.cancel();
            inner.stream.close();
            inner.fail_all(|| InvocationError::Transport(TransportError::Closed));
            return;
        }
    }
}

impl SenderInner {
    fn on_stream_closed(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        match self.stream.close_reason() {
            Some(CloseReason::Offline) => self.notifier.disconnected(Origin::NetworkOffline),
            Some(CloseReason::Remote { code, reason }) => {
                self.log.info(format_args!("socket closed by server ({code} {reason:?})"));
                self.notifier.disconnected(Origin::SocketClosed { code });
            }
            Some(CloseReason::Local) | None => self.notifier.disconnected(Origin::ExplicitClose),
        }
        self.fail_all(|| InvocationError::Transport(TransportError::Closed));
    }

    fn handle_packet(&self, packet: &[u8]) -> Flow {
        let Ok(mut d) = self.dispatch() else { return Flow::Stop };
        let items = match d.codec.unpack(packet) {
            Ok(items) => items,
            Err(CodecError::InvalidBuffer { code: 404 }) => {
                self.log.warn(format_args!("broken authorization key, resetting"));
                self.notifier.broken(Origin::AuthKeyRejected);
                return Flow::Stop;
            }
            Err(CodecError::InvalidBuffer { code }) => {
                self.log.warn(format_args!("invalid buffer {code}, reconnecting"));
                self.notifier.disconnected(Origin::InvalidBuffer { code });
                return Flow::Stop;
            }
            Err(e) if e.is_recoverable() => {
                self.log.warn(format_args!("dropping undecodable packet: {e}"));
                return Flow::Continue;
            }
            Err(e) => {
                self.log.error(format_args!("unhandled error while receiving data: {e}"));
                self.notifier.disconnected(Origin::InvalidBuffer { code: 0 });
                return Flow::Stop;
            }
        };

        let mut flow = Flow::Continue;
        for item in items {
            if item.needs_ack() {
                d.pending_ack.push(item.msg_id);
            }
            if let Flow::Stop = self.handle_incoming(&mut d, item) {
                flow = Flow::Stop;
            }
        }
        if !d.pending_ack.is_empty() {
            self.acks_queued.notify_one();
        }
        flow
    }

    fn handle_incoming(&self, d: &mut Dispatch, item: Incoming) -> Flow {
        match item.envelope {
            Envelope::RpcResult { req_msg_id, body } => match d.pending.take(req_msg_id) {
                Some(mut req) => {
                    req.lifecycle.on_response();
                    self.log.debug(format_args!("← {} result ({} bytes)", req.name, body.len()));
                    let _ = req.reply.send(Ok(body));
                }
                None => self.log.info(format_args!("response to unknown request {req_msg_id}, dropped")),
            },

            Envelope::RpcError { req_msg_id, code, message } => {
                let Some(mut req) = d.pending.take(req_msg_id) else {
                    self.log.info(format_args!("error {code} {message} for unknown request {req_msg_id}, dropped"));
                    return Flow::Continue;
                };
                req.lifecycle.on_response();
                let err = RpcError::from_telegram(code, &message).with_request(req.name.clone());
                self.log.debug(format_args!("← {err}"));
                let revoked = matches!(err.name.as_str(), "AUTH_KEY_UNREGISTERED" | "SESSION_REVOKED" | "USER_DEACTIVATED");
                let _ = req.reply.send(Err(InvocationError::Rpc(err)));
                if revoked {
                    self.log.warn(format_args!("session revoked by server ({message})"));
                    self.notifier.broken(Origin::SessionRevoked);
                }
            }

            Envelope::Ack { msg_ids } => {
                for id in msg_ids {
                    let Some(req_id) = d.resolve(id) else { continue };
                    if let Some(req) = d.pending.get_mut(req_id) {
                        req.lifecycle.on_confirm();
                    }
                }
            }

            Envelope::Pong { ping_msg_id, .. } => {
                let offset = d.state.update_time_offset(item.msg_id);
                self.notifier.time_offset(offset);
                if let Some(mut req) = d.pending.take(ping_msg_id) {
                    req.lifecycle.on_response();
                    let _ = req.reply.send(Ok(Vec::new()));
                }
            }

            Envelope::BadServerSalt { bad_msg_id, new_salt, .. } => {
                self.log.debug(format_args!("bad salt for {bad_msg_id}, switching salt"));
                d.state.salt = new_salt;
                d.codec.set_salt(new_salt);
                if let Some(req) = d.resolve(bad_msg_id).and_then(|id| d.pending.get_mut(id)) {
                    req.lifecycle.mark_dirty();
                }
            }

            Envelope::BadMsgNotification { bad_msg_id, error_code, .. } => {
                self.handle_bad_msg(d, item.msg_id, bad_msg_id, error_code);
            }

            Envelope::NewSessionCreated { first_msg_id, server_salt } => {
                self.log.debug(format_args!("new session created (first message {first_msg_id})"));
                d.state.salt = server_salt;
                d.codec.set_salt(server_salt);
            }

            Envelope::DetailedInfo { answer_msg_id } => d.pending_ack.push(answer_msg_id),

            Envelope::FutureSalts { req_msg_id, body } => {
                if let Some(mut req) = d.pending.take(req_msg_id) {
                    req.lifecycle.on_response();
                    let _ = req.reply.send(Ok(body));
                }
            }

            Envelope::StateRequest { msg_ids } => {
                let info = envelope::msgs_state_info(item.msg_id, msg_ids.len());
                if let Err(e) = self.transmit(d, None, &info, false) {
                    self.log.warn(format_args!("could not answer state request: {e}"));
                }
            }

            Envelope::AllInfo => {}

            Envelope::Update { body } => {
                if self.updates.send(body).is_err() {
                    self.log.debug(format_args!("update dropped, nobody is listening"));
                }
            }
        }
        Flow::Continue
    }

    fn handle_bad_msg(&self, d: &mut Dispatch, server_msg_id: MessageId, bad_msg_id: MessageId, code: i32) {
        let target = d.resolve(bad_msg_id);
        match code {
            16 | 17 => {
                // msg_id too low / too high: trust the server clock.
                let offset = d.state.update_time_offset(server_msg_id);
                self.notifier.time_offset(offset);
            }
            32 => d.state.bump_sequence(64),
            33 => d.state.bump_sequence(-16),
            _ => {
                if let Some(req) = target.and_then(|id| d.pending.take(id)) {
                    self.log.warn(format_args!("{} rejected with bad_msg_notification {code}", req.name));
                    let _ = req.reply.send(Err(InvocationError::BadMessage(code)));
                }
                return;
            }
        }
        self.log.debug(format_args!("bad_msg_notification {code} for {bad_msg_id}, marked for resend"));
        if let Some(req) = target.and_then(|id| d.pending.get_mut(id)) {
            req.lifecycle.mark_dirty();
        }
    }
}

#[cfg(test)]
mod tests {
    use mtsender_mtproto::PlainCodec;

    use super::*;

    #[tokio::test]
    async fn abandoned_requests_are_never_resent() {
        let (stream, _feed, _out) = ByteStream::detached();
        let (updates, _rx) = mpsc::unbounded_channel();
        let params = SenderParams::new(2, Box::new(PlainCodec::new()), ConnectionNotifier::new(), updates);
        let sender = Sender::start(stream, params).unwrap();
        let later = Instant::now() + Duration::from_secs(10);

        let (live_tx, _live_rx) = oneshot::channel();
        let live = sender.inner.send_request("help.getConfig".into(), vec![0; 4], live_tx).unwrap();
        let (gone_tx, gone_rx) = oneshot::channel();
        let gone = sender.inner.send_request("help.getNearestDc".into(), vec![1; 4], gone_tx).unwrap();
        drop(gone_rx);

        assert_eq!(sender.resend_candidates_at(later), vec![live]);
        assert_eq!(sender.resend(gone).unwrap(), None);
        assert_eq!(sender.pending_len(), 1);
        assert!(sender.resend(live).unwrap().is_some());
    }
}

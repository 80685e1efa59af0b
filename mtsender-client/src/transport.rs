//! Byte-stream transport over a message-oriented socket.
//!
//! The server speaks WebSocket; every binary message carries an arbitrary
//! slice of the MTProto byte stream. [`ByteStream`] glues those slices back
//! together and hands them out by exact length, the way a TCP socket's
//! `read_exact` would.
//!
//! The buffer logic is independent of the socket: [`ByteStream::detached`]
//! returns the stream, the [`SocketFeed`] that pushes received bytes into it,
//! and the receiver of outbound frames. [`connect`] wires those to a
//! `tokio-tungstenite` socket.

use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::errors::TransportError;

/// Close code of a graceful WebSocket shutdown.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported when the socket vanished without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Build the socket URL for a datacenter endpoint.
///
/// `wss` is used exactly when `port` is 443.
///
/// ```rust
/// use mtsender_client::transport::endpoint_url;
///
/// assert_eq!(endpoint_url("149.154.167.51", 443, false, false), "wss://149.154.167.51:443/apiws");
/// assert_eq!(endpoint_url("10.0.0.1", 80, true, true), "ws://10.0.0.1:80/apiws_test_premium");
/// ```
pub fn endpoint_url(address: &str, port: u16, test_servers: bool, premium: bool) -> String {
    let scheme = if port == 443 { "wss" } else { "ws" };
    let test   = if test_servers { "_test" } else { "" };
    let prem   = if premium { "_premium" } else { "" };
    format!("{scheme}://{address}:{port}/apiws{test}{prem}")
}

// ─── Shared state ────────────────────────────────────────────────────────────

/// Why a stream stopped.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// [`ByteStream::close`] was called.
    Local,
    /// The socket closed with this code and reason.
    Remote { code: u16, reason: String },
    /// The network went offline and the stream was closed proactively.
    Offline,
}

/// A frame for the socket writer.
#[derive(Debug, PartialEq, Eq)]
pub enum Outbound {
    /// One binary socket message.
    Binary(Vec<u8>),
    /// Close the socket.
    Close,
}

/// Callback invoked when the socket closes uncleanly: `(code, reason)`.
pub type DisconnectCallback = Arc<dyn Fn(u16, &str) + Send + Sync>;

#[derive(Default)]
struct Buffer {
    bytes:  Vec<u8>,
    closed: Option<CloseReason>,
}

struct Shared {
    buf:           Mutex<Buffer>,
    readable:      Notify,
    outbound:      mpsc::UnboundedSender<Outbound>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl Shared {
    // A poisoned buffer can only mean a panic mid-append; the bytes are still
    // consistent, so keep going with them.
    fn lock(&self) -> MutexGuard<'_, Buffer> {
        self.buf.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn close(&self, reason: CloseReason) -> bool {
        {
            let mut buf = self.lock();
            if buf.closed.is_some() {
                return false;
            }
            buf.closed = Some(reason);
        }
        self.readable.notify_one();
        true
    }
}

// ─── ByteStream ──────────────────────────────────────────────────────────────

/// Exact-length reads over a message-oriented socket.
///
/// Cloning yields another handle to the same stream. Readers are serialized:
/// concurrent [`read_exactly`](Self::read_exactly) calls take turns and never
/// observe overlapping ranges.
#[derive(Clone)]
pub struct ByteStream {
    shared:    Arc<Shared>,
    read_lock: Arc<tokio::sync::Mutex<()>>,
}

impl ByteStream {
    /// A stream not attached to any socket.
    ///
    /// Returns the stream, the feed a socket backend pushes received bytes
    /// into, and the receiver of everything written to the stream.
    pub fn detached() -> (Self, SocketFeed, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            buf:           Mutex::new(Buffer::default()),
            readable:      Notify::new(),
            outbound:      tx,
            on_disconnect: Mutex::new(None),
        });
        let stream = Self { shared: Arc::clone(&shared), read_lock: Arc::new(tokio::sync::Mutex::new(())) };
        (stream, SocketFeed { shared }, rx)
    }

    /// Wait until at least `n` bytes arrived, then return exactly `n` of them.
    ///
    /// The remainder stays buffered for the next read. Fails with
    /// [`TransportError::Closed`] once the stream is closed, including while
    /// waiting.
    pub async fn read_exactly(&self, n: usize) -> Result<Vec<u8>, TransportError> {
        let _reader = self.read_lock.lock().await;
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut buf = self.shared.lock();
                if buf.closed.is_some() {
                    return Err(TransportError::Closed);
                }
                if buf.bytes.len() >= n {
                    return Ok(buf.bytes.drain(..n).collect());
                }
            }
            notified.await;
        }
    }

    /// Wait until at least one byte is buffered, then return all of them.
    pub async fn read_all(&self) -> Result<Vec<u8>, TransportError> {
        let _reader = self.read_lock.lock().await;
        loop {
            let notified = self.shared.readable.notified();
            {
                let mut buf = self.shared.lock();
                if buf.closed.is_some() {
                    return Err(TransportError::Closed);
                }
                if !buf.bytes.is_empty() {
                    return Ok(std::mem::take(&mut buf.bytes));
                }
            }
            notified.await;
        }
    }

    /// Hand `bytes` to the socket as one message. Never waits.
    pub fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.shared
            .outbound
            .send(Outbound::Binary(bytes.to_vec()))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the stream and the socket; a waiting reader fails.
    pub fn close(&self) {
        self.close_with(CloseReason::Local);
    }

    fn close_with(&self, reason: CloseReason) {
        if self.shared.close(reason) {
            let _ = self.shared.outbound.send(Outbound::Close);
        }
    }

    /// Whether the stream has been closed for any reason.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// Why the stream was closed, if it was.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.lock().closed.clone()
    }

    /// Number of received bytes not yet read.
    pub fn buffered(&self) -> usize {
        self.shared.lock().bytes.len()
    }

    /// Register the callback for unclean socket closures, replacing any
    /// previous one.
    pub fn on_disconnect(&self, callback: impl Fn(u16, &str) + Send + Sync + 'static) {
        let mut slot = self.shared.on_disconnect.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(Arc::new(callback));
    }

    /// Close the stream as soon as `online` reports `false`.
    pub fn close_when_offline(&self, mut online: watch::Receiver<bool>) -> JoinHandle<()> {
        let stream = self.clone();
        tokio::spawn(async move {
            loop {
                if !*online.borrow_and_update() {
                    log::info!("[transport] network offline, closing stream");
                    stream.close_with(CloseReason::Offline);
                    return;
                }
                if online.changed().await.is_err() || stream.is_closed() {
                    return;
                }
            }
        })
    }
}

// ─── SocketFeed ──────────────────────────────────────────────────────────────

/// The inbound side of a [`ByteStream`], driven by the socket backend.
pub struct SocketFeed {
    shared: Arc<Shared>,
}

impl SocketFeed {
    /// Append one received socket message and wake the reader.
    pub fn push(&self, bytes: &[u8]) {
        {
            let mut buf = self.shared.lock();
            if buf.closed.is_some() {
                return;
            }
            buf.bytes.extend_from_slice(bytes);
        }
        self.shared.readable.notify_one();
    }

    /// The socket closed. Anything but a normal closure is logged and
    /// reported to the disconnect callback.
    pub fn closed(&self, code: u16, reason: &str) {
        let first = self.shared.close(CloseReason::Remote { code, reason: reason.to_string() });
        if !first || code == NORMAL_CLOSURE {
            return;
        }
        log::warn!("[transport] socket closed uncleanly (code {code}, reason {reason:?})");
        // Called outside the lock so the callback may re-register itself.
        let callback = self.shared.on_disconnect.lock().unwrap_or_else(|p| p.into_inner()).clone();
        if let Some(cb) = callback {
            cb(code, reason);
        }
    }
}

// ─── WebSocket backend ───────────────────────────────────────────────────────

/// Open a WebSocket to the datacenter and return a stream over it.
///
/// Resolves once the socket is open.
pub async fn connect(
    address:      &str,
    port:         u16,
    test_servers: bool,
    premium:      bool,
) -> Result<ByteStream, TransportError> {
    let url = endpoint_url(address, port, test_servers, premium);
    log::info!("[transport] connecting to {url} …");
    let (socket, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    log::debug!("[transport] {url} open");

    let (mut sink, mut source) = socket.split();
    let (stream, feed, mut outbound) = ByteStream::detached();

    tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            match frame {
                Outbound::Binary(bytes) => {
                    if let Err(e) = sink.send(Message::Binary(bytes)).await {
                        log::warn!("[transport] send failed: {e}");
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = sink.close().await;
                    break;
                }
            }
        }
    });

    tokio::spawn(async move {
        while let Some(msg) = source.next().await {
            match msg {
                Ok(Message::Binary(bytes)) => feed.push(&bytes),
                Ok(Message::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.into_owned()))
                        .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                    feed.closed(code, &reason);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    feed.closed(ABNORMAL_CLOSURE, &e.to_string());
                    return;
                }
            }
        }
        feed.closed(ABNORMAL_CLOSURE, "socket ended");
    });

    Ok(stream)
}

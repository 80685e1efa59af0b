//! # mtsender-client
//!
//! Async MTProto RPC engine over WebSocket.
//!
//! ## Features
//! - Exact-length byte stream over a message-oriented socket
//! - Abridged and Intermediate packet framing
//! - Pending-request table keyed by message id, with resend scanning
//! - Typed error taxonomy (`Redirect`, `Flood`, `AuthKey`, …)
//! - Datacenter migration on `*_MIGRATE_N`, flood-wait auto-retry
//! - Session persistence (binary file, in-memory, SQLite)
//! - Connection lifecycle and server clock-offset events
//!
//! Encryption is a collaborator: plug it in through [`CodecFactory`]. Without
//! one, messages travel in plaintext, which is what the key exchange and
//! loopback tests need.

#![deny(unsafe_code)]

mod errors;
mod retry;
mod session;
pub mod events;
pub mod framing;
pub mod logging;
pub mod sender;
pub mod session_backend;
pub mod transport;

pub use errors::{ErrorKind, InvocationError, RpcError, SessionError, TransportError};
pub use events::{ConnectionEvent, ConnectionNotifier, ConnectionState, Origin};
pub use framing::Framing;
pub use logging::{LogConfig, Logger};
pub use retry::{AutoSleep, NoRetries, RetryContext, RetryPolicy};
pub use sender::{Sender, SenderParams};
pub use session::{DEFAULT_PORT, DcTarget, Session, SessionRecord, default_dc_addresses};
pub use session_backend::{BinaryFileBackend, InMemoryBackend, SessionBackend};
#[cfg(feature = "sqlite-session")]
pub use session_backend::SqliteBackend;
pub use transport::ByteStream;

pub use mtsender_crypto::AuthKey;
pub use mtsender_mtproto::{MessageCodec, MessageId, PlainCodec, RawCall, RemoteCall};

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Redirects followed for one call before giving up.
const MAX_MIGRATIONS: u32 = 3;

// ─── Collaborator seams ──────────────────────────────────────────────────────

/// Builds the [`MessageCodec`] for a connection.
///
/// The encrypted codec lives outside this crate; it receives the session's
/// auth key (if any) here.
pub trait CodecFactory: Send + Sync {
    fn codec(&self, auth_key: Option<&AuthKey>) -> Box<dyn MessageCodec>;
}

/// Always hands out a [`PlainCodec`].
pub struct PlainCodecFactory;

impl CodecFactory for PlainCodecFactory {
    fn codec(&self, _auth_key: Option<&AuthKey>) -> Box<dyn MessageCodec> {
        Box::new(PlainCodec::new())
    }
}

/// Opens the byte stream to a datacenter.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        target:       &'a DcTarget,
        test_servers: bool,
        premium:      bool,
    ) -> BoxFuture<'a, Result<ByteStream, TransportError>>;
}

/// Connects with [`transport::connect`] (WebSocket).
pub struct WebSocketConnector;

impl Connector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        target:       &'a DcTarget,
        test_servers: bool,
        premium:      bool,
    ) -> BoxFuture<'a, Result<ByteStream, TransportError>> {
        Box::pin(transport::connect(&target.address, target.port, test_servers, premium))
    }
}

// ─── Config ───────────────────────────────────────────────────────────────────

/// Configuration for [`Client::connect`].
#[derive(Clone)]
pub struct Config {
    /// Use the test datacenters (`/apiws_test`).
    pub test_servers:     bool,
    /// Use the premium endpoints (`/apiws_premium`).
    pub premium:          bool,
    /// Which MTProto framing to use (default: Abridged).
    pub framing:          Framing,
    pub retry_policy:     Arc<dyn RetryPolicy>,
    /// How long a sent request may stay unacknowledged before it is due for a
    /// resend.
    pub resend_threshold: Duration,
    /// How often the client scans for and performs resends; `None` leaves it
    /// to the caller ([`Sender::resend_candidates`]).
    pub resend_interval:  Option<Duration>,
    /// Session persistence backend (default: binary file `"mtsender.session"`).
    pub session_backend:  Arc<dyn SessionBackend>,
    /// Datacenter endpoints used for first connect and redirects.
    pub dc_table:         HashMap<i32, DcTarget>,
    /// Datacenter to use when the session names none.
    pub default_dc:       i32,
    pub codec_factory:    Arc<dyn CodecFactory>,
    pub connector:        Arc<dyn Connector>,
    /// Network reachability; the stream is closed when it turns `false`.
    pub network:          Option<watch::Receiver<bool>>,
    pub log:              LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            test_servers:     false,
            premium:          false,
            framing:          Framing::Abridged,
            retry_policy:     Arc::new(AutoSleep::default()),
            resend_threshold: mtsender_mtproto::RESEND_THRESHOLD,
            resend_interval:  Some(Duration::from_secs(1)),
            session_backend:  Arc::new(BinaryFileBackend::new("mtsender.session")),
            dc_table:         default_dc_addresses(),
            default_dc:       2,
            codec_factory:    Arc::new(PlainCodecFactory),
            connector:        Arc::new(WebSocketConnector),
            network:          None,
            log:              LogConfig::default(),
        }
    }
}

// ─── UpdateStream ─────────────────────────────────────────────────────────────

/// Unsolicited server objects, as raw TL bodies.
pub struct UpdateStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl UpdateStream {
    /// Wait for the next update. Returns `None` once the client is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

// ─── Client ───────────────────────────────────────────────────────────────────

struct ClientInner {
    config:    Config,
    session:   Session,
    sender:    Mutex<Sender>,
    notifier:  ConnectionNotifier,
    update_tx: mpsc::UnboundedSender<Vec<u8>>,
    update_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    shutdown:  CancellationToken,
}

impl ClientInner {
    async fn open_sender(&self) -> Result<Sender, InvocationError> {
        Sender::connect(&self.session, &self.config, &self.notifier, &self.update_tx).await
    }
}

/// The RPC client. Cheap to clone; the state is shared behind an `Arc`.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    // ── Connect ────────────────────────────────────────────────────────────

    /// Load the session and connect to its datacenter.
    pub async fn connect(config: Config) -> Result<Self, InvocationError> {
        logging::init(&config.log);

        let session = Session::load(Arc::clone(&config.session_backend))?;
        if session.dc().is_err() {
            let dc = config
                .dc_table
                .get(&config.default_dc)
                .cloned()
                .ok_or(SessionError::Missing("default datacenter address"))?;
            log::info!("[mtsender] fresh session, starting on DC{}", dc.id);
            session.set_dc(dc.id, dc.address, dc.port)?;
        }

        let notifier = ConnectionNotifier::new();
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let sender = Sender::connect(&session, &config, &notifier, &update_tx).await?;

        let inner = Arc::new(ClientInner {
            config,
            session,
            sender:    Mutex::new(sender),
            notifier,
            update_tx,
            update_rx: std::sync::Mutex::new(Some(update_rx)),
            shutdown:  CancellationToken::new(),
        });
        let client = Self { inner };
        client.spawn_offset_writer();
        if let Some(every) = client.inner.config.resend_interval.filter(|d| !d.is_zero()) {
            client.spawn_resend_scheduler(every);
        }
        Ok(client)
    }

    /// The session this client reads and updates.
    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    /// Connection lifecycle events from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.notifier.subscribe()
    }

    /// Take the update stream. Only the first call returns it.
    pub fn stream_updates(&self) -> Option<UpdateStream> {
        self.inner
            .update_rx
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .map(|rx| UpdateStream { rx })
    }

    /// The current connection.
    pub async fn sender(&self) -> Sender {
        self.inner.sender.lock().await.clone()
    }

    // ── Raw invoke ─────────────────────────────────────────────────────────

    /// Invoke `request`, following redirects and applying the retry policy.
    pub async fn invoke<R: RemoteCall>(&self, request: &R) -> Result<Vec<u8>, InvocationError> {
        let mut fail_count   = NonZeroU32::MIN;
        let mut slept_so_far = Duration::default();
        let mut migrations   = 0u32;
        loop {
            let error = match self.do_invoke(request).await {
                Ok(body) => return Ok(body),
                Err(e) => e,
            };

            if let Some(dc_id) = error.migrate_dc() {
                if migrations < MAX_MIGRATIONS {
                    migrations += 1;
                    self.migrate_to(dc_id).await?;
                    continue;
                }
                return Err(error);
            }

            if error.kind() == Some(ErrorKind::AuthKey) {
                log::warn!("[mtsender] auth key error ({error}), re-establishing connection");
                self.reconnect().await?;
                return Err(error);
            }

            let ctx = RetryContext { fail_count, slept_so_far, error };
            match self.inner.config.retry_policy.should_retry(&ctx) {
                ControlFlow::Continue(delay) => {
                    sleep(delay).await;
                    slept_so_far += delay;
                    fail_count = fail_count.saturating_add(1);
                }
                ControlFlow::Break(()) => return Err(ctx.error),
            }
        }
    }

    async fn do_invoke<R: RemoteCall>(&self, request: &R) -> Result<Vec<u8>, InvocationError> {
        let sender = {
            let mut guard = self.inner.sender.lock().await;
            if !guard.is_connected() {
                log::info!("[mtsender] connection lost, reconnecting to DC{} …", guard.dc_id());
                *guard = self.inner.open_sender().await?;
            }
            guard.clone()
        };
        sender.invoke(request).await
    }

    /// Ping the server; the pong also refreshes the clock offset.
    pub async fn ping(&self) -> Result<(), InvocationError> {
        self.sender().await.ping().await
    }

    // ── DC migration ───────────────────────────────────────────────────────

    async fn migrate_to(&self, dc_id: i32) -> Result<(), InvocationError> {
        let target = self
            .inner
            .config
            .dc_table
            .get(&dc_id)
            .cloned()
            .ok_or(SessionError::Missing("datacenter address"))?;
        log::info!("[mtsender] migrating to DC{dc_id} ({}:{}) …", target.address, target.port);

        let mut guard = self.inner.sender.lock().await;
        guard.disconnect();
        // Auth keys are per datacenter.
        self.inner.session.set_auth_key(None)?;
        self.inner.session.set_dc(target.id, target.address, target.port)?;
        self.inner.session.save()?;
        *guard = self.inner.open_sender().await?;
        log::info!("[mtsender] now on DC{dc_id}");
        Ok(())
    }

    /// Drop the current connection and open a new one to the session's DC.
    pub async fn reconnect(&self) -> Result<(), InvocationError> {
        let mut guard = self.inner.sender.lock().await;
        guard.disconnect();
        *guard = self.inner.open_sender().await?;
        Ok(())
    }

    // ── Session ────────────────────────────────────────────────────────────

    /// Persist the session.
    pub async fn save_session(&self) -> Result<(), InvocationError> {
        self.inner.session.save()?;
        log::info!("[mtsender] session saved");
        Ok(())
    }

    /// Disconnect and stop background tasks.
    pub async fn disconnect(&self) {
        self.inner.shutdown.cancel();
        self.inner.sender.lock().await.disconnect();
    }

    /// Disconnect and erase the stored session.
    pub async fn log_out(&self) -> Result<(), InvocationError> {
        self.disconnect().await;
        self.inner.session.delete()?;
        log::info!("[mtsender] logged out");
        Ok(())
    }

    // ── Background tasks ───────────────────────────────────────────────────

    /// Write every server clock correction into the session.
    fn spawn_offset_writer(&self) {
        let mut events = self.inner.notifier.subscribe();
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    e = events.recv() => e,
                };
                match event {
                    Ok(ConnectionEvent::ServerTimeOffset(offset)) => {
                        let Some(inner) = inner.upgrade() else { return };
                        if let Err(e) = inner.session.set_time_offset(offset) {
                            log::warn!("[mtsender] could not store time offset: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("[mtsender] offset writer lagged by {n} events");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
    }

    /// Periodically resend requests whose lifecycle says so.
    fn spawn_resend_scheduler(&self, every: Duration) {
        let inner = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tick.tick() => {}
                }
                let Some(inner) = inner.upgrade() else { return };
                let sender = inner.sender.lock().await.clone();
                for id in sender.resend_candidates() {
                    if let Err(e) = sender.resend(id) {
                        log::warn!("[mtsender] resend of {id} failed: {e}");
                        break;
                    }
                }
            }
        });
    }
}

//! Connection lifecycle events.
//!
//! [`ConnectionNotifier`] is a plain broadcast: it reports what happened and
//! leaves any reconnect policy to whoever listens.

use std::fmt;

use tokio::sync::broadcast;

/// Events kept for slow subscribers before they start lagging.
const CHANNEL_CAPACITY: usize = 64;

/// Coarse connection state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    /// The auth key was rejected; the session must be re-established.
    Broken,
}

/// What caused a state change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Origin {
    /// A connection attempt succeeded.
    Connect,
    /// The caller asked to disconnect.
    ExplicitClose,
    /// The socket closed under us.
    SocketClosed { code: u16 },
    /// The network went offline.
    NetworkOffline,
    /// The server no longer knows our auth key (transport error 404).
    AuthKeyRejected,
    /// The server revoked the session (`AUTH_KEY_UNREGISTERED`, `SESSION_REVOKED`, …).
    SessionRevoked,
    /// The server answered with a transport error other than 404.
    InvalidBuffer { code: i32 },
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect               => write!(f, "connect"),
            Self::ExplicitClose         => write!(f, "explicit close"),
            Self::SocketClosed { code } => write!(f, "socket closed ({code})"),
            Self::NetworkOffline        => write!(f, "network offline"),
            Self::AuthKeyRejected       => write!(f, "auth key rejected"),
            Self::SessionRevoked        => write!(f, "session revoked"),
            Self::InvalidBuffer { code } => write!(f, "invalid buffer ({code})"),
        }
    }
}

/// One notification.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection changed state.
    State { state: ConnectionState, origin: Origin },
    /// The server clock offset (seconds) was recomputed.
    ServerTimeOffset(i32),
}

/// Broadcasts [`ConnectionEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionNotifier {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionNotifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// A receiver for every event emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        log::debug!("[events] {event:?}");
        // No subscribers is not an error.
        let _ = self.tx.send(event);
    }

    pub fn connected(&self, origin: Origin) {
        self.emit(ConnectionEvent::State { state: ConnectionState::Connected, origin });
    }

    pub fn disconnected(&self, origin: Origin) {
        self.emit(ConnectionEvent::State { state: ConnectionState::Disconnected, origin });
    }

    pub fn broken(&self, origin: Origin) {
        self.emit(ConnectionEvent::State { state: ConnectionState::Broken, origin });
    }

    pub fn time_offset(&self, offset: i32) {
        self.emit(ConnectionEvent::ServerTimeOffset(offset));
    }
}

impl Default for ConnectionNotifier {
    fn default() -> Self { Self::new() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let n = ConnectionNotifier::new();
        let mut rx = n.subscribe();
        n.connected(Origin::Connect);
        n.time_offset(-3);
        n.broken(Origin::AuthKeyRejected);

        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::State { state: ConnectionState::Connected, origin: Origin::Connect }
        );
        assert_eq!(rx.recv().await.unwrap(), ConnectionEvent::ServerTimeOffset(-3));
        assert_eq!(
            rx.recv().await.unwrap(),
            ConnectionEvent::State { state: ConnectionState::Broken, origin: Origin::AuthKeyRejected }
        );
    }

    #[test]
    fn emitting_without_subscribers_is_fine() {
        let n = ConnectionNotifier::default();
        n.disconnected(Origin::ExplicitClose);
    }
}

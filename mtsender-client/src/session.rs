//! Session persistence: datacenter target, auth key and clock offset.
//!
//! [`Session`] is the synchronized in-process view of one [`SessionRecord`];
//! the [`SessionBackend`] behind it decides where the record is stored.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mtsender_crypto::AuthKey;

use crate::errors::SessionError;
use crate::session_backend::{InMemoryBackend, SessionBackend};

/// Port every production datacenter listens on for `wss://`.
pub const DEFAULT_PORT: u16 = 443;

/// Where the client connects: one datacenter endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DcTarget {
    pub id:      i32,
    pub address: String,
    pub port:    u16,
}

impl DcTarget {
    pub fn new(id: i32, address: impl Into<String>, port: u16) -> Self {
        Self { id, address: address.into(), port }
    }
}

/// Everything a session persists.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionRecord {
    /// Active datacenter; `None` until the first connect picks one.
    pub dc:          Option<DcTarget>,
    /// Key handed over by the key exchange; `None` until negotiated.
    pub auth_key:    Option<AuthKey>,
    /// Server clock minus local clock, in seconds.
    pub time_offset: i32,
}

/// Bootstrap datacenter table, used when the session names no endpoint.
pub fn default_dc_addresses() -> HashMap<i32, DcTarget> {
    [
        (1, "149.154.175.53"),
        (2, "149.154.167.51"),
        (3, "149.154.175.100"),
        (4, "149.154.167.91"),
        (5, "91.108.56.130"),
    ]
    .into_iter()
    .map(|(id, addr)| (id, DcTarget::new(id, addr, DEFAULT_PORT)))
    .collect()
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// The active session: one datacenter target, its auth key and clock offset.
///
/// All accessors are safe to call from any task. [`set_dc`](Self::set_dc)
/// swaps id, address and port under one write lock, so a reader never sees a
/// half-migrated target.
pub struct Session {
    backend: Arc<dyn SessionBackend>,
    record:  RwLock<SessionRecord>,
}

impl Session {
    /// Load the record from `backend`, starting empty if it holds none.
    pub fn load(backend: Arc<dyn SessionBackend>) -> Result<Self, SessionError> {
        let record = backend.load()?;
        match &record {
            Some(r) => log::info!(
                "[session] loaded from {} (dc {:?}, key {})",
                backend.name(),
                r.dc.as_ref().map(|d| d.id),
                if r.auth_key.is_some() { "present" } else { "absent" },
            ),
            None => log::info!("[session] {} holds no session, starting fresh", backend.name()),
        }
        Ok(Self { backend, record: RwLock::new(record.unwrap_or_default()) })
    }

    /// A session that lives only as long as this value.
    pub fn in_memory() -> Self {
        Self { backend: Arc::new(InMemoryBackend::new()), record: RwLock::new(SessionRecord::default()) }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, SessionRecord>, SessionError> {
        self.record.read().map_err(|_| SessionError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, SessionRecord>, SessionError> {
        self.record.write().map_err(|_| SessionError::Poisoned)
    }

    /// The active datacenter target as one consistent value.
    pub fn dc(&self) -> Result<DcTarget, SessionError> {
        self.read()?.dc.clone().ok_or(SessionError::Missing("datacenter"))
    }

    pub fn dc_id(&self) -> Result<i32, SessionError> {
        self.dc().map(|d| d.id)
    }

    pub fn server_address(&self) -> Result<String, SessionError> {
        self.dc().map(|d| d.address)
    }

    pub fn port(&self) -> Result<u16, SessionError> {
        self.dc().map(|d| d.port)
    }

    pub fn auth_key(&self) -> Result<AuthKey, SessionError> {
        self.read()?.auth_key.clone().ok_or(SessionError::Missing("auth key"))
    }

    /// Replace the auth key (or clear it with `None`).
    pub fn set_auth_key(&self, key: Option<AuthKey>) -> Result<(), SessionError> {
        self.write()?.auth_key = key;
        Ok(())
    }

    /// Point the session at another datacenter. The auth key is left alone.
    pub fn set_dc(&self, dc_id: i32, address: impl Into<String>, port: u16) -> Result<(), SessionError> {
        let target = DcTarget::new(dc_id, address, port);
        log::info!("[session] dc → {} ({}:{})", target.id, target.address, target.port);
        self.write()?.dc = Some(target);
        Ok(())
    }

    pub fn time_offset(&self) -> Result<i32, SessionError> {
        Ok(self.read()?.time_offset)
    }

    pub fn set_time_offset(&self, offset: i32) -> Result<(), SessionError> {
        self.write()?.time_offset = offset;
        Ok(())
    }

    /// A consistent copy of the whole record.
    pub fn snapshot(&self) -> Result<SessionRecord, SessionError> {
        Ok(self.read()?.clone())
    }

    /// Persist the current record through the backend.
    pub fn save(&self) -> Result<(), SessionError> {
        let record = self.snapshot()?;
        self.backend.save(&record)?;
        log::debug!("[session] saved to {}", self.backend.name());
        Ok(())
    }

    /// Erase the stored record and forget the in-memory one.
    pub fn delete(&self) -> Result<(), SessionError> {
        self.backend.delete()?;
        *self.write()? = SessionRecord::default();
        log::info!("[session] deleted from {}", self.backend.name());
        Ok(())
    }

    /// Name of the storage backend.
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }
}

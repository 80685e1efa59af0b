//! Pluggable session storage backend.
//!
//! The [`SessionBackend`] trait abstracts over session persistence so that
//! callers can swap in an SQLite store, a binary file, an in-memory store, or
//! anything else.
//!
//! Built-in backends:
//! * [`BinaryFileBackend`]: compact versioned binary file (default).
//! * [`InMemoryBackend`]: nothing touches the disk.
//! * [`SqliteBackend`]: SQLite (requires the `sqlite-session` Cargo feature).

use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use mtsender_crypto::{AUTH_KEY_LEN, AuthKey};

use crate::session::{DcTarget, SessionRecord};

// ─── Trait ────────────────────────────────────────────────────────────────────

/// An abstraction over where and how session data is persisted.
pub trait SessionBackend: Send + Sync {
    /// Persist the given record.
    fn save(&self, record: &SessionRecord) -> io::Result<()>;

    /// Load a previously persisted record, or return `None` if none exists.
    fn load(&self) -> io::Result<Option<SessionRecord>>;

    /// Remove the stored record (e.g. on log-out).
    fn delete(&self) -> io::Result<()>;

    /// Human-readable name of this backend (for log messages).
    fn name(&self) -> &str;
}

// ─── BinaryFileBackend ────────────────────────────────────────────────────────

/// Current layout version of [`BinaryFileBackend`] files.
const FILE_VERSION: u8 = 1;

/// The default session backend: stores the record in a compact binary file.
///
/// Layout (little-endian):
///
/// ```text
/// version:u8
/// has_dc:u8   [dc_id:i32  port:u16  addr_len:u16  addr:addr_len bytes]
/// has_key:u8  [auth_key:256 bytes]
/// time_offset:i32
/// ```
pub struct BinaryFileBackend {
    path: PathBuf,
}

impl BinaryFileBackend {
    /// Store the session at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn encode(record: &SessionRecord) -> io::Result<Vec<u8>> {
        let mut b = vec![FILE_VERSION];
        match &record.dc {
            Some(dc) => {
                let addr = dc.address.as_bytes();
                let addr_len = u16::try_from(addr.len()).map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("datacenter address of {} bytes does not fit the session file", addr.len()),
                    )
                })?;
                b.push(1);
                b.extend_from_slice(&dc.id.to_le_bytes());
                b.extend_from_slice(&dc.port.to_le_bytes());
                b.extend_from_slice(&addr_len.to_le_bytes());
                b.extend_from_slice(addr);
            }
            None => b.push(0),
        }
        match &record.auth_key {
            Some(k) => { b.push(1); b.extend_from_slice(k.as_bytes()); }
            None    => { b.push(0); }
        }
        b.extend_from_slice(&record.time_offset.to_le_bytes());
        Ok(b)
    }

    fn decode(buf: &[u8]) -> io::Result<SessionRecord> {
        let mut p = 0usize;
        macro_rules! r {
            ($n:expr) => {{
                if p + $n > buf.len() {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated session"));
                }
                let s = &buf[p..p + $n];
                p += $n;
                s
            }};
        }
        let version = r!(1)[0];
        if version != FILE_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unsupported session version {version}"),
            ));
        }
        let dc = if r!(1)[0] == 1 {
            let id   = { let s = r!(4); i32::from_le_bytes([s[0], s[1], s[2], s[3]]) };
            let port = { let s = r!(2); u16::from_le_bytes([s[0], s[1]]) };
            let al   = { let s = r!(2); u16::from_le_bytes([s[0], s[1]]) as usize };
            let address = String::from_utf8_lossy(r!(al)).into_owned();
            Some(DcTarget { id, address, port })
        } else {
            None
        };
        let auth_key = if r!(1)[0] == 1 {
            let k = r!(AUTH_KEY_LEN);
            Some(AuthKey::from_slice(k).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?)
        } else {
            None
        };
        let time_offset = { let s = r!(4); i32::from_le_bytes([s[0], s[1], s[2], s[3]]) };
        Ok(SessionRecord { dc, auth_key, time_offset })
    }
}

impl SessionBackend for BinaryFileBackend {
    fn save(&self, record: &SessionRecord) -> io::Result<()> {
        // Sibling file first; the rename replaces the old session atomically.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, Self::encode(record)?)?;
        std::fs::rename(&tmp, &self.path)
    }

    fn load(&self) -> io::Result<Option<SessionRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let buf = std::fs::read(&self.path)?;
        Self::decode(&buf).map(Some)
    }

    fn delete(&self) -> io::Result<()> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    fn name(&self) -> &str { "binary-file" }
}

// ─── InMemoryBackend ─────────────────────────────────────────────────────────

/// An ephemeral session backend that stores nothing on disk.
///
/// Useful for testing or for short-lived tools that should always start fresh.
#[derive(Default)]
pub struct InMemoryBackend {
    data: Mutex<Option<SessionRecord>>,
}

impl InMemoryBackend {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that already holds `record`.
    pub fn with_record(record: SessionRecord) -> Self {
        Self { data: Mutex::new(Some(record)) }
    }

    fn slot(&self) -> io::Result<std::sync::MutexGuard<'_, Option<SessionRecord>>> {
        self.data
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "in-memory session poisoned"))
    }
}

impl SessionBackend for InMemoryBackend {
    fn save(&self, record: &SessionRecord) -> io::Result<()> {
        *self.slot()? = Some(record.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<SessionRecord>> {
        Ok(self.slot()?.clone())
    }

    fn delete(&self) -> io::Result<()> {
        *self.slot()? = None;
        Ok(())
    }

    fn name(&self) -> &str { "in-memory" }
}

// ─── SqliteBackend ────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite-session")]
pub use sqlite_backend::SqliteBackend;

#[cfg(feature = "sqlite-session")]
mod sqlite_backend {
    use super::*;
    use rusqlite::{Connection, OptionalExtension, params};

    fn sql_err(e: rusqlite::Error) -> io::Error {
        io::Error::new(io::ErrorKind::Other, e)
    }

    /// SQLite-backed session store.
    ///
    /// Keeps a single row in a `session` table, created if missing.
    ///
    /// Enable with the `sqlite-session` Cargo feature:
    /// ```toml
    /// [dependencies]
    /// mtsender-client = { version = "*", features = ["sqlite-session"] }
    /// ```
    pub struct SqliteBackend {
        path: PathBuf,
    }

    impl SqliteBackend {
        /// Open (or create) the database at `path`.
        pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
            let path = path.into();
            // Initialise the schema immediately so errors surface early.
            let conn = Connection::open(&path).map_err(sql_err)?;
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS session (
                    id          INTEGER PRIMARY KEY CHECK (id = 1),
                    dc_id       INTEGER,
                    address     TEXT,
                    port        INTEGER,
                    auth_key    BLOB,
                    time_offset INTEGER NOT NULL DEFAULT 0
                );",
            ).map_err(sql_err)?;
            Ok(Self { path })
        }
    }

    impl SessionBackend for SqliteBackend {
        fn save(&self, record: &SessionRecord) -> io::Result<()> {
            let conn = Connection::open(&self.path).map_err(sql_err)?;
            let key_blob: Option<Vec<u8>> = record.auth_key.as_ref().map(|k| k.as_bytes().to_vec());
            conn.execute(
                "INSERT OR REPLACE INTO session (id, dc_id, address, port, auth_key, time_offset)
                 VALUES (1, ?1, ?2, ?3, ?4, ?5)",
                params![
                    record.dc.as_ref().map(|d| d.id),
                    record.dc.as_ref().map(|d| d.address.clone()),
                    record.dc.as_ref().map(|d| d.port),
                    key_blob,
                    record.time_offset,
                ],
            ).map_err(sql_err)?;
            Ok(())
        }

        fn load(&self) -> io::Result<Option<SessionRecord>> {
            if !self.path.exists() {
                return Ok(None);
            }
            let conn = Connection::open(&self.path).map_err(sql_err)?;
            let row = conn
                .query_row(
                    "SELECT dc_id, address, port, auth_key, time_offset FROM session WHERE id = 1",
                    [],
                    |row| {
                        let dc_id:       Option<i32>     = row.get(0)?;
                        let address:     Option<String>  = row.get(1)?;
                        let port:        Option<u16>     = row.get(2)?;
                        let key_blob:    Option<Vec<u8>> = row.get(3)?;
                        let time_offset: i32             = row.get(4)?;
                        Ok((dc_id, address, port, key_blob, time_offset))
                    },
                )
                .optional()
                .map_err(sql_err)?;

            let Some((dc_id, address, port, key_blob, time_offset)) = row else {
                return Ok(None);
            };
            let dc = match (dc_id, address, port) {
                (Some(id), Some(address), Some(port)) => Some(DcTarget { id, address, port }),
                _ => None,
            };
            let auth_key = match key_blob {
                Some(k) => Some(
                    AuthKey::from_slice(&k)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
                ),
                None => None,
            };
            Ok(Some(SessionRecord { dc, auth_key, time_offset }))
        }

        fn delete(&self) -> io::Result<()> {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            Ok(())
        }

        fn name(&self) -> &str { "sqlite" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SessionRecord {
        SessionRecord {
            dc:          Some(DcTarget { id: 4, address: "149.154.167.91".into(), port: 443 }),
            auth_key:    Some(AuthKey::from_bytes([7u8; AUTH_KEY_LEN])),
            time_offset: -12,
        }
    }

    #[test]
    fn binary_layout_round_trips() {
        let bytes = BinaryFileBackend::encode(&record()).unwrap();
        assert_eq!(bytes[0], FILE_VERSION);
        assert_eq!(BinaryFileBackend::decode(&bytes).unwrap(), record());
    }

    #[test]
    fn binary_layout_rejects_truncation_and_unknown_version() {
        let mut bytes = BinaryFileBackend::encode(&record()).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(BinaryFileBackend::decode(&bytes).is_err());

        let mut bytes = BinaryFileBackend::encode(&SessionRecord::default()).unwrap();
        bytes[0] = 9;
        assert!(BinaryFileBackend::decode(&bytes).is_err());
    }

    #[test]
    fn oversized_address_is_refused_not_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let backend = BinaryFileBackend::new(dir.path().join("s.session"));
        let mut long = record();
        if let Some(dc) = long.dc.as_mut() {
            dc.address = "a".repeat(70_000);
        }

        let err = backend.save(&long).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(backend.load().unwrap().is_none());

        backend.save(&record()).unwrap();
        assert_eq!(backend.load().unwrap(), Some(record()));
    }

    #[test]
    fn empty_record_round_trips() {
        let bytes = BinaryFileBackend::encode(&SessionRecord::default()).unwrap();
        assert_eq!(bytes.len(), 1 + 1 + 1 + 4);
        assert_eq!(BinaryFileBackend::decode(&bytes).unwrap(), SessionRecord::default());
    }
}

//! `AuthKey`: opaque 256-byte key handed over by the key-exchange step.

use std::fmt;

use crate::sha1;

/// Length of an MTProto authorization key in bytes.
pub const AUTH_KEY_LEN: usize = 256;

/// An authorization key (256 bytes) plus pre-computed identifiers.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; AUTH_KEY_LEN],
    pub(crate) aux_hash: [u8; 8],
    pub(crate) key_id: [u8; 8],
}

impl AuthKey {
    /// Construct from raw 256-byte key-exchange output.
    pub fn from_bytes(data: [u8; AUTH_KEY_LEN]) -> Self {
        let sha = sha1!(&data);
        let mut aux_hash = [0u8; 8];
        aux_hash.copy_from_slice(&sha[..8]);
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&sha[12..20]);
        Self { data, aux_hash, key_id }
    }

    /// Construct from a slice read back from storage.
    ///
    /// Fails unless the slice is exactly [`AUTH_KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyLengthError> {
        let data: [u8; AUTH_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| KeyLengthError { got: bytes.len() })?;
        Ok(Self::from_bytes(data))
    }

    /// Return the raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; AUTH_KEY_LEN] { self.data }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; AUTH_KEY_LEN] { &self.data }

    /// The 8-byte key identifier (SHA-1(key)[12..20]).
    pub fn key_id(&self) -> [u8; 8] { self.key_id }

    /// The key identifier as the little-endian `u64` that appears on the wire.
    pub fn key_id_u64(&self) -> u64 { u64::from_le_bytes(self.key_id) }

    /// The auxiliary hash (SHA-1(key)[0..8]).
    pub fn aux_hash(&self) -> [u8; 8] { self.aux_hash }
}

impl fmt::Debug for AuthKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthKey(id={:#018x})", self.key_id_u64())
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool { self.key_id == other.key_id }
}

impl Eq for AuthKey {}

// ─── KeyLengthError ───────────────────────────────────────────────────────────

/// A stored key blob did not have the expected length.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLengthError {
    /// Length of the rejected blob.
    pub got: usize,
}

impl fmt::Display for KeyLengthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "auth key must be {AUTH_KEY_LEN} bytes, got {}", self.got)
    }
}

impl std::error::Error for KeyLengthError {}

//! Key material for mtsender.
//!
//! The key exchange itself happens elsewhere; this crate only wraps the
//! negotiated 256-byte secret so the rest of the workspace can store it,
//! compare it and log it without ever printing the raw bytes.
//!
//! Provides:
//! - `AuthKey`: 256-byte key plus its SHA-1 derived identifiers
//! - `sha1!` hash macro
//! - random 64-bit ids for sessions and pings

#![deny(unsafe_code)]

mod auth_key;
mod sha;

pub use auth_key::{AuthKey, KeyLengthError, AUTH_KEY_LEN};

/// Draw a random `i64` from the operating system RNG.
///
/// Used for session ids and ping ids, which only need to be unpredictable,
/// not secret.
pub fn random_i64() -> Result<i64, getrandom::Error> {
    let mut b = [0u8; 8];
    getrandom::getrandom(&mut b)?;
    Ok(i64::from_le_bytes(b))
}

//! Error types for mtsender-client.
//!
//! Server-reported failures are [`RpcError`]s, classified by [`ErrorKind`] so
//! the client can pick between retrying, migrating and giving up. Everything
//! a call can fail with is folded into [`InvocationError`].

use std::{fmt, io};

use mtsender_mtproto::CodecError;

// ─── ErrorKind ────────────────────────────────────────────────────────────────

/// What the client should do about an [`RpcError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 303: repeat the call against another datacenter.
    Redirect,
    /// 400: the request itself is wrong; never retried.
    BadRequest,
    /// 401: the session needs (re-)authorization.
    Unauthorized,
    /// 403: not allowed; surfaced, never retried.
    Forbidden,
    /// 404: the object does not exist.
    NotFound,
    /// 406: the auth key is unusable; tear down the connection.
    AuthKey,
    /// 420: back off for the server-specified number of seconds.
    Flood,
    /// 500: internal server error; bounded retry.
    ServerError,
    /// 503: the server timed out; bounded retry.
    TimedOut,
    /// No category matched.
    Other,
}

impl ErrorKind {
    /// Category for an exact status code.
    ///
    /// Telegram reports internal timeouts and failures with negative codes
    /// (`-503 Timeout`), which are treated like their positive counterparts.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code.abs() {
            303 => Self::Redirect,
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            406 => Self::AuthKey,
            420 => Self::Flood,
            500 => Self::ServerError,
            503 => Self::TimedOut,
            _   => return None,
        })
    }

    /// Category inferred from the error name, for codes that carry none.
    pub fn from_name(name: &str) -> Option<Self> {
        if name.starts_with("FLOOD_WAIT") || name.starts_with("FLOOD_PREMIUM_WAIT") {
            Some(Self::Flood)
        } else if name.ends_with("_MIGRATE") {
            Some(Self::Redirect)
        } else if name == "AUTH_KEY_DUPLICATED" || name == "AUTH_KEY_UNREGISTERED" {
            Some(Self::AuthKey)
        } else {
            None
        }
    }

    /// Whether the same request may succeed if sent again later.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Flood | Self::ServerError | Self::TimedOut | Self::Redirect)
    }
}

// ─── RpcError ─────────────────────────────────────────────────────────────────

/// An error returned by the server in response to an RPC call.
///
/// Numeric values are stripped from the name and placed in [`RpcError::value`].
///
/// # Example
/// `FLOOD_WAIT_30` → `RpcError { code: 420, name: "FLOOD_WAIT", value: Some(30), .. }`
#[derive(Clone, Debug, PartialEq)]
pub struct RpcError {
    /// HTTP-like status code.
    pub code:    i32,
    /// Error name in SCREAMING_SNAKE_CASE with digits removed.
    pub name:    String,
    /// Numeric suffix extracted from the name, if any.
    pub value:   Option<u32>,
    /// Name of the request that failed, for diagnostics.
    pub request: Option<String>,
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC {}: {}", self.code, self.name)?;
        if let Some(v) = self.value {
            write!(f, " (value: {v})")?;
        }
        if let Some(req) = &self.request {
            write!(f, " caused by {req}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RpcError {}

impl RpcError {
    /// Parse a raw error message like `"FLOOD_WAIT_30"` into an `RpcError`.
    pub fn from_telegram(code: i32, message: &str) -> Self {
        // "FLOOD_WAIT_30" → name = "FLOOD_WAIT", value = Some(30)
        if let Some(idx) = message.rfind('_') {
            let suffix = &message[idx + 1..];
            if !suffix.is_empty() && suffix.chars().all(|c| c.is_ascii_digit()) {
                if let Ok(v) = suffix.parse::<u32>() {
                    let name = message[..idx].to_string();
                    return Self { code, name, value: Some(v), request: None };
                }
            }
        }
        Self { code, name: message.to_string(), value: None, request: None }
    }

    /// Attach the name of the request that caused this error.
    pub fn with_request(mut self, request: impl Into<String>) -> Self {
        self.request = Some(request.into());
        self
    }

    /// Classify the error: exact code first, then the name.
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::from_code(self.code)
            .or_else(|| ErrorKind::from_name(&self.name))
            .unwrap_or(ErrorKind::Other)
    }

    /// Match on the error name, with optional wildcard prefix/suffix `'*'`.
    ///
    /// # Examples
    /// - `err.is("FLOOD_WAIT")`: exact match
    /// - `err.is("PHONE_CODE_*")`: starts-with match
    /// - `err.is("*_MIGRATE")`: ends-with match
    pub fn is(&self, pattern: &str) -> bool {
        if let Some(prefix) = pattern.strip_suffix('*') {
            self.name.starts_with(prefix)
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            self.name.ends_with(suffix)
        } else {
            self.name == pattern
        }
    }

    /// Returns the flood-wait duration in seconds, if this is a flood error.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        if self.kind() == ErrorKind::Flood {
            self.value.map(u64::from)
        } else {
            None
        }
    }

    /// Target datacenter of a `*_MIGRATE_N` redirect.
    pub fn migrate_dc(&self) -> Option<i32> {
        if self.kind() == ErrorKind::Redirect {
            self.value.and_then(|v| i32::try_from(v).ok())
        } else {
            None
        }
    }

    /// Errors after which the auth key (and with it the session) is unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(self.name.as_str(), "AUTH_KEY_UNREGISTERED" | "SESSION_REVOKED" | "USER_DEACTIVATED")
            || self.kind() == ErrorKind::AuthKey
    }

    /// Whether sending the same request again may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

// ─── TransportError ──────────────────────────────────────────────────────────

/// Failures of the byte stream underneath the sender.
#[derive(Clone, Debug, PartialEq)]
pub enum TransportError {
    /// The stream is closed; pending and future reads fail with this.
    Closed,
    /// Opening the socket failed.
    Connect(String),
    /// A packet header made no sense for the configured framing.
    Framing(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed      => write!(f, "stream closed"),
            Self::Connect(e)  => write!(f, "connect failed: {e}"),
            Self::Framing(e)  => write!(f, "framing: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

// ─── SessionError ────────────────────────────────────────────────────────────

/// Errors raised by [`crate::Session`].
#[derive(Debug)]
pub enum SessionError {
    /// The backend has not supplied this value yet.
    Missing(&'static str),
    /// The backend failed to read or write.
    Io(io::Error),
    /// A previous holder of the session lock panicked.
    Poisoned,
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing(what) => write!(f, "session has no {what}"),
            Self::Io(e)         => write!(f, "session storage: {e}"),
            Self::Poisoned      => write!(f, "session lock poisoned"),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _           => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self { Self::Io(e) }
}

// ─── InvocationError ──────────────────────────────────────────────────────────

/// The error type returned from any call that talks to the server.
#[derive(Debug)]
pub enum InvocationError {
    /// The server rejected the request.
    Rpc(RpcError),
    /// The byte stream failed or closed.
    Transport(TransportError),
    /// A packet could not be packed or unpacked.
    Codec(CodecError),
    /// Session storage failed or lacks a value.
    Session(SessionError),
    /// The request was dropped (sender shut down before a reply arrived).
    Dropped,
    /// The server refused the message itself (`bad_msg_notification` code).
    BadMessage(i32),
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rpc(e)        => write!(f, "{e}"),
            Self::Transport(e)  => write!(f, "transport: {e}"),
            Self::Codec(e)      => write!(f, "codec: {e}"),
            Self::Session(e)    => write!(f, "{e}"),
            Self::Dropped       => write!(f, "request dropped"),
            Self::BadMessage(c) => write!(f, "server rejected message (code {c})"),
        }
    }
}

impl std::error::Error for InvocationError {}

impl From<RpcError> for InvocationError {
    fn from(e: RpcError) -> Self { Self::Rpc(e) }
}

impl From<TransportError> for InvocationError {
    fn from(e: TransportError) -> Self { Self::Transport(e) }
}

impl From<CodecError> for InvocationError {
    fn from(e: CodecError) -> Self { Self::Codec(e) }
}

impl From<SessionError> for InvocationError {
    fn from(e: SessionError) -> Self { Self::Session(e) }
}

impl InvocationError {
    /// Returns `true` if this is the named RPC error (supports `'*'` wildcards).
    pub fn is(&self, pattern: &str) -> bool {
        match self {
            Self::Rpc(e) => e.is(pattern),
            _            => false,
        }
    }

    /// Category of the RPC error, if this is one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Rpc(e) => Some(e.kind()),
            _            => None,
        }
    }

    /// If this is a flood error, returns how many seconds to wait.
    pub fn flood_wait_seconds(&self) -> Option<u64> {
        match self {
            Self::Rpc(e) => e.flood_wait_seconds(),
            _            => None,
        }
    }

    /// If this is a redirect, the datacenter to repeat the call against.
    pub fn migrate_dc(&self) -> Option<i32> {
        match self {
            Self::Rpc(e) => e.migrate_dc(),
            _            => None,
        }
    }
}

//! Retry policies for flood waits and transient server failures.

use std::num::NonZeroU32;
use std::ops::ControlFlow;
use std::time::Duration;

use crate::errors::{ErrorKind, InvocationError};

/// Controls how the client reacts when an RPC call fails.
pub trait RetryPolicy: Send + Sync + 'static {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration>;
}

/// Context passed to [`RetryPolicy::should_retry`] on each failure.
pub struct RetryContext {
    pub fail_count:   NonZeroU32,
    pub slept_so_far: Duration,
    pub error:        InvocationError,
}

/// Never retry.
pub struct NoRetries;
impl RetryPolicy for NoRetries {
    fn should_retry(&self, _: &RetryContext) -> ControlFlow<(), Duration> {
        ControlFlow::Break(())
    }
}

/// Sleep through short flood waits and retry server errors a few times.
pub struct AutoSleep {
    /// Longest flood wait slept through automatically.
    pub threshold:          Duration,
    /// Pause before repeating a request that hit a 500/503.
    pub server_error_delay: Duration,
    /// Attempts (including the first) before a server error is surfaced.
    pub max_attempts:       u32,
}

impl Default for AutoSleep {
    fn default() -> Self {
        Self {
            threshold:          Duration::from_secs(60),
            server_error_delay: Duration::from_secs(1),
            max_attempts:       3,
        }
    }
}

impl RetryPolicy for AutoSleep {
    fn should_retry(&self, ctx: &RetryContext) -> ControlFlow<(), Duration> {
        if let Some(secs) = ctx.error.flood_wait_seconds() {
            if ctx.fail_count.get() == 1 && secs <= self.threshold.as_secs() {
                log::info!("[retry] FLOOD_WAIT_{secs}, sleeping before retry");
                return ControlFlow::Continue(Duration::from_secs(secs));
            }
            return ControlFlow::Break(());
        }
        let transient = matches!(ctx.error.kind(), Some(ErrorKind::ServerError | ErrorKind::TimedOut))
            || matches!(ctx.error, InvocationError::Transport(_));
        if transient && ctx.fail_count.get() < self.max_attempts {
            log::info!(
                "[retry] {} (attempt {}), sleeping {:?} before retry",
                ctx.error, ctx.fail_count, self.server_error_delay
            );
            return ControlFlow::Continue(self.server_error_delay);
        }
        ControlFlow::Break(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RpcError, TransportError};

    fn ctx(n: u32, error: InvocationError) -> RetryContext {
        RetryContext { fail_count: NonZeroU32::new(n).unwrap(), slept_so_far: Duration::ZERO, error }
    }

    #[test]
    fn short_flood_wait_is_slept_once() {
        let p = AutoSleep::default();
        let e = || InvocationError::Rpc(RpcError::from_telegram(420, "FLOOD_WAIT_30"));
        assert_eq!(p.should_retry(&ctx(1, e())), ControlFlow::Continue(Duration::from_secs(30)));
        assert_eq!(p.should_retry(&ctx(2, e())), ControlFlow::Break(()));
    }

    #[test]
    fn long_flood_wait_is_surfaced() {
        let p = AutoSleep::default();
        let e = InvocationError::Rpc(RpcError::from_telegram(420, "FLOOD_WAIT_3600"));
        assert_eq!(p.should_retry(&ctx(1, e)), ControlFlow::Break(()));
    }

    #[test]
    fn server_errors_are_bounded() {
        let p = AutoSleep::default();
        let e = || InvocationError::Rpc(RpcError::from_telegram(500, "INTERNAL"));
        assert_eq!(p.should_retry(&ctx(1, e())), ControlFlow::Continue(Duration::from_secs(1)));
        assert_eq!(p.should_retry(&ctx(2, e())), ControlFlow::Continue(Duration::from_secs(1)));
        assert_eq!(p.should_retry(&ctx(3, e())), ControlFlow::Break(()));

        let t = InvocationError::Rpc(RpcError::from_telegram(-503, "Timeout"));
        assert!(p.should_retry(&ctx(1, t)).is_continue());
        let closed = InvocationError::Transport(TransportError::Closed);
        assert!(p.should_retry(&ctx(1, closed)).is_continue());
    }

    #[test]
    fn terminal_errors_are_not_retried() {
        let p = AutoSleep::default();
        for (code, msg) in [(400, "PEER_ID_INVALID"), (403, "CHAT_WRITE_FORBIDDEN"), (418, "TEAPOT")] {
            let e = InvocationError::Rpc(RpcError::from_telegram(code, msg));
            assert_eq!(p.should_retry(&ctx(1, e)), ControlFlow::Break(()));
        }
        assert_eq!(NoRetries.should_retry(&ctx(1, InvocationError::Dropped)), ControlFlow::Break(()));
    }
}

//! Per-client request-policy behaviors.
//!
//! A behavior decides, for every request a client makes, whether to send it,
//! delay it, time it out, and whether to retry after a failure. The five
//! hooks fire in a fixed order per request: `on_request` (possibly repeated
//! after a delay), then exactly one of `on_response`/`on_error`/`on_fail`,
//! then `on_retry` when the outcome was not a success.

mod script;

use async_trait::async_trait;

pub use script::ScriptBehavior;

use crate::request::{Request, Response};
use crate::SimError;

/// Decision returned by the `on_request` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookDecision {
    pub allow: bool,
    pub delay_ms: i64,
    pub timeout_ms: i64,
}

impl HookDecision {
    /// Default when a hook is absent or raised: let the request through.
    pub fn allow_default() -> Self {
        Self {
            allow: true,
            delay_ms: 0,
            timeout_ms: 0,
        }
    }

    /// Default handed out during executor shutdown: treat as blocked.
    pub fn blocked() -> Self {
        Self {
            allow: false,
            delay_ms: 0,
            timeout_ms: 0,
        }
    }
}

/// Decision returned by the `on_retry` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub allow: bool,
    pub delay_ms: i64,
}

impl RetryDecision {
    /// Default when the hook is absent, raised, or shut down: give up.
    pub fn no_retry() -> Self {
        Self {
            allow: false,
            delay_ms: 0,
        }
    }
}

/// The five-hook behavior contract.
///
/// Implementations must serialize hook evaluation per client; the engine
/// relies on scripts never observing two hooks concurrently. Hook errors
/// are handled internally (logged, defaults returned) so the request path
/// never fails on a misbehaving script.
#[async_trait]
pub trait ClientBehavior: Send + Sync {
    /// Gate before sending; may delay or attach a timeout.
    async fn on_request(&self, req: &mut Request) -> HookDecision;

    /// Successful response arrived.
    async fn on_response(&self, req: &mut Request, resp: &Response);

    /// Server returned `ok = false`.
    async fn on_error(&self, req: &mut Request, resp: &Response);

    /// Transport failure: drop, timeout, admission rejection.
    async fn on_fail(&self, req: &mut Request, err: &SimError);

    /// Decide whether to try again after a non-success outcome.
    async fn on_retry(
        &self,
        req: &mut Request,
        resp: Option<&Response>,
        err: Option<&SimError>,
    ) -> RetryDecision;

    /// Releases the interpreter; queued hook calls resolve to the blocked
    /// defaults.
    fn close(&self);
}

/// Behavior used when no script is supplied: allows everything, never
/// delays, never retries.
#[derive(Debug, Default)]
pub struct NoopBehavior;

impl NoopBehavior {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ClientBehavior for NoopBehavior {
    async fn on_request(&self, _req: &mut Request) -> HookDecision {
        HookDecision::allow_default()
    }

    async fn on_response(&self, _req: &mut Request, _resp: &Response) {}

    async fn on_error(&self, _req: &mut Request, _resp: &Response) {}

    async fn on_fail(&self, _req: &mut Request, _err: &SimError) {}

    async fn on_retry(
        &self,
        _req: &mut Request,
        _resp: Option<&Response>,
        _err: Option<&SimError>,
    ) -> RetryDecision {
        RetryDecision::no_retry()
    }

    fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_allows_and_never_retries() {
        let behavior = NoopBehavior::new();
        let mut req = Request::new("r1", "c1", "test data");

        let decision = behavior.on_request(&mut req).await;
        assert!(decision.allow);
        assert_eq!(decision.delay_ms, 0);
        assert_eq!(decision.timeout_ms, 0);

        let retry = behavior
            .on_retry(&mut req, None, Some(&SimError::NetworkPacketLost))
            .await;
        assert!(!retry.allow);
    }
}

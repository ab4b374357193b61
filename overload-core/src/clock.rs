//! Cancellation-aware timing helpers.
//!
//! Every timed sleep in the engine is a suspension point that observes the
//! owning scope's cancellation token and returns an error instead of letting
//! the timer win the race.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use crate::SimError;

/// Sleeps for `duration`, or returns [`SimError::Cancelled`] if the token is
/// cancelled first.
pub async fn sleep_cancellable(token: &CancellationToken, duration: Duration) -> crate::Result<()> {
    tokio::select! {
        _ = token.cancelled() => Err(SimError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_completes_when_not_cancelled() {
        let token = CancellationToken::new();
        let result = sleep_cancellable(&token, Duration::from_millis(5)).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn sleep_returns_cancelled_error() {
        let token = CancellationToken::new();
        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            child.cancel();
        });

        let start = std::time::Instant::now();
        let result = sleep_cancellable(&token, Duration::from_secs(60)).await;
        assert!(matches!(result, Err(SimError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

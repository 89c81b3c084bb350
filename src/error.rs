//! Error taxonomy and retry logic
//!
//! Typed errors for the location relay, plus the backoff policy used when
//! a participant first attaches to the relay.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

/// Errors surfaced by the core.
#[derive(Debug, Error)]
pub enum GeoError {
    /// Sensor denied, absent, or timed out.
    #[error("position unavailable: {0}")]
    PositionUnavailable(String),

    /// The transport to the relay is gone.
    #[error("channel disconnected")]
    ChannelDisconnected,

    /// A payload was missing required fields or carried out-of-range values.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl GeoError {
    /// Check if this error is worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, GeoError::Transport(_) | GeoError::PositionUnavailable(_))
    }
}

/// Retry policy configuration
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts
    pub max_attempts: u32,

    /// Initial delay between retries
    pub initial_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Create a no-retry policy
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = (self.initial_delay.as_secs_f64() * factor).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Execute an async operation with retry logic.
///
/// Non-retryable errors are returned immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T, GeoError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, GeoError>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !e.is_retryable() || attempts >= policy.max_attempts.max(1) => {
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempts);
                tracing::warn!(
                    attempt = attempts,
                    max_attempts = policy.max_attempts,
                    ?delay,
                    "attempt failed: {e}; retrying"
                );
                sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retryable() {
        assert!(GeoError::Transport("refused".into()).is_retryable());
        assert!(!GeoError::MalformedPayload("lat".into()).is_retryable());
        assert!(!GeoError::ChannelDisconnected.is_retryable());
    }

    #[test]
    fn test_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));

        let no_retry = RetryPolicy::no_retry();
        assert_eq!(no_retry.max_attempts, 1);
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 10.0,
            max_delay: Duration::from_secs(3),
        };
        assert_eq!(policy.delay_for(5), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn test_with_retry_recovers() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1),
            ..Default::default()
        };

        let result = with_retry(&policy, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(GeoError::Transport("first".into()))
            } else {
                Ok(7)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_fatal() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = with_retry(&RetryPolicy::default(), || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(GeoError::Config("bad".into()))
        })
        .await;

        assert!(matches!(result, Err(GeoError::Config(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}

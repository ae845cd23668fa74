//! Retries for the initial signaling connection
//!
//! `P2PClient::connect` and `ConferenceClient::join` are the only callers.
//! Once a client is connected, reconnection belongs to the transport and a
//! failed negotiation ends its session.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ClientError, ClientResult};

/// Backoff schedule for connection attempts
///
/// ```rust
/// # use rtcsig_client_core::client::recovery::RetryConfig;
/// # use std::time::Duration;
/// let config = RetryConfig::default();
/// assert_eq!(config.max_attempts, 3);
/// assert_eq!(RetryConfig::none().max_attempts, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts in total, the first one included
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Spread each delay by up to 10% either way
    pub use_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Connect once and report the first failure
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (1-based), without jitter
    fn backoff(&self, retry: u32) -> Duration {
        let factor = self.backoff_multiplier.powi(retry.saturating_sub(1) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }

    fn delay(&self, retry: u32) -> Duration {
        let delay = self.backoff(retry);
        if !self.use_jitter {
            return delay;
        }
        let spread = 1.0 + (rand::random::<f64>() - 0.5) * 0.2;
        Duration::from_millis((delay.as_millis() as f64 * spread) as u64)
    }
}

/// Run `operation` until it succeeds, fails with an error that is not
/// recoverable, or uses up `config.max_attempts`
pub async fn retry_with_backoff<T, F, Fut>(
    operation_name: &str,
    config: RetryConfig,
    mut operation: F,
) -> ClientResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ClientResult<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Connected after retrying");
                }
                return Ok(value);
            }
            Err(e) if e.is_recoverable() && attempt < config.max_attempts => {
                let delay = config.delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    error = %e,
                    category = e.category(),
                    delay_ms = delay.as_millis() as u64,
                    "Retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                error!(
                    operation = operation_name,
                    attempt,
                    recoverable = e.is_recoverable(),
                    error = %e,
                    "Giving up"
                );
                return Err(e);
            }
        }
    }
}

/// Fail with [`ClientError::OperationTimeout`] when `future` takes longer
/// than `timeout`
pub async fn with_timeout<T, F>(operation_name: &str, timeout: Duration, future: F) -> ClientResult<T>
where
    F: Future<Output = ClientResult<T>>,
{
    tokio::time::timeout(timeout, future).await.unwrap_or_else(|_| {
        error!(operation = operation_name, timeout_ms = timeout.as_millis() as u64, "Timed out");
        Err(ClientError::OperationTimeout {
            duration_ms: timeout.as_millis() as u64,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtcsig_session_core::SessionError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fixed(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            use_jitter: false,
            ..RetryConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_retried() {
        let attempts = AtomicU32::new(0);

        let result = retry_with_backoff("connect", fixed(5), || async {
            if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(SessionError::transport("socket reset").into())
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(tokio_test::assert_ok!(result), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bad_token_is_not_retried() {
        let attempts = AtomicU32::new(0);

        let result: ClientResult<i32> = retry_with_backoff("connect", RetryConfig::default(), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(SessionError::invalid_token("not base64").into())
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_attempts() {
        let attempts = AtomicU32::new(0);

        let result: ClientResult<()> = retry_with_backoff("connect", fixed(3), || async {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ClientError::OperationTimeout { duration_ms: 5 })
        })
        .await;

        assert!(matches!(result, Err(ClientError::OperationTimeout { .. })));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_backoff_grows_and_is_capped() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            ..fixed(10)
        };
        assert_eq!(config.backoff(1), Duration::from_secs(1));
        assert_eq!(config.backoff(2), Duration::from_secs(2));
        assert_eq!(config.backoff(3), Duration::from_secs(4));
        assert_eq!(config.backoff(4), Duration::from_secs(5));
        assert_eq!(config.delay(4), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_join_timeout() {
        let result: ClientResult<()> = with_timeout("join", Duration::from_millis(100), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        })
        .await;
        assert!(matches!(
            result,
            Err(ClientError::OperationTimeout { duration_ms: 100 })
        ));
    }
}

//! Timeout defaults and async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for connecting, handshaking and single frame writes
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default time to wait for a correlated reply
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default time allowed for a graceful server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run a future with a timeout, returning `None` when it elapses
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future).await.ok()
}

/// Run a fallible future with a timeout, mapping expiry to [`ProtocolError::Timeout`]
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_with_timeout_error_maps_elapsed() {
        let result: Result<()> = with_timeout_error(
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            },
            Duration::from_millis(10),
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn test_with_timeout_passes_value_through() {
        assert_eq!(with_timeout(async { 5 }, Duration::from_secs(1)).await, Some(5));
        let inner: Result<u8> =
            with_timeout_error(async { Err(ProtocolError::NotConnected) }, Duration::from_secs(1))
                .await;
        assert!(matches!(inner, Err(ProtocolError::NotConnected)));
    }
}

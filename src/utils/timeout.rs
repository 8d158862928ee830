//! Timing defaults and async timeout helpers.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// How long a call waits for its response.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_millis(2500);

/// Idle time on the send path after which a disconnect probe goes out.
pub const DISCONNECT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Pause between two auto-reconnect attempts.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);

/// Upper bound for opening the TCP connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Await `fut` for at most `duration`, turning expiry into the error built by
/// `on_timeout`.
pub async fn with_timeout_error<F, T, E>(fut: F, duration: Duration, on_timeout: E) -> Result<T>
where
    F: Future<Output = Result<T>>,
    E: FnOnce() -> ProtocolError,
{
    match tokio::time::timeout(duration, fut).await {
        Ok(result) => result,
        Err(_) => Err(on_timeout()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_maps_to_custom_error() {
        let result: Result<()> = with_timeout_error(
            std::future::pending(),
            Duration::from_millis(10),
            || ProtocolError::Timeout { function_id: 7 },
        )
        .await;
        assert!(matches!(result, Err(ProtocolError::Timeout { function_id: 7 })));
    }

    #[tokio::test]
    async fn test_completed_future_passes_through() {
        let value = with_timeout_error(async { Ok(5u8) }, Duration::from_secs(1), || {
            ProtocolError::NotConnected
        })
        .await
        .unwrap();
        assert_eq!(value, 5);
    }
}

//! Per-attempt timeout

use std::future::Future;
use std::time::Duration;

use conflux_core::{Error, Result};

/// Run `call`, failing with [`Error::Timeout`] once `limit` elapses
pub async fn bounded<T, F>(target: &str, limit: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            target: target.to_string(),
            after_ms: limit.as_millis().min(u64::MAX as u128) as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_times_out() {
        let result: Result<()> = bounded("t", Duration::from_millis(50), async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        match result {
            Err(Error::Timeout { target, after_ms }) => {
                assert_eq!(target, "t");
                assert_eq!(after_ms, 50);
            }
            _ => panic!("Expected Timeout"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_passes_through() {
        let value = bounded("t", Duration::from_secs(1), async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);

        let err = bounded::<(), _>("t", Duration::from_secs(1), async {
            Err(Error::config("bad"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }
}

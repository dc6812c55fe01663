// ABOUTME: Timeout decorator for adapter operations.
// ABOUTME: Non-positive or non-finite timeouts pass the operation through untouched.

use crate::error::{AgentError, Result};
use std::future::Future;
use std::time::Duration;

/// Convert a millisecond setting into a timer duration.
///
/// Returns `None` for values that mean "no timeout": zero, negative, NaN or
/// infinite. Finite values too large for a `Duration` also get no timer.
pub fn timeout_duration(timeout_ms: f64) -> Option<Duration> {
    if !timeout_ms.is_finite() || timeout_ms <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64(timeout_ms / 1000.0).ok()
}

/// Race `operation` against a timer.
///
/// When no timer applies the operation's own outcome is returned as-is. When the
/// timer wins, the operation future is dropped so its eventual result is never
/// delivered.
pub async fn with_timeout<F, T>(operation: F, timeout_ms: f64) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match timeout_duration(timeout_ms) {
        None => operation.await,
        Some(limit) => match tokio::time::timeout(limit, operation).await {
            Ok(outcome) => outcome,
            Err(_) => Err(AgentError::Timeout(timeout_ms as u64)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_values() {
        assert_eq!(timeout_duration(0.0), None);
        assert_eq!(timeout_duration(-5.0), None);
        assert_eq!(timeout_duration(f64::NAN), None);
        assert_eq!(timeout_duration(f64::INFINITY), None);
        assert_eq!(timeout_duration(1500.0), Some(Duration::from_millis(1500)));
        assert_eq!(timeout_duration(1e30), None);
        assert_eq!(timeout_duration(f64::MAX), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_and_nan_pass_outcome_through() {
        for timeout in [0.0, f64::NAN] {
            let ok = with_timeout(async { Ok::<_, AgentError>(7) }, timeout).await;
            assert_eq!(ok.unwrap(), 7);

            let err = with_timeout(
                async { Err::<u8, _>(AgentError::Protocol("boom".into())) },
                timeout,
            )
            .await;
            assert!(matches!(err, Err(AgentError::Protocol(m)) if m == "boom"));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_timeout_never_fires() {
        let start = tokio::time::Instant::now();
        let slow = async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, AgentError>("done")
        };
        assert_eq!(with_timeout(slow, f64::NAN).await.unwrap(), "done");
        assert!(start.elapsed() >= Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_wins_over_slow_operation() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, AgentError>(())
        };
        let result = with_timeout(slow, 50.0).await;
        assert!(matches!(result, Err(AgentError::Timeout(50))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_operation_wins_over_timer() {
        let result = with_timeout(async { Ok::<_, AgentError>(1) }, 50.0).await;
        assert_eq!(result.unwrap(), 1);
    }
}

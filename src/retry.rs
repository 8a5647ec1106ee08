use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{GuardError, GuardResult};

/// Run `op` up to `attempts` times, sleeping a jittered, capped exponential
/// backoff between attempts. Only transient errors are retried; anything
/// else (precondition, ambiguous, fatal) propagates immediately.
pub async fn bounded<T, F, Fut>(
    what: &str,
    attempts: u32,
    base: Duration,
    cap: Duration,
    op: F,
) -> GuardResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = GuardResult<T>>,
{
    let mut delay = base;
    let mut last = None;
    for attempt in 1..=attempts.max(1) {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!("{what}: attempt {attempt}/{attempts} failed: {e}, retrying");
                tokio::time::sleep(jittered(delay)).await;
                delay = (delay * 2).min(cap);
                last = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| GuardError::Transient(format!("{what}: retries exhausted"))))
}

/// Delay plus up to 25% random jitter, so retrying callers don't align.
pub fn jittered(d: Duration) -> Duration {
    let extra = d.as_millis() as u64 / 4;
    if extra == 0 {
        return d;
    }
    d + Duration::from_millis(rand::rng().random_range(0..=extra))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let out = bounded(
            "test",
            5,
            Duration::from_millis(1),
            Duration::from_millis(4),
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(GuardError::Transient("flaky".into()))
                } else {
                    Ok(42)
                }
            },
        )
        .await;
        assert_eq!(out.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let out: GuardResult<()> = bounded(
            "test",
            5,
            Duration::from_millis(1),
            Duration::from_millis(4),
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(GuardError::Fatal("nope".into()))
            },
        )
        .await;
        assert!(matches!(out, Err(GuardError::Fatal(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_surfaces_the_last_error() {
        let out: GuardResult<()> = bounded(
            "test",
            3,
            Duration::from_millis(1),
            Duration::from_millis(2),
            || async { Err(GuardError::Transient("still down".into())) },
        )
        .await;
        match out {
            Err(GuardError::Transient(msg)) => assert!(msg.contains("still down")),
            other => panic!("unexpected: {other:?}"),
        }
    }
}

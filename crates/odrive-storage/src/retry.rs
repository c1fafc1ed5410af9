//! Exponential backoff with jitter for caller-level retries.

use std::future::Future;
use std::time::Duration;

use odrive_core::config::DrainConfig;

/// Backoff schedule: `initial * factor^(attempt-1)`, capped, plus up to 50% jitter.
#[derive(Debug, Clone)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: u32,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl Backoff {
    pub fn from_drain(cfg: &DrainConfig) -> Self {
        Self {
            initial: cfg.initial_backoff(),
            factor: cfg.factor.max(1),
            cap: cfg.max_backoff(),
            max_attempts: cfg.max_attempts.max(1),
        }
    }

    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32);
        let mult = (self.factor as u64).saturating_pow(exp);
        let ms = (self.initial.as_millis() as u64).saturating_mul(mult);
        Duration::from_millis(ms).min(self.cap)
    }

    /// `base_delay` plus random jitter, still capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let half = (base.as_millis() as u64 / 2).max(1);
        let jitter = rand::random::<u64>() % half;
        (base + Duration::from_millis(jitter)).min(self.cap)
    }
}

/// Retry `f` while `retryable` says so, sleeping per `backoff` between attempts.
///
/// Returns the last error once attempts run out, together with the number
/// of attempts made.
pub async fn retry<T, E, F, Fut>(
    backoff: &Backoff,
    op_name: &str,
    retryable: impl Fn(&E) -> bool,
    mut f: F,
) -> Result<(T, u32), (E, u32)>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match f(attempt).await {
            Ok(v) => return Ok((v, attempt)),
            Err(e) if retryable(&e) && attempt < backoff.max_attempts => {
                let delay = backoff.delay(attempt);
                tracing::warn!(
                    "{op_name}: transient error (attempt {attempt}/{}), retrying in {delay:?}: {e}",
                    backoff.max_attempts,
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err((e, attempt)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy() -> Backoff {
        Backoff {
            initial: Duration::from_secs(1),
            factor: 2,
            cap: Duration::from_secs(60),
            max_attempts: 10,
        }
    }

    #[test]
    fn schedule_doubles_and_caps() {
        let b = policy();
        assert_eq!(b.base_delay(1), Duration::from_secs(1));
        assert_eq!(b.base_delay(2), Duration::from_secs(2));
        assert_eq!(b.base_delay(6), Duration::from_secs(32));
        assert_eq!(b.base_delay(7), Duration::from_secs(60));
        assert_eq!(b.base_delay(40), Duration::from_secs(60));
        for a in 1..10 {
            let d = b.delay(a);
            assert!(d >= b.base_delay(a) && d <= b.cap);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let res: Result<(u32, u32), (String, u32)> = retry(&policy(), "op", |_| true, |_| async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err("boom".to_string())
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(res.unwrap(), (2, 3));
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_max_attempts() {
        let res: Result<((), u32), (String, u32)> =
            retry(&policy(), "op", |_| true, |_| async { Err("down".to_string()) }).await;
        assert_eq!(res.unwrap_err().1, 10);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let res: Result<((), u32), (String, u32)> =
            retry(&policy(), "op", |_| false, |_| async { Err("bad".to_string()) }).await;
        assert_eq!(res.unwrap_err().1, 1);
    }
}

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

/// Backoff for idempotent ledger reads.
///
/// The wait before retry `n` is `initial_backoff * 2^n`, capped at
/// `max_backoff` and spread by up to `jitter` of itself in either direction
/// so concurrent scans against one throttled node do not retry in lockstep.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total tries, the first one included.
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Fraction in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self, retry: u32) -> Duration {
        let backoff = self
            .initial_backoff
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_backoff);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return backoff;
        }
        backoff.mul_f64(rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter))
    }

    /// Run `op` until it succeeds, fails with an error `retryable` rejects, or
    /// the attempts are used up. The last error is returned.
    pub async fn retry_if<F, Fut, T, E, P>(&self, mut op: F, retryable: P) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt + 1 >= self.attempts || !retryable(&err) => return Err(err),
                Err(err) => {
                    let delay = self.backoff(attempt);
                    attempt += 1;
                    debug!(attempt, ?delay, "ledger read failed, retrying: {err}");
                    sleep(delay).await;
                }
            }
        }
    }
}

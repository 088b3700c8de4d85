//! Exponential backoff with jitter for calls that may fail transiently.

use std::{future::Future, time::Duration};

use rand::Rng;
use tracing::{error, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (0 = unbounded)
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Scale each delay by a random factor in `0.5..1.5`
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }

    pub fn unbounded() -> Self {
        Self::with_max_attempts(0)
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            attempts: 0,
            delay: self.initial_delay,
            policy: self.clone(),
        }
    }
}

/// Yields the delay to sleep after each failed attempt, or `None` once the
/// attempt budget is spent.
#[derive(Clone, Debug)]
pub struct Backoff {
    attempts: u32,
    delay: Duration,
    policy: RetryPolicy,
}

impl Backoff {
    /// Number of failed attempts reported so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.attempts = self.attempts.saturating_add(1);
        if self.policy.max_attempts > 0 && self.attempts >= self.policy.max_attempts {
            return None;
        }

        let delay = self.delay;
        self.delay = delay
            .mul_f64(self.policy.multiplier.max(1.0))
            .min(self.policy.max_delay);

        if self.policy.jitter {
            let factor = ::rand::thread_rng().gen_range(0.5..1.5);
            Some(delay.mul_f64(factor))
        } else {
            Some(delay)
        }
    }
}

pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: ::core::fmt::Display,
{
    let mut backoff = policy.backoff();
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => match backoff.next() {
                Some(delay) => {
                    warn!(
                        operation = %operation_name,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis(),
                        "operation failed, retrying: {e}"
                    );
                    ::tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        operation = %operation_name,
                        attempt = backoff.attempts(),
                        "operation failed after max retries: {e}"
                    );
                    return Err(e);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fixed(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            jitter: false,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let delays: Vec<_> = fixed(6).backoff().collect();
        assert_eq!(
            delays,
            [10, 20, 40, 40, 40].map(Duration::from_millis).to_vec(),
        );
    }

    #[test]
    fn backoff_counts_attempts() {
        let mut backoff = fixed(3).backoff();
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_some());
        assert!(backoff.next().is_none());
        assert_eq!(backoff.attempts(), 3);
    }

    #[test]
    fn jitter_stays_in_range() {
        let policy = RetryPolicy {
            jitter: true,
            ..fixed(0)
        };
        for delay in policy.backoff().take(64) {
            assert!(delay >= Duration::from_millis(5));
            assert!(delay < Duration::from_millis(60));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_stops_on_success() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fixed(5), "flaky", || async {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 | 1 => Err("not yet"),
                n => Ok(n),
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_returns_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(&fixed(4), "broken", || async {
            Err(calls.fetch_add(1, Ordering::SeqCst))
        })
        .await;

        assert_eq!(result, Err(3));
    }
}

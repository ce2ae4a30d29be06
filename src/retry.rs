//! Bounded polling used by dialers that come up asynchronously.

use std::future::Future;
use std::time::Duration;
use tokio::time::{self, Instant};

/// Outcome of one polling attempt.
#[derive(Debug)]
pub enum Attempt<T, E> {
    /// The resource is ready.
    Ready(T),
    /// Not ready yet, try again after the interval.
    Pending,
    /// Stop polling, it will never become ready.
    Abort(E),
}

/// Why polling stopped without a result.
#[derive(Debug, PartialEq, Eq)]
pub enum PollError<E> {
    TimedOut,
    Aborted(E),
}

/// Capped retry loop: one attempt every `interval` until `timeout` elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
            timeout: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Same interval, but never waiting longer than `limit`.
    pub fn capped(&self, limit: Duration) -> Self {
        Self {
            interval: self.interval,
            timeout: self.timeout.min(limit),
        }
    }

    /// Run `attempt` until it is ready, aborts, or the policy timeout elapses.
    /// A single slow attempt is cut off at the deadline as well.
    pub async fn poll_until<T, E, F, Fut>(&self, mut attempt: F) -> Result<T, PollError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let deadline = Instant::now() + self.timeout;
        loop {
            match time::timeout_at(deadline, attempt()).await {
                Ok(Attempt::Ready(value)) => return Ok(value),
                Ok(Attempt::Abort(err)) => return Err(PollError::Aborted(err)),
                Ok(Attempt::Pending) => {}
                Err(_) => return Err(PollError::TimedOut),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PollError::TimedOut);
            }
            time::sleep_until((now + self.interval).min(deadline)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn ready_after_a_few_attempts() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(5));
        let result: Result<usize, PollError<()>> = policy
            .poll_until(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n == 3 {
                        Attempt::Ready(n)
                    } else {
                        Attempt::Pending
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_within_bound() {
        let policy = RetryPolicy::new(Duration::from_millis(500), Duration::from_secs(2));
        let start = Instant::now();
        let result: Result<(), PollError<()>> =
            policy.poll_until(|| async { Attempt::Pending }).await;
        assert_eq!(result, Err(PollError::TimedOut));
        assert!(start.elapsed() <= Duration::from_secs(2) + Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn hung_attempt_is_cut_off() {
        let policy = RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1));
        let result: Result<(), PollError<()>> = policy
            .poll_until(|| async {
                std::future::pending::<()>().await;
                Attempt::Pending
            })
            .await;
        assert_eq!(result, Err(PollError::TimedOut));
    }

    #[tokio::test]
    async fn abort_stops_immediately() {
        let policy = RetryPolicy::default();
        let result: Result<(), PollError<&str>> =
            policy.poll_until(|| async { Attempt::Abort("engine exited") }).await;
        assert_eq!(result, Err(PollError::Aborted("engine exited")));
    }
}

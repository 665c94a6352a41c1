use std::future::Future;
use std::time::Duration;

use anyhow::Result;

/// Explicit retry schedule: one delay per retry, in order.
///
/// `schedule.len() + 1` attempts at most. Failures that `is_retryable`
/// rejects are returned immediately.
#[derive(Clone)]
pub struct RetryPolicy {
    pub schedule: Vec<Duration>,
    pub is_retryable: fn(&anyhow::Error) -> bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("schedule", &self.schedule)
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(schedule: Vec<Duration>, is_retryable: fn(&anyhow::Error) -> bool) -> Self {
        Self {
            schedule,
            is_retryable,
        }
    }

    /// Single attempt.
    pub fn none() -> Self {
        Self::new(Vec::new(), |_| false)
    }

    pub fn max_attempts(&self) -> usize {
        self.schedule.len() + 1
    }

    pub fn total_delay(&self) -> Duration {
        self.schedule.iter().sum()
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0usize;
        loop {
            attempt += 1;
            let err = match op().await {
                Ok(v) => return Ok(v),
                Err(e) => e,
            };
            if !(self.is_retryable)(&err) {
                tracing::debug!("[retry] {} failed with non-retryable error: {}", label, err);
                return Err(err);
            }
            let Some(delay) = self.schedule.get(attempt - 1).copied() else {
                tracing::warn!(
                    "[retry] {} giving up after {} attempt(s): {}",
                    label,
                    attempt,
                    err
                );
                return Err(err.context(format!("{} failed after {} attempts", label, attempt)));
            };
            tracing::info!(
                "[retry] {} attempt {}/{} failed ({}), retrying in {}s",
                label,
                attempt,
                self.max_attempts(),
                err,
                delay.as_secs()
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn schedule() -> Vec<Duration> {
        [5, 5, 10, 10, 15, 15]
            .into_iter()
            .map(Duration::from_secs)
            .collect()
    }

    fn retry_everything(_: &anyhow::Error) -> bool {
        true
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_schedule_with_cumulative_wait() {
        let policy = RetryPolicy::new(schedule(), retry_everything);
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let res: Result<()> = policy
            .run("flaky", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("connection refused"))
            })
            .await;

        assert!(res.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 7);
        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(policy.total_delay(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_stops_after_one_attempt() {
        let policy = RetryPolicy::new(schedule(), |_| false);
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let res: Result<()> = policy
            .run("rejected", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("invalid params"))
            })
            .await;

        assert_eq!(res.unwrap_err().to_string(), "invalid params");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_two_failures_waits_first_two_delays() {
        let policy = RetryPolicy::new(schedule(), retry_everything);
        let calls = AtomicUsize::new(0);
        let started = Instant::now();

        let res = policy
            .run("eventually", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(anyhow::anyhow!("503"))
                } else {
                    Ok(n)
                }
            })
            .await
            .unwrap();

        assert_eq!(res, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(10));
    }
}

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};

use crate::error::SessionError;

/// Bounded retry budget: at most `max_calls` attempts inside any rolling
/// `window`, with capped exponential backoff between consecutive failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_calls: u32,
    pub window: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Budget for one-shot requests such as seeks and challenges.
    pub const fn requests() -> Self {
        Self {
            max_calls: 3,
            window: Duration::from_secs(10),
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
        }
    }

    /// Budget for long-lived event streams.
    pub const fn streams() -> Self {
        Self {
            max_calls: 10,
            window: Duration::from_secs(15),
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(3),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::requests()
    }
}

#[derive(Debug)]
pub struct RetryBudget {
    policy: RetryPolicy,
    attempts: VecDeque<Instant>,
    consecutive_failures: u32,
    total_attempts: u32,
}

impl RetryBudget {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempts: VecDeque::new(),
            consecutive_failures: 0,
            total_attempts: 0,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.total_attempts
    }

    /// Whether another attempt at `at` would stay inside the budget.
    pub fn has_capacity(&mut self, at: Instant) -> bool {
        while let Some(oldest) = self.attempts.front() {
            if at.saturating_duration_since(*oldest) >= self.policy.window {
                self.attempts.pop_front();
            } else {
                break;
            }
        }
        (self.attempts.len() as u32) < self.policy.max_calls
    }

    /// Record an attempt at `at`. Returns `false` without recording when the
    /// budget is spent.
    pub fn try_acquire(&mut self, at: Instant) -> bool {
        if !self.has_capacity(at) {
            return false;
        }
        self.attempts.push_back(at);
        self.total_attempts += 1;
        true
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
    }

    pub fn reset_backoff(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn next_backoff(&self) -> Duration {
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        self.policy
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_backoff)
    }
}

/// Run `op` until it succeeds, fails with a non-retriable error, or the
/// budget runs out. An attempt that ran longer than the window counts as a
/// fresh start for backoff purposes, which suits stream readers that fail
/// after a long healthy stretch.
pub async fn retry<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let mut budget = RetryBudget::new(policy);
    if !budget.try_acquire(Instant::now()) {
        return Err(SessionError::RetriesExhausted {
            attempts: 0,
            last: Box::new(SessionError::connection(format!("{operation}: empty retry budget"))),
        });
    }

    loop {
        let started = Instant::now();
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retriable() => return Err(err),
            Err(err) => err,
        };

        if started.elapsed() >= policy.window {
            budget.reset_backoff();
        }
        budget.record_failure();
        let backoff = budget.next_backoff();
        let next_attempt = Instant::now() + backoff;
        if !budget.try_acquire(next_attempt) {
            tracing::error!(
                operation,
                attempts = budget.total_attempts(),
                error = %err,
                "retry budget exhausted"
            );
            return Err(SessionError::RetriesExhausted {
                attempts: budget.total_attempts(),
                last: Box::new(err),
            });
        }

        tracing::warn!(
            operation,
            attempt = budget.total_attempts(),
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "retrying after failure"
        );
        sleep(backoff).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_calls: u32) -> RetryPolicy {
        RetryPolicy {
            max_calls,
            window: Duration::from_secs(15),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry(fast_policy(5), "flaky", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(SessionError::connection("reset"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_once_the_budget_is_spent() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry(fast_policy(10), "down", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(SessionError::connection("refused")) }
        })
        .await;

        match result {
            Err(SessionError::RetriesExhausted { attempts, last }) => {
                assert_eq!(attempts, 10);
                assert!(last.is_retriable());
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn semantic_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry(fast_policy(10), "auth", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async {
                Err(SessionError::Authentication {
                    reason: "bad token".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(SessionError::Authentication { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn budget_rolls_with_the_window() {
        let policy = RetryPolicy {
            max_calls: 2,
            window: Duration::from_secs(10),
            ..RetryPolicy::streams()
        };
        let mut budget = RetryBudget::new(policy);
        let t0 = Instant::now();

        assert!(budget.try_acquire(t0));
        assert!(budget.try_acquire(t0 + Duration::from_secs(1)));
        assert!(!budget.try_acquire(t0 + Duration::from_secs(5)));
        assert!(budget.try_acquire(t0 + Duration::from_secs(10)));
        assert!(!budget.try_acquire(t0 + Duration::from_secs(10)));
        assert_eq!(budget.total_attempts(), 3);
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let mut budget = RetryBudget::new(fast_policy(10));
        let observed: Vec<u64> = (0..6)
            .map(|_| {
                budget.record_failure();
                budget.next_backoff().as_millis() as u64
            })
            .collect();
        assert_eq!(observed, vec![100, 200, 400, 800, 1000, 1000]);

        budget.reset_backoff();
        budget.record_failure();
        assert_eq!(budget.next_backoff(), Duration::from_millis(100));
    }
}

//! Categorized retry with exponential backoff
//!
//! Every external call is tagged with a `CallCost`. The cost sets both the
//! timeout of a single attempt and how long the whole retry loop may run.
//!
//! Database work goes through `retry_db` instead. An attempt runs on the
//! blocking pool and cannot be abandoned part way, so it gets no attempt
//! timeout; lock waits are bounded by the SQLite busy timeout.

use crate::error::{AppError, Result};
use crate::services::scope::RunScope;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

const INITIAL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_INTERVAL: Duration = Duration::from_secs(60);
const MULTIPLIER: f64 = 2.0;
const JITTER: f64 = 0.2;

/// Expected duration class of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallCost {
    /// Single fetch or single-row update
    Short,
    /// Listing or multi-row stage
    Medium,
    /// Full aggregate maintenance
    Long,
}

impl CallCost {
    /// Per-attempt timeout, which is also the retry ceiling
    pub fn timeout(self) -> Duration {
        match self {
            CallCost::Short => Duration::from_secs(30),
            CallCost::Medium => Duration::from_secs(5 * 60),
            CallCost::Long => Duration::from_secs(12 * 60 * 60),
        }
    }

    pub fn max_elapsed(self) -> Duration {
        self.timeout()
    }
}

/// Backoff schedule: 1s doubling to a 60s cap, each delay jittered by ±20%
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            current: INITIAL_INTERVAL,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base.mul_f64(MULTIPLIER).min(MAX_INTERVAL);

        let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
        base.mul_f64(factor)
    }
}

/// Run `op` until it succeeds, fails permanently, exhausts the cost's
/// ceiling, or the scope is cancelled.
pub async fn retry<T, F, Fut>(scope: &RunScope, cost: CallCost, what: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(scope, cost, what, Some(cost.timeout()), op).await
}

/// `retry` for blocking database work: the ceiling still applies, but each
/// attempt runs to completion before the next one starts.
pub async fn retry_db<T, F, Fut>(scope: &RunScope, cost: CallCost, what: &str, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    retry_with(scope, cost, what, None, op).await
}

async fn retry_with<T, F, Fut>(
    scope: &RunScope,
    cost: CallCost,
    what: &str,
    attempt_timeout: Option<Duration>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut backoff = Backoff::default();

    loop {
        if scope.is_cancelled() {
            return Err(AppError::Cancelled(what.to_string()));
        }

        let attempt = match attempt_timeout {
            Some(limit) => tokio::select! {
                res = tokio::time::timeout(limit, op()) => match res {
                    Ok(res) => res,
                    Err(_) => Err(AppError::Timeout(format!("{} exceeded {:?}", what, limit))),
                },
                _ = scope.cancelled() => return Err(AppError::Cancelled(what.to_string())),
            },
            None => op().await,
        };

        let err = match attempt {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        let delay = backoff.next_delay();
        let elapsed = started.elapsed();
        if elapsed + delay > cost.max_elapsed() {
            return Err(AppError::BackoffExceeded {
                elapsed_secs: elapsed.as_secs(),
                last: Box::new(err),
            });
        }

        if err.is_rate_limited() {
            tracing::debug!("{}: rate limited, retrying in {:?}", what, delay);
        } else {
            tracing::warn!("{}: {}, retrying in {:?}", what, err, delay);
        }

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = scope.cancelled() => return Err(AppError::Cancelled(what.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut backoff = Backoff::default();
        let delays: Vec<Duration> = (0..10).map(|_| backoff.next_delay()).collect();

        assert!(delays[0] >= Duration::from_millis(800) && delays[0] <= Duration::from_millis(1200));
        assert!(delays[1] >= Duration::from_millis(1600) && delays[1] <= Duration::from_millis(2400));
        for d in &delays[7..] {
            assert!(*d <= Duration::from_secs(72));
            assert!(*d >= Duration::from_secs(48));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_is_retried() {
        let scope = RunScope::new();
        let calls = Arc::new(AtomicU32::new(0));

        let value = retry(&scope, CallCost::Short, "candles AAPL", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(AppError::RateLimited("429".into()))
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let scope = RunScope::new();
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<()> = retry(&scope, CallCost::Short, "profile", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(AppError::Upstream {
                    status: 403,
                    message: "forbidden".into(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Upstream { status: 403, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ceiling_stops_retries() {
        let scope = RunScope::new();
        let started = Instant::now();

        let result: Result<()> = retry(&scope, CallCost::Short, "stocks", || async {
            Err(AppError::Upstream {
                status: 503,
                message: "unavailable".into(),
            })
        })
        .await;

        match result {
            Err(AppError::BackoffExceeded { last, .. }) => {
                assert!(matches!(*last, AppError::Upstream { status: 503, .. }));
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(started.elapsed() <= CallCost::Short.max_elapsed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_is_transient() {
        let scope = RunScope::new();
        let calls = Arc::new(AtomicU32::new(0));

        let value = retry(&scope, CallCost::Short, "slow", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(31)).await;
                }
                Ok("done")
            }
        })
        .await;

        // The first attempt burns the whole ceiling
        assert!(matches!(value, Err(AppError::BackoffExceeded { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_db_attempt_is_not_timed_out() {
        let scope = RunScope::new();
        let calls = Arc::new(AtomicU32::new(0));

        let value = retry_db(&scope, CallCost::Short, "stage candles", || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(45)).await;
                Ok(3)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_db_busy_is_retried() {
        let scope = RunScope::new();
        let calls = Arc::new(AtomicU32::new(0));

        let value = retry_db(&scope, CallCost::Medium, "stage stocks", || {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(AppError::Database(rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
                        None,
                    )));
                }
                Ok("staged")
            }
        })
        .await
        .unwrap();

        assert_eq!(value, "staged");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_retrying() {
        let scope = RunScope::new();
        let canceller = scope.clone();

        let result: Result<()> = retry(&scope, CallCost::Long, "candles", || {
            let canceller = canceller.clone();
            async move {
                canceller.cancel();
                Err(AppError::RateLimited("429".into()))
            }
        })
        .await;

        assert!(matches!(result, Err(AppError::Cancelled(_))));
    }
}

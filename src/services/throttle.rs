//! Outbound request pacing
//!
//! One clock for the whole run. Every call to the market data source waits
//! for the next tick, so concurrent workers share the vendor's request
//! budget instead of each spending their own.

use crate::error::{AppError, Result};
use crate::services::scope::RunScope;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

#[derive(Debug)]
pub struct Throttle {
    period: Duration,
    ticker: Mutex<Interval>,
}

impl Throttle {
    /// A throttle releasing one caller per `period`. The first tick is immediate.
    pub fn new(period: Duration) -> Self {
        let mut ticker = interval(period);
        // After a stall, keep spacing calls by `period` rather than bursting
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            period,
            ticker: Mutex::new(ticker),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick, or fail with `Cancelled` if the scope ends first
    pub async fn tick(&self, scope: &RunScope) -> Result<()> {
        if scope.is_cancelled() {
            return Err(AppError::Cancelled("throttle".into()));
        }

        tokio::select! {
            _ = async {
                let mut ticker = self.ticker.lock().await;
                ticker.tick().await;
            } => Ok(()),
            _ = scope.cancelled() => Err(AppError::Cancelled("throttle".into())),
        }
    }
}

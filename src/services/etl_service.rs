//! ETL Service
//!
//! Runs one job: discover stocks, then fetch candles and company profiles
//! concurrently, land every response, stage it, and maintain the 52-week
//! aggregates. The job run is marked successful only if every stage
//! completed.

use crate::config::Config;
use crate::db::sqlite::job_run::FINNHUB_ETL;
use crate::db::sqlite::models::{EntityKind, LatestCandles, StagingInfo};
use crate::db::SqliteDb;
use crate::error::{AppError, Result};
use crate::payload::Payload;
use crate::services::retry::{retry, retry_db, CallCost};
use crate::services::scope::RunScope;
use crate::services::throttle::Throttle;
use crate::sources::types::{CandlesRequest, CandlesResponse};
use crate::sources::MarketDataSource;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Per-stage counts of one run
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub job_run_id: i64,
    pub stocks_fetched: usize,
    pub stocks: StagingInfo,
    pub candle_requests: usize,
    /// Symbols whose watermark already covers the window
    pub candles_up_to_date: usize,
    pub candle_failures: usize,
    pub candles: StagingInfo,
    pub candles_52wk: StagingInfo,
    pub profiles_fetched: usize,
    pub profiles_skipped: usize,
    pub profile_failures: usize,
    pub profiles: StagingInfo,
}

/// ETL service for one source and database
pub struct EtlService {
    config: Arc<Config>,
    db: Arc<SqliteDb>,
    source: Arc<dyn MarketDataSource>,
    throttle: Arc<Throttle>,
}

impl EtlService {
    pub fn new(config: Arc<Config>, db: Arc<SqliteDb>, source: Arc<dyn MarketDataSource>) -> Self {
        let throttle = Arc::new(Throttle::new(config.request_interval()));
        Self {
            config,
            db,
            source,
            throttle,
        }
    }

    /// Run the whole job and record its outcome.
    ///
    /// Returns the run's summary on success. On failure the run is marked
    /// failed and the error that caused it is returned.
    pub async fn run(&self) -> Result<RunSummary> {
        let run = self.blocking(|db| db.start_job(FINNHUB_ETL)).await?;
        let job_run_id = run.id;
        info!(
            "EtlService::run - job run {} from {} ({} {})",
            job_run_id,
            self.source.id(),
            self.config.exchange,
            self.config.resolution
        );

        let scope = RunScope::new();
        let summary = Mutex::new(RunSummary {
            job_run_id,
            ..Default::default()
        });

        let outcome = self.run_job(job_run_id, &scope, &summary).await;
        if let Err(e) = &outcome {
            scope.cancel();
            error!("Job run {} failed: {}", job_run_id, e);
        }

        let success = outcome.is_ok();
        self.blocking(move |db| db.finish_job(job_run_id, success))
            .await?;

        let summary = summary.into_inner();
        info!("Job run {} finished (success: {}): {:?}", job_run_id, success, summary);
        outcome.map(|_| summary)
    }

    async fn run_job(
        &self,
        job_run_id: i64,
        scope: &RunScope,
        summary: &Mutex<RunSummary>,
    ) -> Result<()> {
        if self.config.purge_raw_on_start {
            let purged = self
                .blocking(move |db| db.purge_raw_before(job_run_id))
                .await?;
            info!("Purged {} landing rows of earlier runs", purged);
        }

        let tz = self.config.timezone;
        let latest = self.blocking(move |db| db.latest_candles(&tz)).await?;

        let symbols = self.stocks_worker(job_run_id, scope, summary).await?;
        let symbols = self.select(symbols);
        info!("Processing {} symbols", symbols.len());

        tokio::try_join!(
            cancel_on_error(
                scope,
                self.candles_worker(job_run_id, &symbols, &latest, scope, summary)
            ),
            cancel_on_error(
                scope,
                self.profiles_worker(job_run_id, &symbols, scope, summary)
            ),
        )?;

        Ok(())
    }

    // ========== Workers ==========

    /// Fetch, land and stage the exchange's listings. Returns the symbols.
    async fn stocks_worker(
        &self,
        job_run_id: i64,
        scope: &RunScope,
        summary: &Mutex<RunSummary>,
    ) -> Result<Vec<String>> {
        let exchange = self.config.exchange.as_str();
        let stocks = retry(scope, CallCost::Medium, "stocks", || async {
            self.throttle.tick(scope).await?;
            self.source.stocks(exchange).await
        })
        .await?;

        let (stocks, empty): (Vec<_>, Vec<_>) = stocks
            .into_iter()
            .partition(|s| !s.symbol.trim().is_empty());
        if !empty.is_empty() {
            debug!("Skipping {} listings without a symbol", empty.len());
        }

        let symbols: Vec<String> = stocks.iter().map(|s| s.symbol.clone()).collect();
        summary.lock().stocks_fetched = stocks.len();

        self.blocking(move |db| {
            for stock in stocks {
                let symbol = stock.symbol.clone();
                db.land(EntityKind::Stock, job_run_id, &symbol, &Payload::Stock(stock))?;
            }
            Ok(())
        })
        .await?;

        let staged = retry_db(scope, CallCost::Medium, "stage stocks", || {
            self.blocking(move |db| db.stage_stocks(job_run_id))
        })
        .await?;
        info!(
            "Staged stocks: {} considered, {} modified",
            staged.rows_staged, staged.rows_modified
        );
        summary.lock().stocks = staged;

        Ok(symbols)
    }

    /// Fetch each symbol's candles since its watermark, land and stage them,
    /// then maintain the aggregates of every symbol that changed.
    async fn candles_worker(
        &self,
        job_run_id: i64,
        symbols: &[String],
        latest: &LatestCandles,
        scope: &RunScope,
        summary: &Mutex<RunSummary>,
    ) -> Result<()> {
        let tz = self.config.timezone;
        let now = Utc::now();

        for symbol in symbols {
            let Some((from, to)) = extraction_window(&self.config, latest.get(symbol), now) else {
                debug!("Candles for {} are up to date", symbol);
                summary.lock().candles_up_to_date += 1;
                continue;
            };
            let request = CandlesRequest {
                symbol: symbol.clone(),
                resolution: self.config.resolution.clone(),
                from: from.with_timezone(&Utc),
                to: to.with_timezone(&Utc),
            };

            let what = format!("candles {}", symbol);
            let response = match retry(scope, CallCost::Medium, &what, || async {
                self.throttle.tick(scope).await?;
                self.source.candles(&request).await
            })
            .await
            {
                Ok(response) => response,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Skipping candles for {}: {}", symbol, e);
                    summary.lock().candle_failures += 1;
                    continue;
                }
            };

            let owned = symbol.clone();
            let payload = Payload::Candles(CandlesResponse { request, response });
            self.blocking(move |db| db.land(EntityKind::Candle, job_run_id, &owned, &payload))
                .await?;

            let staged = retry_db(scope, CallCost::Medium, &format!("stage {}", what), || {
                let symbol = symbol.clone();
                self.blocking(move |db| db.stage_candles(job_run_id, Some(symbol.as_str()), &tz))
            })
            .await?;
            debug!(
                "Staged candles {}: {} considered, {} modified",
                symbol, staged.rows_staged, staged.rows_modified
            );

            let mut s = summary.lock();
            s.candle_requests += 1;
            s.candles += staged;
        }

        let aggregated = retry_db(scope, CallCost::Long, "stage candles 52wk", || {
            self.blocking(move |db| db.stage_all_candles_52wk(job_run_id))
        })
        .await?;
        summary.lock().candles_52wk = aggregated;

        let s = summary.lock();
        info!(
            "Staged candles: {} considered, {} modified; {} aggregates modified",
            s.candles.rows_staged, s.candles.rows_modified, aggregated.rows_modified
        );
        Ok(())
    }

    /// Fetch, land and stage each symbol's company profile
    async fn profiles_worker(
        &self,
        job_run_id: i64,
        symbols: &[String],
        scope: &RunScope,
        summary: &Mutex<RunSummary>,
    ) -> Result<()> {
        for symbol in symbols {
            let what = format!("profile {}", symbol);
            let profile = match retry(scope, CallCost::Medium, &what, || async {
                self.throttle.tick(scope).await?;
                self.source.company_profile(symbol).await
            })
            .await
            {
                Ok(profile) => profile,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Skipping profile for {}: {}", symbol, e);
                    summary.lock().profile_failures += 1;
                    continue;
                }
            };

            summary.lock().profiles_fetched += 1;

            if profile.ticker.trim().is_empty() {
                debug!("Skipping profile for {}: empty ticker", symbol);
                summary.lock().profiles_skipped += 1;
                continue;
            }

            let owned = symbol.clone();
            self.blocking(move |db| {
                db.land(
                    EntityKind::CompanyProfile,
                    job_run_id,
                    &owned,
                    &Payload::CompanyProfile(profile),
                )
            })
            .await?;
        }

        let staged = retry_db(scope, CallCost::Medium, "stage profiles", || {
            self.blocking(move |db| db.stage_company_profiles(job_run_id))
        })
        .await?;
        info!(
            "Staged company profiles: {} considered, {} modified",
            staged.rows_staged, staged.rows_modified
        );
        summary.lock().profiles = staged;

        Ok(())
    }

    // ========== Helpers ==========

    /// Apply the configured skip and limit to the symbol list
    fn select(&self, symbols: Vec<String>) -> Vec<String> {
        let limit = match self.config.limit {
            0 => usize::MAX,
            n => n,
        };
        symbols
            .into_iter()
            .skip(self.config.skip)
            .take(limit)
            .collect()
    }

    /// Run blocking database work off the async workers
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&SqliteDb) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(db.as_ref()))
            .await
            .map_err(|e| AppError::Internal(format!("Database task failed: {}", e)))?
    }
}

async fn cancel_on_error<F>(scope: &RunScope, worker: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    let result = worker.await;
    if result.is_err() {
        scope.cancel();
    }
    result
}

/// Candle window for one symbol, in the configured zone.
///
/// The end is the configured end date, or yesterday's midnight. The start
/// is the configured start date, else one second past the symbol's
/// watermark, else `initial_lookback_days` before the end. Reversed
/// configured dates are swapped. `None` means the watermark already
/// reaches the end and there is nothing to fetch.
pub fn extraction_window(
    config: &Config,
    latest: Option<&DateTime<Tz>>,
    now: DateTime<Utc>,
) -> Option<(DateTime<Tz>, DateTime<Tz>)> {
    let tz = config.timezone;

    let end = match config.end_date {
        Some(date) => midnight(&tz, date),
        None => {
            let today = now.with_timezone(&tz).date_naive();
            midnight(&tz, today - Duration::days(1))
        }
    };

    let start = match (config.start_date, latest) {
        (Some(date), _) => midnight(&tz, date),
        (None, Some(latest)) => {
            let start = *latest + Duration::seconds(1);
            if start > end {
                return None;
            }
            start
        }
        (None, None) => end - Duration::days(config.initial_lookback_days),
    };

    if end < start {
        Some((end, start))
    } else {
        Some((start, end))
    }
}

fn midnight(tz: &Tz, date: NaiveDate) -> DateTime<Tz> {
    let local = date.and_time(NaiveTime::MIN);
    tz.from_local_datetime(&local)
        .earliest()
        .unwrap_or_else(|| tz.from_utc_datetime(&local))
}

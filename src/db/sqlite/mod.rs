//! SQLite database module

pub mod candles_52wk;
pub mod job_run;
mod migrations;
pub mod models;
pub mod raw;
pub mod stage;
pub mod tx;
pub mod watermark;

use crate::config::PoolConfig;
use crate::error::Result;
use crate::payload::Payload;
use chrono_tz::Tz;
use models::*;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use std::path::Path;
use std::time::Duration;

pub use migrations::run_migrations;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);
const LANDING_ATTEMPTS: u32 = 3;

pub type Conn = PooledConnection<SqliteConnectionManager>;

/// Pooled SQLite database
///
/// Every method checks out its own connection and blocks; async callers
/// run them on `tokio::task::spawn_blocking`.
pub struct SqliteDb {
    pool: Pool<SqliteConnectionManager>,
    keep_alive: Duration,
}

impl SqliteDb {
    /// Open (or create) the database file and run migrations
    pub fn open(path: &Path, config: &PoolConfig) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.busy_timeout(BUSY_TIMEOUT)?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
        });

        let pool = Pool::builder()
            .max_size(config.max_conns)
            .min_idle(Some(config.min_conns))
            .max_lifetime(Some(config.max_lifetime()))
            .idle_timeout(Some(config.idle_timeout()))
            .test_on_check_out(true)
            .build(manager)?;

        let db = Self {
            pool,
            keep_alive: config.health_check_period(),
        };
        db.run_migrations()?;

        tracing::info!("Opened database {}", path.display());
        Ok(db)
    }

    /// Check out a connection
    pub fn conn(&self) -> Result<Conn> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        migrations::run_migrations(&conn)
    }

    // ========== Job Run Methods ==========

    /// Open a run of the named job definition
    pub fn start_job(&self, definition_name: &str) -> Result<JobRun> {
        let conn = self.conn()?;
        job_run::start_job(&conn, definition_name)
    }

    /// Record a run's outcome
    pub fn finish_job(&self, job_run_id: i64, success: bool) -> Result<()> {
        let conn = self.conn()?;
        job_run::finish_job(&conn, job_run_id, success)
    }

    pub fn get_job_run(&self, job_run_id: i64) -> Result<JobRun> {
        let conn = self.conn()?;
        job_run::get_job_run(&conn, job_run_id)
    }

    /// Latest successfully staged candle per symbol
    pub fn latest_candles(&self, tz: &Tz) -> Result<LatestCandles> {
        let conn = self.conn()?;
        watermark::latest_candles(&conn, tz)
    }

    // ========== Landing Methods ==========

    /// Land one payload, retrying transient failures inside a savepoint
    pub fn land(
        &self,
        kind: EntityKind,
        job_run_id: i64,
        symbol: &str,
        payload: &Payload,
    ) -> Result<i64> {
        let conn = self.conn()?;
        tx::with_savepoint(&conn, "land", LANDING_ATTEMPTS, |c| {
            raw::insert_raw(c, kind, job_run_id, symbol, payload)
        })
    }

    /// Drop landing rows of runs before `job_run_id`
    pub fn purge_raw_before(&self, job_run_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        raw::purge_raw_before(&conn, job_run_id)
    }

    pub fn list_raw(
        &self,
        kind: EntityKind,
        job_run_id: i64,
        symbol: Option<&str>,
    ) -> Result<Vec<RawRow>> {
        let conn = self.conn()?;
        raw::list_raw(&conn, kind, job_run_id, symbol)
    }

    // ========== Staging Methods ==========

    pub fn stage_stocks(&self, job_run_id: i64) -> Result<StagingInfo> {
        let mut conn = self.conn()?;
        tx::run_tx(&mut conn, |tx| stage::stage_stocks(tx, job_run_id))
    }

    pub fn stage_candles(
        &self,
        job_run_id: i64,
        symbol: Option<&str>,
        tz: &Tz,
    ) -> Result<StagingInfo> {
        let mut conn = self.conn()?;
        tx::run_tx(&mut conn, |tx| stage::stage_candles(tx, job_run_id, symbol, tz))
    }

    pub fn stage_company_profiles(&self, job_run_id: i64) -> Result<StagingInfo> {
        let mut conn = self.conn()?;
        tx::run_tx(&mut conn, |tx| stage::stage_company_profiles(tx, job_run_id))
    }

    /// Stage everything landed since the entity's stage watermark
    pub fn stage_since_watermark(
        &self,
        kind: EntityKind,
        job_run_id: i64,
        tz: &Tz,
    ) -> Result<DeltaStagingInfo> {
        let mut conn = self.conn()?;
        tx::run_tx(&mut conn, |tx| {
            stage::stage_since_watermark(tx, kind, job_run_id, tz)
        })
    }

    // ========== 52-Week Aggregate Methods ==========

    pub fn stage_candles_52wk(&self, job_run_id: i64, symbol: &str) -> Result<StagingInfo> {
        let mut conn = self.conn()?;
        tx::run_tx(&mut conn, |tx| {
            candles_52wk::stage_candles_52wk(tx, job_run_id, symbol)
        })
    }

    /// Maintain the aggregates of every symbol the run touched
    pub fn stage_all_candles_52wk(&self, job_run_id: i64) -> Result<StagingInfo> {
        let mut conn = self.conn()?;
        candles_52wk::stage_all_candles_52wk(&mut conn, job_run_id, self.keep_alive)
    }

    pub fn get_candle_52wk(
        &self,
        symbol: &str,
        timestamp: i64,
        tz: &Tz,
    ) -> Result<Option<Candle52Wk>> {
        let conn = self.conn()?;
        candles_52wk::get_candle_52wk(&conn, symbol, timestamp, tz)
    }
}

//! Staging upserter
//!
//! Folds landing rows into the canonical `stage_*` tables. Every write is a
//! change-aware upsert: the `DO UPDATE` only fires when a tracked column
//! differs, so `changes()` is 1 for an insert or a real change and 0 for a
//! repeat. Unchanged rows keep their `modified` and `job_run_id`.

use crate::db::sqlite::models::{
    Candle, CompanyProfile, DeltaStagingInfo, EntityKind, RawRow, StageWatermark, StagingInfo,
    Stock,
};
use crate::db::sqlite::{raw, watermark};
use crate::error::{Result, TransformError};
use crate::payload::Payload;
use crate::transform;
use chrono_tz::Tz;
use rusqlite::{params, Connection};

const UPSERT_STOCK: &str = "
INSERT INTO stage_stocks (symbol, display_symbol, description, job_run_id)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(symbol) DO UPDATE SET
    display_symbol = excluded.display_symbol,
    description = excluded.description,
    job_run_id = excluded.job_run_id,
    modified = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
WHERE stage_stocks.display_symbol IS NOT excluded.display_symbol
   OR stage_stocks.description IS NOT excluded.description";

const UPSERT_CANDLE: &str = "
INSERT INTO stage_candles (symbol, timestamp, open, high, low, close, volume, job_run_id)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(symbol, timestamp) DO UPDATE SET
    open = excluded.open,
    high = excluded.high,
    low = excluded.low,
    close = excluded.close,
    volume = excluded.volume,
    job_run_id = excluded.job_run_id,
    modified = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
WHERE stage_candles.open IS NOT excluded.open
   OR stage_candles.high IS NOT excluded.high
   OR stage_candles.low IS NOT excluded.low
   OR stage_candles.close IS NOT excluded.close
   OR stage_candles.volume IS NOT excluded.volume";

const UPSERT_COMPANY_PROFILE: &str = "
INSERT INTO stage_company_profiles (
    symbol, country, currency, exchange, name, ticker, ipo,
    market_capitalization, shares_outstanding, logo, phone, web_url, industry, job_run_id
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
ON CONFLICT(symbol) DO UPDATE SET
    country = excluded.country,
    currency = excluded.currency,
    exchange = excluded.exchange,
    name = excluded.name,
    ticker = excluded.ticker,
    ipo = excluded.ipo,
    market_capitalization = excluded.market_capitalization,
    shares_outstanding = excluded.shares_outstanding,
    logo = excluded.logo,
    phone = excluded.phone,
    web_url = excluded.web_url,
    industry = excluded.industry,
    job_run_id = excluded.job_run_id,
    modified = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
WHERE stage_company_profiles.country IS NOT excluded.country
   OR stage_company_profiles.currency IS NOT excluded.currency
   OR stage_company_profiles.exchange IS NOT excluded.exchange
   OR stage_company_profiles.name IS NOT excluded.name
   OR stage_company_profiles.ticker IS NOT excluded.ticker
   OR stage_company_profiles.ipo IS NOT excluded.ipo
   OR stage_company_profiles.market_capitalization IS NOT excluded.market_capitalization
   OR stage_company_profiles.shares_outstanding IS NOT excluded.shares_outstanding
   OR stage_company_profiles.logo IS NOT excluded.logo
   OR stage_company_profiles.phone IS NOT excluded.phone
   OR stage_company_profiles.web_url IS NOT excluded.web_url
   OR stage_company_profiles.industry IS NOT excluded.industry";

// ========== Row Upserts ==========

/// Returns 1 if the row was inserted or changed, 0 otherwise
pub fn upsert_stock(conn: &Connection, job_run_id: i64, stock: &Stock) -> Result<usize> {
    Ok(conn.prepare_cached(UPSERT_STOCK)?.execute(params![
        stock.symbol,
        stock.display_symbol,
        stock.description,
        job_run_id,
    ])?)
}

pub fn upsert_candle(conn: &Connection, job_run_id: i64, candle: &Candle) -> Result<usize> {
    Ok(conn.prepare_cached(UPSERT_CANDLE)?.execute(params![
        candle.symbol,
        candle.timestamp.timestamp(),
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume,
        job_run_id,
    ])?)
}

pub fn upsert_company_profile(
    conn: &Connection,
    job_run_id: i64,
    profile: &CompanyProfile,
) -> Result<usize> {
    Ok(conn.prepare_cached(UPSERT_COMPANY_PROFILE)?.execute(params![
        profile.symbol,
        profile.country,
        profile.currency,
        profile.exchange,
        profile.name,
        profile.ticker,
        profile.ipo.map(|d| d.format("%Y-%m-%d").to_string()),
        profile.market_capitalization,
        profile.shares_outstanding,
        profile.logo,
        profile.phone,
        profile.web_url,
        profile.industry,
        job_run_id,
    ])?)
}

// ========== Run-Scoped Staging ==========

/// Stage the stock listings landed by a run
pub fn stage_stocks(conn: &Connection, job_run_id: i64) -> Result<StagingInfo> {
    stage_run(conn, EntityKind::Stock, job_run_id, None, &Tz::UTC)
}

/// Stage the candles landed by a run, optionally for a single symbol
pub fn stage_candles(
    conn: &Connection,
    job_run_id: i64,
    symbol: Option<&str>,
    tz: &Tz,
) -> Result<StagingInfo> {
    stage_run(conn, EntityKind::Candle, job_run_id, symbol, tz)
}

/// Stage the company profiles landed by a run
pub fn stage_company_profiles(conn: &Connection, job_run_id: i64) -> Result<StagingInfo> {
    stage_run(conn, EntityKind::CompanyProfile, job_run_id, None, &Tz::UTC)
}

fn stage_run(
    conn: &Connection,
    kind: EntityKind,
    job_run_id: i64,
    symbol: Option<&str>,
    tz: &Tz,
) -> Result<StagingInfo> {
    let mut info = StagingInfo::default();
    raw::for_each_raw(conn, kind, job_run_id, symbol, |row| {
        info += stage_row(conn, kind, job_run_id, &row, tz)?;
        Ok(())
    })?;

    tracing::debug!(
        "Staged {} {}: {} considered, {} modified",
        symbol.unwrap_or("all"),
        kind.name(),
        info.rows_staged,
        info.rows_modified
    );
    Ok(info)
}

// ========== Delta Staging ==========

/// Stage every landing row past the entity's stage watermark, whatever run
/// landed it, then advance the watermark.
///
/// The watermark is the last landing id folded in. Rows sharing a `created`
/// millisecond are told apart by id.
///
/// Changed rows are tagged with `job_run_id`.
pub fn stage_since_watermark(
    conn: &Connection,
    kind: EntityKind,
    job_run_id: i64,
    tz: &Tz,
) -> Result<DeltaStagingInfo> {
    let previous = watermark::stage_watermark(conn, kind)?;
    let mut latest: Option<StageWatermark> = None;
    let mut rows_affected = 0;

    raw::for_each_raw_since(conn, kind, previous.as_ref().map(|m| m.latest_id), |row| {
        rows_affected += stage_row(conn, kind, job_run_id, &row, tz)?.rows_modified;
        latest = Some(StageWatermark {
            latest_id: row.id,
            latest_modification: row.created,
        });
        Ok(())
    })?;

    if let Some(latest) = &latest {
        watermark::set_stage_watermark(conn, kind, latest)?;
    }

    tracing::debug!(
        "Delta staged {}: {} rows affected since {:?}",
        kind.name(),
        rows_affected,
        previous
    );

    Ok(DeltaStagingInfo {
        rows_affected,
        previous_latest_modification: previous.map(|m| m.latest_modification),
    })
}

// ========== Row Application ==========

/// Decode, validate and upsert one landing row.
///
/// Validation failures are logged and skipped; decode failures are errors.
fn stage_row(
    conn: &Connection,
    kind: EntityKind,
    job_run_id: i64,
    row: &RawRow,
    tz: &Tz,
) -> Result<StagingInfo> {
    let mut info = StagingInfo::default();

    match Payload::decode(&row.payload, kind)? {
        Payload::Stock(wire) => match transform::stock(wire) {
            Ok(stock) => {
                info.rows_staged += 1;
                info.rows_modified += upsert_stock(conn, job_run_id, &stock)? as i64;
            }
            Err(e) => skip(row, kind, &e),
        },
        Payload::Candles(wire) => match transform::candles(&row.symbol, &wire.response, tz) {
            Ok(candles) => {
                for candle in &candles {
                    info.rows_staged += 1;
                    info.rows_modified += upsert_candle(conn, job_run_id, candle)? as i64;
                }
            }
            Err(e) => skip(row, kind, &e),
        },
        Payload::CompanyProfile(wire) => match transform::company_profile(&row.symbol, wire) {
            Ok(profile) => {
                info.rows_staged += 1;
                info.rows_modified += upsert_company_profile(conn, job_run_id, &profile)? as i64;
            }
            Err(e) => skip(row, kind, &e),
        },
    }

    Ok(info)
}

fn skip(row: &RawRow, kind: EntityKind, err: &TransformError) {
    tracing::warn!(
        "Skipping {} landing row {} ({}): {}",
        kind.name(),
        row.id,
        row.symbol,
        err
    );
}

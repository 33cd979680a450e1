//! Trailing 52-week candle aggregates
//!
//! A candle's aggregate covers every candle of the same symbol in
//! `[timestamp - 52w, timestamp]`. When a run changes candle `T`, the rows
//! whose window contains `T` are those in `[T, T + 52w]`. The affected set is
//! taken over `T ± 52w` so rows missing an aggregate on the near side are
//! backfilled too; rows whose inputs did not change come out identical and
//! the change-aware upsert leaves them alone.
//!
//! Candles still tagged with a run that did not succeed count as changed as
//! well. A run that failed between staging candles and maintaining their
//! aggregates is repaired by the next run even if the re-fetched values are
//! identical.

use crate::db::sqlite::models::{Candle52Wk, StagingInfo, WindowStats};
use crate::db::sqlite::tx;
use crate::error::Result;
use chrono::TimeZone;
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::time::{Duration, Instant};

/// 52 weeks in seconds
pub const WINDOW_SECS: i64 = 52 * 7 * 24 * 60 * 60;

const CALC_AFFECTED: &str = "
SELECT DISTINCT a.timestamp
FROM stage_candles m
JOIN stage_candles a
  ON a.symbol = m.symbol
 AND a.timestamp BETWEEN m.timestamp - ?3 AND m.timestamp + ?3
WHERE m.symbol = ?1
  AND m.job_run_id IN (SELECT id FROM job_run WHERE id = ?2 OR success IS NOT 1)
ORDER BY a.timestamp";

const UPSERT_AGGREGATE: &str = "
INSERT INTO stage_candles_52wk (
    symbol, timestamp, open, high, low, close, volume,
    high_52wk_max, high_52wk_min, high_52wk_avg, high_52wk_count,
    low_52wk_max, low_52wk_min, low_52wk_avg, low_52wk_count,
    volume_52wk_max, volume_52wk_min, volume_52wk_avg, volume_52wk_count,
    timestamp_52wk_count, job_run_id
)
SELECT c.symbol, c.timestamp, c.open, c.high, c.low, c.close, c.volume,
       MAX(w.high), MIN(w.high), AVG(w.high), COUNT(w.high),
       MAX(w.low), MIN(w.low), AVG(w.low), COUNT(w.low),
       MAX(w.volume), MIN(w.volume), AVG(w.volume), COUNT(w.volume),
       COUNT(*), ?3
FROM stage_candles c
JOIN stage_candles w
  ON w.symbol = c.symbol
 AND w.timestamp BETWEEN c.timestamp - ?4 AND c.timestamp
WHERE c.symbol = ?1 AND c.timestamp = ?2
GROUP BY c.symbol, c.timestamp
ON CONFLICT(symbol, timestamp) DO UPDATE SET
    open = excluded.open,
    high = excluded.high,
    low = excluded.low,
    close = excluded.close,
    volume = excluded.volume,
    high_52wk_max = excluded.high_52wk_max,
    high_52wk_min = excluded.high_52wk_min,
    high_52wk_avg = excluded.high_52wk_avg,
    high_52wk_count = excluded.high_52wk_count,
    low_52wk_max = excluded.low_52wk_max,
    low_52wk_min = excluded.low_52wk_min,
    low_52wk_avg = excluded.low_52wk_avg,
    low_52wk_count = excluded.low_52wk_count,
    volume_52wk_max = excluded.volume_52wk_max,
    volume_52wk_min = excluded.volume_52wk_min,
    volume_52wk_avg = excluded.volume_52wk_avg,
    volume_52wk_count = excluded.volume_52wk_count,
    timestamp_52wk_count = excluded.timestamp_52wk_count,
    job_run_id = excluded.job_run_id,
    modified = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
WHERE stage_candles_52wk.open IS NOT excluded.open
   OR stage_candles_52wk.high IS NOT excluded.high
   OR stage_candles_52wk.low IS NOT excluded.low
   OR stage_candles_52wk.close IS NOT excluded.close
   OR stage_candles_52wk.volume IS NOT excluded.volume
   OR stage_candles_52wk.high_52wk_max IS NOT excluded.high_52wk_max
   OR stage_candles_52wk.high_52wk_min IS NOT excluded.high_52wk_min
   OR stage_candles_52wk.high_52wk_avg IS NOT excluded.high_52wk_avg
   OR stage_candles_52wk.high_52wk_count IS NOT excluded.high_52wk_count
   OR stage_candles_52wk.low_52wk_max IS NOT excluded.low_52wk_max
   OR stage_candles_52wk.low_52wk_min IS NOT excluded.low_52wk_min
   OR stage_candles_52wk.low_52wk_avg IS NOT excluded.low_52wk_avg
   OR stage_candles_52wk.low_52wk_count IS NOT excluded.low_52wk_count
   OR stage_candles_52wk.volume_52wk_max IS NOT excluded.volume_52wk_max
   OR stage_candles_52wk.volume_52wk_min IS NOT excluded.volume_52wk_min
   OR stage_candles_52wk.volume_52wk_avg IS NOT excluded.volume_52wk_avg
   OR stage_candles_52wk.volume_52wk_count IS NOT excluded.volume_52wk_count
   OR stage_candles_52wk.timestamp_52wk_count IS NOT excluded.timestamp_52wk_count";

/// Timestamps (ascending) of the symbol's candles within 52 weeks of a
/// candle this run inserted or changed, or one left behind by a run that
/// did not succeed
pub fn calc_affected(conn: &Connection, job_run_id: i64, symbol: &str) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare_cached(CALC_AFFECTED)?;
    let rows = stmt.query_map(params![symbol, job_run_id, WINDOW_SECS], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<Vec<i64>>>()?)
}

/// Recompute and upsert the aggregate of each affected candle
pub fn update_affected(
    conn: &Connection,
    job_run_id: i64,
    symbol: &str,
    affected: &[i64],
) -> Result<StagingInfo> {
    let mut stmt = conn.prepare_cached(UPSERT_AGGREGATE)?;
    let mut info = StagingInfo::default();

    for &ts in affected {
        info.rows_staged += 1;
        info.rows_modified += stmt.execute(params![symbol, ts, job_run_id, WINDOW_SECS])? as i64;
    }

    Ok(info)
}

/// Maintain the aggregates of one symbol after a run staged its candles
pub fn stage_candles_52wk(conn: &Connection, job_run_id: i64, symbol: &str) -> Result<StagingInfo> {
    let affected = calc_affected(conn, job_run_id, symbol)?;
    if affected.is_empty() {
        tracing::debug!("No affected 52wk rows for {}", symbol);
        return Ok(StagingInfo::default());
    }

    let info = update_affected(conn, job_run_id, symbol, &affected)?;
    tracing::debug!(
        "52wk {}: {} affected, {} modified",
        symbol,
        info.rows_staged,
        info.rows_modified
    );
    Ok(info)
}

/// Maintain the aggregates of every symbol touched by a run, one
/// transaction per symbol.
///
/// The connection is pinged whenever `keep_alive` has elapsed since the last
/// ping so a long pass does not sit on an idle-expired connection.
pub fn stage_all_candles_52wk(
    conn: &mut Connection,
    job_run_id: i64,
    keep_alive: Duration,
) -> Result<StagingInfo> {
    let symbols = run_symbols(conn, job_run_id)?;

    let mut total = StagingInfo::default();
    let mut last_ping = Instant::now();

    for symbol in &symbols {
        if last_ping.elapsed() >= keep_alive {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            last_ping = Instant::now();
            tracing::debug!("Keep-alive ping");
        }

        total += tx::run_tx(conn, |tx| stage_candles_52wk(tx, job_run_id, symbol))?;
    }

    tracing::info!(
        "52wk maintenance over {} symbols: {} affected, {} modified",
        symbols.len(),
        total.rows_staged,
        total.rows_modified
    );
    Ok(total)
}

/// Read one aggregate row
pub fn get_candle_52wk(
    conn: &Connection,
    symbol: &str,
    timestamp: i64,
    tz: &Tz,
) -> Result<Option<Candle52Wk>> {
    Ok(conn
        .query_row(
            "SELECT symbol, timestamp, open, high, low, close, volume,
                    high_52wk_max, high_52wk_min, high_52wk_avg, high_52wk_count,
                    low_52wk_max, low_52wk_min, low_52wk_avg, low_52wk_count,
                    volume_52wk_max, volume_52wk_min, volume_52wk_avg, volume_52wk_count,
                    timestamp_52wk_count
             FROM stage_candles_52wk WHERE symbol = ?1 AND timestamp = ?2",
            params![symbol, timestamp],
            |row| {
                let secs: i64 = row.get(1)?;
                let timestamp = tz
                    .timestamp_opt(secs, 0)
                    .single()
                    .ok_or(rusqlite::Error::IntegralValueOutOfRange(1, secs))?;

                Ok(Candle52Wk {
                    symbol: row.get(0)?,
                    timestamp,
                    open: row.get(2)?,
                    high: row.get(3)?,
                    low: row.get(4)?,
                    close: row.get(5)?,
                    volume: row.get(6)?,
                    high_52wk: stats(row, 7)?,
                    low_52wk: stats(row, 11)?,
                    volume_52wk: stats(row, 15)?,
                    timestamp_52wk_count: row.get(19)?,
                })
            },
        )
        .optional()?)
}

fn run_symbols(conn: &Connection, job_run_id: i64) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT symbol FROM stage_candles
         WHERE job_run_id IN (SELECT id FROM job_run WHERE id = ?1 OR success IS NOT 1)
         ORDER BY symbol",
    )?;
    let symbols = stmt
        .query_map([job_run_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(symbols)
}

fn stats(row: &Row<'_>, first: usize) -> rusqlite::Result<WindowStats> {
    Ok(WindowStats {
        max: row.get(first)?,
        min: row.get(first + 1)?,
        avg: row.get(first + 2)?,
        count: row.get(first + 3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::models::Candle;
    use crate::db::sqlite::{job_run, migrations, stage};

    const DAY: i64 = 86_400;
    const WEEK: i64 = 7 * DAY;
    const T0: i64 = 1_600_000_000;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_migrations(&conn).unwrap();
        conn
    }

    fn candle(symbol: &str, ts: i64, high: f64) -> Candle {
        Candle {
            symbol: symbol.into(),
            timestamp: Tz::UTC.timestamp_opt(ts, 0).unwrap(),
            open: Some(high - 1.0),
            high: Some(high),
            low: Some(high - 2.0),
            close: Some(high - 0.5),
            volume: Some(100.0),
        }
    }

    fn tagged_run(conn: &Connection, symbol: &str, ts: i64) -> i64 {
        conn.query_row(
            "SELECT job_run_id FROM stage_candles_52wk WHERE symbol = ?1 AND timestamp = ?2",
            params![symbol, ts],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_window_is_52_weeks() {
        assert_eq!(WINDOW_SECS, 31_449_600);
    }

    #[test]
    fn test_aggregate_values() {
        let conn = setup();
        let run = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        for (i, high) in [10.0, 30.0, 20.0].into_iter().enumerate() {
            stage::upsert_candle(&conn, run.id, &candle("AAPL", T0 + i as i64 * DAY, high)).unwrap();
        }
        let mut gap = candle("AAPL", T0 + 3 * DAY, 40.0);
        gap.volume = None;
        stage::upsert_candle(&conn, run.id, &gap).unwrap();

        let info = stage_candles_52wk(&conn, run.id, "AAPL").unwrap();
        assert_eq!(info, StagingInfo { rows_staged: 4, rows_modified: 4 });

        let row = get_candle_52wk(&conn, "AAPL", T0 + 3 * DAY, &Tz::UTC)
            .unwrap()
            .unwrap();
        assert_eq!(row.high, Some(40.0));
        assert_eq!(row.high_52wk.max, Some(40.0));
        assert_eq!(row.high_52wk.min, Some(10.0));
        assert_eq!(row.high_52wk.avg, Some(25.0));
        assert_eq!(row.high_52wk.count, 4);
        assert_eq!(row.low_52wk.min, Some(8.0));
        assert_eq!(row.volume_52wk.count, 3);
        assert_eq!(row.timestamp_52wk_count, 4);

        let first = get_candle_52wk(&conn, "AAPL", T0, &Tz::UTC).unwrap().unwrap();
        assert_eq!(first.high_52wk.max, Some(10.0));
        assert_eq!(first.timestamp_52wk_count, 1);
    }

    #[test]
    fn test_change_recomputes_forward_window_only() {
        let conn = setup();
        let first = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();

        // Weekly candles across two years
        let weeks: Vec<i64> = (0..104).map(|w| T0 + w * WEEK).collect();
        for &ts in &weeks {
            stage::upsert_candle(&conn, first.id, &candle("AAPL", ts, 10.0)).unwrap();
            stage::upsert_candle(&conn, first.id, &candle("MSFT", ts, 10.0)).unwrap();
        }
        stage_candles_52wk(&conn, first.id, "AAPL").unwrap();
        stage_candles_52wk(&conn, first.id, "MSFT").unwrap();
        job_run::finish_job(&conn, first.id, true).unwrap();

        // A new high at week 20 of AAPL
        let changed = weeks[20];
        let second = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        assert_eq!(
            stage::upsert_candle(&conn, second.id, &candle("AAPL", changed, 99.0)).unwrap(),
            1
        );

        let affected = calc_affected(&conn, second.id, "AAPL").unwrap();
        assert_eq!(affected.first(), Some(&weeks[0]));
        assert_eq!(affected.last(), Some(&(changed + WINDOW_SECS)));

        let info = stage_candles_52wk(&conn, second.id, "AAPL").unwrap();
        // Week 20 through week 72 inclusive see the new high
        assert_eq!(info.rows_modified, 53);

        for &ts in &weeks {
            let expect = if ts >= changed && ts <= changed + WINDOW_SECS {
                second.id
            } else {
                first.id
            };
            assert_eq!(tagged_run(&conn, "AAPL", ts), expect, "week at {}", ts);
            assert_eq!(tagged_run(&conn, "MSFT", ts), first.id);
        }

        let row = get_candle_52wk(&conn, "AAPL", changed + WINDOW_SECS, &Tz::UTC)
            .unwrap()
            .unwrap();
        assert_eq!(row.high_52wk.max, Some(99.0));
        let row = get_candle_52wk(&conn, "AAPL", changed + WINDOW_SECS + WEEK, &Tz::UTC)
            .unwrap()
            .unwrap();
        assert_eq!(row.high_52wk.max, Some(10.0));
    }

    #[test]
    fn test_nothing_affected_is_skipped() {
        let conn = setup();
        let first = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        stage::upsert_candle(&conn, first.id, &candle("AAPL", T0, 10.0)).unwrap();
        job_run::finish_job(&conn, first.id, true).unwrap();

        let second = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        assert_eq!(
            stage_candles_52wk(&conn, second.id, "AAPL").unwrap(),
            StagingInfo::default()
        );
        assert!(get_candle_52wk(&conn, "AAPL", T0, &Tz::UTC).unwrap().is_none());
    }

    #[test]
    fn test_failed_run_candles_are_repaired() {
        let mut conn = setup();
        let failed = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        stage::upsert_candle(&conn, failed.id, &candle("AAPL", T0, 10.0)).unwrap();
        job_run::finish_job(&conn, failed.id, false).unwrap();

        // Nothing new staged by this run, but the failed run's candle has no aggregate
        let next = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        let info = stage_all_candles_52wk(&mut conn, next.id, Duration::from_secs(60)).unwrap();
        assert_eq!(info, StagingInfo { rows_staged: 1, rows_modified: 1 });
        assert_eq!(tagged_run(&conn, "AAPL", T0), next.id);
    }

    #[test]
    fn test_stage_all_symbols_of_run() {
        let mut conn = setup();
        let run = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        for symbol in ["AAPL", "MSFT"] {
            for d in 0..3 {
                stage::upsert_candle(&conn, run.id, &candle(symbol, T0 + d * DAY, 10.0)).unwrap();
            }
        }

        let info = stage_all_candles_52wk(&mut conn, run.id, Duration::ZERO).unwrap();
        assert_eq!(info, StagingInfo { rows_staged: 6, rows_modified: 6 });

        let again = stage_all_candles_52wk(&mut conn, run.id, Duration::ZERO).unwrap();
        assert_eq!(again, StagingInfo { rows_staged: 6, rows_modified: 0 });
    }
}

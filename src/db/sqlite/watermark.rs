//! Extraction and staging watermarks

use crate::db::sqlite::models::{EntityKind, LatestCandles, StageWatermark};
use crate::error::{AppError, Result};
use chrono::TimeZone;
use chrono_tz::Tz;
use rusqlite::{params, Connection, OptionalExtension};

/// Latest candle per symbol, counting only runs that finished successfully.
///
/// Candles whose provenance is a failed or still-running run are invisible
/// here, so a failed run never moves the resume point forward.
pub fn latest_candles(conn: &Connection, tz: &Tz) -> Result<LatestCandles> {
    let mut stmt = conn.prepare(
        "SELECT c.symbol, MAX(c.timestamp)
         FROM stage_candles c
         JOIN job_run r ON c.job_run_id = r.id
         WHERE r.success = 1
         GROUP BY c.symbol",
    )?;

    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut latest = LatestCandles::new();
    for row in rows {
        let (symbol, secs) = row?;
        let timestamp = tz.timestamp_opt(secs, 0).single().ok_or_else(|| {
            AppError::Internal(format!("stored timestamp {} out of range for {}", secs, symbol))
        })?;
        latest.insert(symbol, timestamp);
    }

    tracing::debug!("Loaded watermarks for {} symbols", latest.len());
    Ok(latest)
}

/// Last landing row folded in by delta staging
pub fn stage_watermark(conn: &Connection, kind: EntityKind) -> Result<Option<StageWatermark>> {
    Ok(conn
        .query_row(
            "SELECT latest_id, latest_modification FROM stage_watermark WHERE entity = ?1",
            [kind.name()],
            |row| {
                Ok(StageWatermark {
                    latest_id: row.get(0)?,
                    latest_modification: row.get(1)?,
                })
            },
        )
        .optional()?)
}

pub fn set_stage_watermark(
    conn: &Connection,
    kind: EntityKind,
    mark: &StageWatermark,
) -> Result<()> {
    conn.execute(
        "INSERT INTO stage_watermark (entity, latest_id, latest_modification) VALUES (?1, ?2, ?3)
         ON CONFLICT(entity) DO UPDATE SET
            latest_id = excluded.latest_id,
            latest_modification = excluded.latest_modification,
            modified = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')",
        params![kind.name(), mark.latest_id, mark.latest_modification],
    )?;
    Ok(())
}

//! Raw landing store
//!
//! Append-only. Every fetched unit becomes one immutable row tagged with
//! the run that fetched it.

use crate::db::sqlite::models::{EntityKind, RawRow};
use crate::error::Result;
use crate::payload::Payload;
use rusqlite::{params, Connection, Row};

/// Land an encoded payload, returning the new row id
pub fn insert_raw(
    conn: &Connection,
    kind: EntityKind,
    job_run_id: i64,
    symbol: &str,
    payload: &Payload,
) -> Result<i64> {
    let bytes = payload.encode()?;
    let sql = format!(
        "INSERT INTO {} (job_run_id, symbol, payload) VALUES (?1, ?2, ?3)",
        kind.src_table()
    );
    conn.prepare_cached(&sql)?
        .execute(params![job_run_id, symbol, bytes])?;
    Ok(conn.last_insert_rowid())
}

/// Stream a run's landing rows in insertion order, optionally for one symbol.
///
/// Each call issues a fresh query, so a stream that was abandoned part way
/// can simply be started again. Returns the number of rows visited.
pub fn for_each_raw<F>(
    conn: &Connection,
    kind: EntityKind,
    job_run_id: i64,
    symbol: Option<&str>,
    mut f: F,
) -> Result<usize>
where
    F: FnMut(RawRow) -> Result<()>,
{
    let sql = format!(
        "SELECT id, job_run_id, symbol, payload, created FROM {}
         WHERE job_run_id = ?1 AND (?2 IS NULL OR symbol = ?2)
         ORDER BY id",
        kind.src_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![job_run_id, symbol])?;

    let mut visited = 0;
    while let Some(row) = rows.next()? {
        f(raw_row(row)?)?;
        visited += 1;
    }
    Ok(visited)
}

/// Collect a run's landing rows
pub fn list_raw(
    conn: &Connection,
    kind: EntityKind,
    job_run_id: i64,
    symbol: Option<&str>,
) -> Result<Vec<RawRow>> {
    let mut out = Vec::new();
    for_each_raw(conn, kind, job_run_id, symbol, |row| {
        out.push(row);
        Ok(())
    })?;
    Ok(out)
}

/// Stream landing rows of any run with an id past `after_id`, in id order
pub fn for_each_raw_since<F>(
    conn: &Connection,
    kind: EntityKind,
    after_id: Option<i64>,
    mut f: F,
) -> Result<usize>
where
    F: FnMut(RawRow) -> Result<()>,
{
    let sql = format!(
        "SELECT id, job_run_id, symbol, payload, created FROM {}
         WHERE ?1 IS NULL OR id > ?1
         ORDER BY id",
        kind.src_table()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params![after_id])?;

    let mut visited = 0;
    while let Some(row) = rows.next()? {
        f(raw_row(row)?)?;
        visited += 1;
    }
    Ok(visited)
}

/// Delete landing rows of runs older than `job_run_id` from every landing table
pub fn purge_raw_before(conn: &Connection, job_run_id: i64) -> Result<usize> {
    let mut deleted = 0;
    for kind in EntityKind::ALL {
        let sql = format!("DELETE FROM {} WHERE job_run_id < ?1", kind.src_table());
        let n = conn.execute(&sql, [job_run_id])?;
        if n > 0 {
            tracing::info!("Purged {} {} landing rows", n, kind.name());
        }
        deleted += n;
    }
    Ok(deleted)
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        job_run_id: row.get(1)?,
        symbol: row.get(2)?,
        payload: row.get(3)?,
        created: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::{job_run, migrations};
    use crate::sources::types::Stock;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_migrations(&conn).unwrap();
        conn
    }

    fn stock(symbol: &str) -> Payload {
        Payload::Stock(Stock {
            symbol: symbol.into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_insert_never_deduplicates() {
        let conn = setup();
        let run = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();

        let a = insert_raw(&conn, EntityKind::Stock, run.id, "AAPL", &stock("AAPL")).unwrap();
        let b = insert_raw(&conn, EntityKind::Stock, run.id, "AAPL", &stock("AAPL")).unwrap();
        assert_ne!(a, b);

        let rows = list_raw(&conn, EntityKind::Stock, run.id, None).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            Payload::decode(&rows[0].payload, EntityKind::Stock).unwrap(),
            stock("AAPL")
        );
    }

    #[test]
    fn test_stream_filters_by_run_and_symbol() {
        let conn = setup();
        let first = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        let second = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();

        insert_raw(&conn, EntityKind::Stock, first.id, "AAPL", &stock("AAPL")).unwrap();
        insert_raw(&conn, EntityKind::Stock, second.id, "AAPL", &stock("AAPL")).unwrap();
        insert_raw(&conn, EntityKind::Stock, second.id, "MSFT", &stock("MSFT")).unwrap();

        let mut seen = Vec::new();
        let visited = for_each_raw(&conn, EntityKind::Stock, second.id, Some("MSFT"), |row| {
            seen.push(row.symbol);
            Ok(())
        })
        .unwrap();
        assert_eq!(visited, 1);
        assert_eq!(seen, vec!["MSFT".to_string()]);

        // Restartable: a second pass sees the same rows
        assert_eq!(list_raw(&conn, EntityKind::Stock, second.id, None).unwrap().len(), 2);
        assert_eq!(list_raw(&conn, EntityKind::Stock, second.id, None).unwrap().len(), 2);
        assert!(list_raw(&conn, EntityKind::Candle, second.id, None).unwrap().is_empty());
    }

    #[test]
    fn test_purge_keeps_current_run() {
        let conn = setup();
        let old = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();
        let current = job_run::start_job(&conn, job_run::FINNHUB_ETL).unwrap();

        insert_raw(&conn, EntityKind::Stock, old.id, "AAPL", &stock("AAPL")).unwrap();
        insert_raw(&conn, EntityKind::Stock, current.id, "AAPL", &stock("AAPL")).unwrap();

        assert_eq!(purge_raw_before(&conn, current.id).unwrap(), 1);
        assert!(list_raw(&conn, EntityKind::Stock, old.id, None).unwrap().is_empty());
        assert_eq!(list_raw(&conn, EntityKind::Stock, current.id, None).unwrap().len(), 1);
    }
}

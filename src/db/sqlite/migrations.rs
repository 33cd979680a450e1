//! SQLite database migrations

use crate::error::Result;
use rusqlite::Connection;

/// Run all database migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    run_migration(conn, "001_job_definition", CREATE_JOB_DEFINITION_TABLE)?;
    run_migration(conn, "002_job_run", CREATE_JOB_RUN_TABLE)?;
    run_migration(conn, "003_src_stocks", CREATE_SRC_STOCKS_TABLE)?;
    run_migration(conn, "004_src_candles", CREATE_SRC_CANDLES_TABLE)?;
    run_migration(conn, "005_src_company_profiles", CREATE_SRC_COMPANY_PROFILES_TABLE)?;
    run_migration(conn, "006_stage_stocks", CREATE_STAGE_STOCKS_TABLE)?;
    run_migration(conn, "007_stage_candles", CREATE_STAGE_CANDLES_TABLE)?;
    run_migration(conn, "008_stage_company_profiles", CREATE_STAGE_COMPANY_PROFILES_TABLE)?;
    run_migration(conn, "009_stage_candles_52wk", CREATE_STAGE_CANDLES_52WK_TABLE)?;
    run_migration(conn, "010_stage_watermark", CREATE_STAGE_WATERMARK_TABLE)?;

    tracing::debug!("Database migrations completed");
    Ok(())
}

fn run_migration(conn: &Connection, name: &str, sql: &str) -> Result<()> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM migrations WHERE name = ?)",
        [name],
        |row| row.get(0),
    )?;

    if !exists {
        tracing::info!("Running migration: {}", name);
        conn.execute_batch(sql)?;
        conn.execute("INSERT INTO migrations (name) VALUES (?)", [name])?;
    }

    Ok(())
}

// Timestamps are millisecond UTC text. Landing ids are AUTOINCREMENT and
// SQLite serializes writers, so ids grow in commit order; delta staging
// keys its watermark on them.

const CREATE_JOB_DEFINITION_TABLE: &str = r#"
CREATE TABLE job_definition (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

INSERT INTO job_definition (name) VALUES ('Finnhub ETL');
"#;

const CREATE_JOB_RUN_TABLE: &str = r#"
CREATE TABLE job_run (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_definition_id INTEGER NOT NULL REFERENCES job_definition(id),
    success INTEGER,
    started TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    finished TEXT
);

CREATE INDEX idx_job_run_success ON job_run(success);
"#;

const CREATE_SRC_STOCKS_TABLE: &str = r#"
CREATE TABLE src_stocks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_run_id INTEGER NOT NULL REFERENCES job_run(id),
    symbol TEXT NOT NULL,
    payload BLOB NOT NULL,
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX idx_src_stocks_run ON src_stocks(job_run_id, symbol);
CREATE INDEX idx_src_stocks_created ON src_stocks(created);
"#;

const CREATE_SRC_CANDLES_TABLE: &str = r#"
CREATE TABLE src_candles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_run_id INTEGER NOT NULL REFERENCES job_run(id),
    symbol TEXT NOT NULL,
    payload BLOB NOT NULL,
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX idx_src_candles_run ON src_candles(job_run_id, symbol);
CREATE INDEX idx_src_candles_created ON src_candles(created);
"#;

const CREATE_SRC_COMPANY_PROFILES_TABLE: &str = r#"
CREATE TABLE src_company_profiles (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_run_id INTEGER NOT NULL REFERENCES job_run(id),
    symbol TEXT NOT NULL,
    payload BLOB NOT NULL,
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

CREATE INDEX idx_src_company_profiles_run ON src_company_profiles(job_run_id, symbol);
CREATE INDEX idx_src_company_profiles_created ON src_company_profiles(created);
"#;

const CREATE_STAGE_STOCKS_TABLE: &str = r#"
CREATE TABLE stage_stocks (
    symbol TEXT PRIMARY KEY,
    display_symbol TEXT NOT NULL,
    description TEXT NOT NULL,
    job_run_id INTEGER NOT NULL REFERENCES job_run(id),
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

const CREATE_STAGE_CANDLES_TABLE: &str = r#"
CREATE TABLE stage_candles (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL,
    volume REAL,
    job_run_id INTEGER NOT NULL REFERENCES job_run(id),
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (symbol, timestamp)
);

CREATE INDEX idx_stage_candles_run ON stage_candles(job_run_id, symbol);
"#;

const CREATE_STAGE_COMPANY_PROFILES_TABLE: &str = r#"
CREATE TABLE stage_company_profiles (
    symbol TEXT PRIMARY KEY,
    country TEXT,
    currency TEXT,
    exchange TEXT,
    name TEXT,
    ticker TEXT NOT NULL,
    ipo TEXT,
    market_capitalization REAL,
    shares_outstanding REAL,
    logo TEXT,
    phone TEXT,
    web_url TEXT,
    industry TEXT,
    job_run_id INTEGER NOT NULL REFERENCES job_run(id),
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

const CREATE_STAGE_CANDLES_52WK_TABLE: &str = r#"
CREATE TABLE stage_candles_52wk (
    symbol TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    open REAL,
    high REAL,
    low REAL,
    close REAL,
    volume REAL,
    high_52wk_max REAL,
    high_52wk_min REAL,
    high_52wk_avg REAL,
    high_52wk_count INTEGER NOT NULL,
    low_52wk_max REAL,
    low_52wk_min REAL,
    low_52wk_avg REAL,
    low_52wk_count INTEGER NOT NULL,
    volume_52wk_max REAL,
    volume_52wk_min REAL,
    volume_52wk_avg REAL,
    volume_52wk_count INTEGER NOT NULL,
    timestamp_52wk_count INTEGER NOT NULL,
    job_run_id INTEGER NOT NULL REFERENCES job_run(id),
    created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
    PRIMARY KEY (symbol, timestamp)
);
"#;

const CREATE_STAGE_WATERMARK_TABLE: &str = r#"
CREATE TABLE stage_watermark (
    entity TEXT PRIMARY KEY,
    latest_id INTEGER NOT NULL,
    latest_modification TEXT NOT NULL,
    modified TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let applied: i64 = conn
            .query_row("SELECT COUNT(*) FROM migrations", [], |row| row.get(0))
            .unwrap();
        assert_eq!(applied, 10);

        let definitions: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM job_definition WHERE name = 'Finnhub ETL'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(definitions, 1);
    }
}

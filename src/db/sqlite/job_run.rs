//! Job run lifecycle

use crate::db::sqlite::models::JobRun;
use crate::error::{AppError, Result};
use rusqlite::{params, Connection, OptionalExtension};

/// Job definition seeded by the migrations
pub const FINNHUB_ETL: &str = "Finnhub ETL";

/// Open a new run of the named job definition
pub fn start_job(conn: &Connection, definition_name: &str) -> Result<JobRun> {
    let definition_id: i64 = conn
        .query_row(
            "SELECT id FROM job_definition WHERE name = ?1",
            [definition_name],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| {
            AppError::NotFound(format!("job definition {:?}", definition_name))
        })?;

    conn.execute(
        "INSERT INTO job_run (job_definition_id) VALUES (?1)",
        [definition_id],
    )?;

    get_job_run(conn, conn.last_insert_rowid())
}

/// Record the terminal outcome of a run. Only the first call takes effect.
pub fn finish_job(conn: &Connection, job_run_id: i64, success: bool) -> Result<()> {
    let updated = conn.execute(
        "UPDATE job_run
         SET success = ?2, finished = strftime('%Y-%m-%dT%H:%M:%fZ', 'now')
         WHERE id = ?1 AND success IS NULL",
        params![job_run_id, success],
    )?;

    if updated == 0 {
        let run = get_job_run(conn, job_run_id)?;
        return Err(AppError::Conflict(format!(
            "job run {} already finished ({:?})",
            run.id,
            run.status()
        )));
    }

    Ok(())
}

pub fn get_job_run(conn: &Connection, job_run_id: i64) -> Result<JobRun> {
    conn.query_row(
        "SELECT id, job_definition_id, success, started, finished
         FROM job_run WHERE id = ?1",
        [job_run_id],
        |row| {
            Ok(JobRun {
                id: row.get(0)?,
                job_definition_id: row.get(1)?,
                success: row.get(2)?,
                started: row.get(3)?,
                finished: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| AppError::NotFound(format!("job run {}", job_run_id)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::sqlite::migrations;
    use crate::db::sqlite::models::JobRunStatus;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_run_ids_are_monotonic() {
        let conn = setup();
        let a = start_job(&conn, FINNHUB_ETL).unwrap();
        let b = start_job(&conn, FINNHUB_ETL).unwrap();
        assert!(b.id > a.id);
        assert_eq!(a.status(), JobRunStatus::Running);
        assert!(a.finished.is_none());
    }

    #[test]
    fn test_unknown_definition() {
        let conn = setup();
        assert!(matches!(
            start_job(&conn, "Nightly Reindex"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn test_finish_is_single_shot() {
        let conn = setup();
        let run = start_job(&conn, FINNHUB_ETL).unwrap();

        finish_job(&conn, run.id, false).unwrap();
        let finished = get_job_run(&conn, run.id).unwrap();
        assert_eq!(finished.status(), JobRunStatus::Failed);
        assert!(finished.finished.is_some());

        assert!(matches!(
            finish_job(&conn, run.id, true),
            Err(AppError::Conflict(_))
        ));
        assert_eq!(
            get_job_run(&conn, run.id).unwrap().status(),
            JobRunStatus::Failed
        );
    }

    #[test]
    fn test_finish_unknown_run() {
        let conn = setup();
        assert!(matches!(finish_job(&conn, 42, true), Err(AppError::NotFound(_))));
    }
}

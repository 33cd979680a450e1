//! Scoped transactions
//!
//! `run_tx` brackets a closure in a transaction that commits on `Ok` and
//! rolls back on `Err`. `with_savepoint` retries a group of statements
//! inside a named savepoint, so a transient failure only rewinds that group
//! and the enclosing transaction carries on.

use crate::error::Result;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

static NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);

const SAVEPOINT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Run `f` in a transaction.
///
/// The write lock is taken up front so a read-then-write body waits on the
/// busy timeout instead of failing on a stale snapshot.
pub fn run_tx<T, F>(conn: &mut Connection, f: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>) -> Result<T>,
{
    let id = NEXT_TX_ID.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(tx = id, "begin");

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    match f(&tx) {
        Ok(value) => {
            tx.commit()?;
            tracing::debug!(tx = id, "commit");
            Ok(value)
        }
        Err(e) => {
            // Dropping the transaction rolls it back
            drop(tx);
            tracing::debug!(tx = id, error = %e, "rollback");
            Err(e)
        }
    }
}

/// Run `f` inside savepoint `name`, retrying transient failures up to
/// `attempts` times in total.
///
/// `name` must be a plain SQL identifier.
pub fn with_savepoint<T, F>(conn: &Connection, name: &str, attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut(&Connection) -> Result<T>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        conn.execute_batch(&format!("SAVEPOINT {}", name))?;

        match f(conn) {
            Ok(value) => {
                conn.execute_batch(&format!("RELEASE {}", name))?;
                return Ok(value);
            }
            Err(e) => {
                conn.execute_batch(&format!("ROLLBACK TO {name}; RELEASE {name}"))?;

                if !e.is_transient() || attempt >= attempts {
                    return Err(e);
                }

                tracing::warn!(
                    "Savepoint {} failed (attempt {}/{}), retrying: {}",
                    name,
                    attempt,
                    attempts,
                    e
                );
                std::thread::sleep(SAVEPOINT_RETRY_DELAY * attempt);
                attempt += 1;
            }
        }
    }
}

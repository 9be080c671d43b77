//! Connection bootstrap utilities for SQLite.
//!
//! # Responsibility
//! - Open file or in-memory SQLite connections.
//! - Configure the pragmas relation cascades rely on.
//! - Trigger schema migrations before returning a usable connection.
//!
//! # Invariants
//! - Returned connections have `foreign_keys=ON`.
//! - Returned connections have migrations fully applied.
//! - Returned connections carry the Unicode case-fold function used by
//!   case-insensitive filters. Connections opened elsewhere need
//!   [`register_functions`] before they reach a repository.

use super::migrations::{apply_migrations, Migration};
use super::DbResult;
use log::{error, info};
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, Instant};

/// Opens a SQLite database file and applies all pending `migrations`.
///
/// # Side effects
/// - Performs connection bootstrap and migration checks.
/// - Emits `db_open` logging events with duration and status.
pub fn open_db(path: impl AsRef<Path>, migrations: &[Migration]) -> DbResult<Connection> {
    let path = path.as_ref();
    open_with("file", migrations, || Connection::open(path))
}

/// Opens an in-memory SQLite database and applies `migrations`.
///
/// # Side effects
/// - Emits `db_open` logging events with duration and status.
pub fn open_db_in_memory(migrations: &[Migration]) -> DbResult<Connection> {
    open_with("memory", migrations, Connection::open_in_memory)
}

fn open_with(
    mode: &str,
    migrations: &[Migration],
    open: impl FnOnce() -> rusqlite::Result<Connection>,
) -> DbResult<Connection> {
    let started_at = Instant::now();
    info!("event=db_open module=db status=start mode={mode}");

    let mut conn = match open() {
        Ok(conn) => conn,
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_open_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            return Err(err.into());
        }
    };

    match bootstrap_connection(&mut conn, migrations) {
        Ok(()) => {
            info!(
                "event=db_open module=db status=ok mode={} duration_ms={} schema_version={}",
                mode,
                started_at.elapsed().as_millis(),
                super::latest_version(migrations)
            );
            Ok(conn)
        }
        Err(err) => {
            error!(
                "event=db_open module=db status=error mode={} duration_ms={} error_code=db_bootstrap_failed error={}",
                mode,
                started_at.elapsed().as_millis(),
                err
            );
            Err(err)
        }
    }
}

/// SQL name of the Unicode lowercase function.
pub const CASEFOLD_FUNCTION: &str = "crumb_casefold";

/// Registers the engine's SQL functions on `conn`.
///
/// SQLite's built-in `LOWER` only folds ASCII letters, so case-insensitive
/// comparisons go through [`CASEFOLD_FUNCTION`] instead. Non-text values pass
/// through unchanged.
pub fn register_functions(conn: &Connection) -> DbResult<()> {
    conn.create_scalar_function(
        CASEFOLD_FUNCTION,
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: SqlValue = ctx.get(0)?;
            Ok(match value {
                SqlValue::Text(text) => SqlValue::Text(text.to_lowercase()),
                other => other,
            })
        },
    )?;
    Ok(())
}

fn bootstrap_connection(conn: &mut Connection, migrations: &[Migration]) -> DbResult<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    register_functions(conn)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    apply_migrations(conn, migrations)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{register_functions, CASEFOLD_FUNCTION};
    use rusqlite::Connection;

    #[test]
    fn casefold_lowers_non_ascii_letters() {
        let conn = Connection::open_in_memory().unwrap();
        register_functions(&conn).unwrap();

        let folded: String = conn
            .query_row(&format!("SELECT {CASEFOLD_FUNCTION}('ÉMILE Ödön')"), [], |row| row.get(0))
            .unwrap();
        assert_eq!(folded, "émile ödön");

        let number: i64 = conn
            .query_row(&format!("SELECT {CASEFOLD_FUNCTION}(42)"), [], |row| row.get(0))
            .unwrap();
        assert_eq!(number, 42);
    }
}

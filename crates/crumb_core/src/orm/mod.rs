//! Relational collaborator: SQLite value mapping, filters and queries.
//!
//! # Invariants
//! - Nested scopes never open their own transaction; `atomic` joins an
//!   enclosing one when the connection is already inside a transaction.

use crate::errors::RepoResult;
use rusqlite::{Connection, Transaction, TransactionBehavior};

pub mod filter;
pub mod query;
pub mod record;
pub mod value;

pub use filter::Filter;
pub use query::Selection;
pub use record::{Data, Record};

/// Runs `body` inside one transaction.
///
/// When `conn` is already inside a transaction, `body` runs in it directly and
/// the enclosing scope owns commit and rollback.
pub fn atomic<T>(
    conn: &Connection,
    behavior: TransactionBehavior,
    body: impl FnOnce() -> RepoResult<T>,
) -> RepoResult<T> {
    if !conn.is_autocommit() {
        return body();
    }
    let tx = Transaction::new_unchecked(conn, behavior)?;
    let result = body()?;
    tx.commit()?;
    Ok(result)
}

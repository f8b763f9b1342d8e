//! Shared connection handling for the `SQLite` vector store.
//!
//! Provides mutex acquisition with poison recovery and connection
//! configuration. The store serializes statements through a
//! `Mutex<Connection>`; WAL mode plus a generous `busy_timeout` keep
//! concurrent processes (e.g. an HTTP server and a JSON-RPC server on
//! the same file) from tripping over each other.

use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;

use crate::{Error, Result};

/// Minimum busy timeout, milliseconds. Set on the connection at open
/// time, not via a later pragma, so even the first statement waits out
/// contention instead of failing with `SQLITE_BUSY`.
pub const BUSY_TIMEOUT_MS: u64 = 15_000;

/// Acquires a mutex lock with poison recovery.
///
/// If the mutex is poisoned by a panic in a previous critical section,
/// the inner value is recovered and a warning logged; the connection
/// state itself is still valid.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::warn!("sqlite mutex was poisoned, recovering");
            metrics::counter!("sqlite_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        },
    }
}

/// Configures a connection for concurrent use.
///
/// Applies WAL journaling, `NORMAL` synchronous, the [`BUSY_TIMEOUT_MS`]
/// busy timeout, and then any operator-supplied pragmas (which may raise,
/// but never lower, the busy timeout).
///
/// # Errors
///
/// Returns [`Error::Storage`] if an operator pragma fails to apply.
pub fn configure_connection(conn: &Connection, extra_pragmas: &[(String, String)]) -> Result<()> {
    // journal_mode returns a string result which would fail execute_batch;
    // pragma_update tolerates it.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS.to_string());
    let _ = conn.pragma_update(None, "foreign_keys", "ON");

    for (name, value) in extra_pragmas {
        if name.eq_ignore_ascii_case("busy_timeout") {
            let requested: u64 = value.parse().unwrap_or(0);
            let effective = requested.max(BUSY_TIMEOUT_MS);
            let _ = conn.pragma_update(None, "busy_timeout", effective.to_string());
            continue;
        }
        conn.pragma_update(None, name, value.as_str())
            .map_err(|e| Error::storage(format!("pragma_{name}"), e))?;
    }

    Ok(())
}

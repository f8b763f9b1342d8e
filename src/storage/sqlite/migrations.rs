//! Embedded schema migrations for the local vector store.
//!
//! Migrations are numbered SQL scripts applied in order on every
//! initialization. They are written to be idempotent (`IF NOT EXISTS`
//! everywhere); an already-applied `ALTER TABLE` (duplicate column) is
//! logged as a warning rather than failing, so a second process racing
//! through startup converges instead of erroring.
//!
//! Migrations never touch `created_at`. A historical sync bug rewrote
//! creation times during metadata replication; the schema keeps the
//! column strictly insert-only.

use rusqlite::Connection;

use crate::{Error, Result};

/// A single migration with version and SQL.
#[derive(Debug, Clone, Copy)]
pub struct Migration {
    /// Migration version (sequential, starting at 1).
    pub version: i64,
    /// Human-readable description.
    pub description: &'static str,
    /// SQL to apply; may contain multiple statements separated by semicolons.
    pub sql: &'static str,
}

/// All migrations, in order.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "memories table with tombstones and timestamp indices",
        sql: "
            CREATE TABLE IF NOT EXISTS memories (
                content_hash TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                tags_csv TEXT NOT NULL DEFAULT '',
                memory_type TEXT,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                created_at REAL NOT NULL,
                created_at_iso TEXT NOT NULL,
                updated_at REAL NOT NULL,
                updated_at_iso TEXT NOT NULL,
                deleted_at REAL
            );
            CREATE INDEX IF NOT EXISTS idx_memories_deleted_at ON memories(deleted_at);
            CREATE INDEX IF NOT EXISTS idx_memories_created_at ON memories(created_at);
            CREATE INDEX IF NOT EXISTS idx_memories_memory_type ON memories(memory_type);
        ",
    },
    Migration {
        version: 2,
        description: "embedding vectors keyed by content hash",
        sql: "
            CREATE TABLE IF NOT EXISTS memory_embeddings (
                content_hash TEXT PRIMARY KEY
                    REFERENCES memories(content_hash) ON DELETE CASCADE,
                vector BLOB NOT NULL
            );
        ",
    },
    Migration {
        version: 3,
        description: "association graph with endpoint indices",
        sql: "
            CREATE TABLE IF NOT EXISTS memory_graph (
                source_hash TEXT NOT NULL,
                target_hash TEXT NOT NULL,
                relationship_type TEXT NOT NULL,
                similarity REAL NOT NULL,
                metadata_json TEXT NOT NULL DEFAULT '{}',
                PRIMARY KEY (source_hash, target_hash, relationship_type)
            );
            CREATE INDEX IF NOT EXISTS idx_graph_source ON memory_graph(source_hash);
            CREATE INDEX IF NOT EXISTS idx_graph_target ON memory_graph(target_hash);
            CREATE INDEX IF NOT EXISTS idx_graph_pair ON memory_graph(source_hash, target_hash);
        ",
    },
    Migration {
        version: 4,
        description: "numeric updated_at index for drift scans",
        sql: "
            CREATE INDEX IF NOT EXISTS idx_memories_updated_at ON memories(updated_at);
        ",
    },
];

/// Highest version across a set of migrations.
#[must_use]
pub fn max_version(migrations: &[Migration]) -> i64 {
    migrations.iter().map(|m| m.version).max().unwrap_or(0)
}

fn current_version(conn: &Connection) -> Result<i64> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| Error::Schema(format!("reading schema version: {e}")))
}

fn is_duplicate_object_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("duplicate column name") || lower.contains("already exists")
}

/// Applies all pending migrations.
///
/// A second initializer detects the completed schema via the version
/// table and skips DDL entirely.
///
/// # Errors
///
/// Returns [`Error::Schema`] if a migration statement fails for a reason
/// other than being already applied.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at REAL NOT NULL
        )",
    )
    .map_err(|e| Error::Schema(format!("creating schema_version table: {e}")))?;

    let applied = current_version(conn)?;
    let target = max_version(MIGRATIONS);
    if applied > target {
        return Err(Error::Schema(format!(
            "database schema version {applied} is newer than this build supports ({target})"
        )));
    }

    for migration in MIGRATIONS {
        if migration.version <= applied {
            continue;
        }
        apply_migration(conn, migration)?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, migration: &Migration) -> Result<()> {
    let begin = conn.execute_batch("BEGIN IMMEDIATE");
    begin.map_err(|e| Error::Schema(format!("migration v{} begin: {e}", migration.version)))?;

    for statement in migration.sql.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        if let Err(e) = conn.execute_batch(statement) {
            if is_duplicate_object_error(&e.to_string()) {
                tracing::warn!(
                    version = migration.version,
                    statement,
                    "migration statement already applied, skipping"
                );
                continue;
            }
            let _ = conn.execute_batch("ROLLBACK");
            return Err(Error::Schema(format!(
                "migration v{} ({}): {e}",
                migration.version, migration.description
            )));
        }
    }

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            migration.version,
            migration.description,
            crate::current_timestamp()
        ],
    )
    .map_err(|e| Error::Schema(format!("recording migration v{}: {e}", migration.version)))?;

    conn.execute_batch("COMMIT")
        .map_err(|e| Error::Schema(format!("migration v{} commit: {e}", migration.version)))?;

    tracing::info!(
        version = migration.version,
        description = migration.description,
        "applied migration"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_apply_cleanly() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), max_version(MIGRATIONS));
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(current_version(&conn).unwrap(), max_version(MIGRATIONS));
    }

    #[test]
    fn test_future_schema_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_version (version, description, applied_at) VALUES (999, 'future', 0.0)",
            [],
        )
        .unwrap();
        let err = run_migrations(&conn).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[test]
    fn test_duplicate_object_detection() {
        assert!(is_duplicate_object_error("duplicate column name: tags_csv"));
        assert!(is_duplicate_object_error("table memories already exists"));
        assert!(!is_duplicate_object_error("no such table: memories"));
    }

    #[test]
    fn test_versions_are_strictly_increasing() {
        for pair in MIGRATIONS.windows(2) {
            assert!(pair[0].version < pair[1].version);
        }
    }
}

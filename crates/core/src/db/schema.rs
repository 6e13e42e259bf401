//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The SQLite
//! `user_version` pragma tracks which migrations have already been applied.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "object stores and branch pointers",
        r#"
        CREATE TABLE IF NOT EXISTS blobs (
            digest      TEXT PRIMARY KEY,
            body        BLOB NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS trees (
            digest      TEXT PRIMARY KEY,
            body        BLOB NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS commits (
            digest      TEXT PRIMARY KEY,
            body        BLOB NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS branches (
            name            TEXT PRIMARY KEY,
            head            TEXT NOT NULL,
            parent_branch   TEXT,
            created_from    TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'active'
                            CHECK (status IN ('active', 'merged', 'deleted')),
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_branches_status ON branches (status);
        "#,
    ),
    (
        2,
        "merge operation audit log",
        r#"
        CREATE TABLE IF NOT EXISTS merge_operations (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            id          TEXT NOT NULL UNIQUE,
            source      TEXT NOT NULL,
            target      TEXT NOT NULL,
            strategy    TEXT NOT NULL,
            status      TEXT NOT NULL,
            body        TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_merge_operations_target ON merge_operations (target);
        "#,
    ),
    (
        3,
        "object dependency edges",
        r#"
        CREATE TABLE IF NOT EXISTS dependencies (
            object      TEXT NOT NULL,
            depends_on  TEXT NOT NULL,
            created_at  TEXT NOT NULL,
            PRIMARY KEY (object, depends_on)
        );

        CREATE INDEX IF NOT EXISTS idx_dependencies_depends_on ON dependencies (depends_on);
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! [`validate_schema`] checks the tables the store depends on so a damaged
//! or foreign database can be detected on open and rebuilt.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: log queue and metadata
    r#"
    CREATE TABLE IF NOT EXISTS logs (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        group_id         TEXT NOT NULL,
        log              TEXT NOT NULL,

        -- NULL while pending, set once claimed by a batch
        batch_id         TEXT,
        created_at       DATETIME NOT NULL
    );

    CREATE TABLE IF NOT EXISTS metadata (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_logs_group_pending ON logs(group_id, batch_id, id);
    CREATE INDEX IF NOT EXISTS idx_logs_batch ON logs(batch_id);
    "#,
    // Version 2: persisted batch timers
    r#"
    CREATE TABLE IF NOT EXISTS flush_timers (
        group_id         TEXT PRIMARY KEY,
        started_at       DATETIME NOT NULL
    );
    "#,
];

/// Tables and the columns the store reads or writes
const EXPECTED_TABLES: &[(&str, &[&str])] = &[
    ("logs", &["id", "group_id", "log", "batch_id", "created_at"]),
    ("metadata", &["key", "value"]),
    ("flush_timers", &["group_id", "started_at"]),
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);

    tracing::debug!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

/// Check that the schema matches what the store expects.
///
/// Returns a description of the first problem found.
pub fn validate_schema(conn: &Connection) -> std::result::Result<(), String> {
    let version = get_schema_version(conn).map_err(|e| e.to_string())?;
    if version != SCHEMA_VERSION {
        return Err(format!(
            "schema version {} does not match expected {}",
            version, SCHEMA_VERSION
        ));
    }

    for (table, expected) in EXPECTED_TABLES {
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info({})", table))
            .map_err(|e| e.to_string())?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| e.to_string())?
            .collect::<rusqlite::Result<_>>()
            .map_err(|e| e.to_string())?;

        if columns.is_empty() {
            return Err(format!("table {} is missing", table));
        }
        for column in *expected {
            if !columns.iter().any(|c| c == column) {
                return Err(format!("table {} is missing column {}", table, column));
            }
        }
    }

    Ok(())
}

/// Drop every table and rebuild the schema from scratch.
///
/// All queued logs are lost.
pub fn reset_schema(conn: &Connection) -> crate::error::Result<()> {
    conn.execute_batch(
        r#"
        DROP INDEX IF EXISTS idx_logs_group_pending;
        DROP INDEX IF EXISTS idx_logs_batch;
        DROP TABLE IF EXISTS flush_timers;
        DROP TABLE IF EXISTS metadata;
        DROP TABLE IF EXISTS logs;
        PRAGMA user_version = 0;
        "#,
    )?;
    run_migrations(conn)
}

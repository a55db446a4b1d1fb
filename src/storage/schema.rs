//! SQLite schema and migrations for the analysis store.

use rusqlite::{Connection, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 1;

/// Check whether the schema has been applied.
pub fn is_initialized(conn: &Connection) -> bool {
    conn.query_row(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'schema_version'",
        [],
        |_| Ok(()),
    )
    .is_ok()
}

/// Initialize the database schema.
pub fn initialize_schema(conn: &Connection) -> SqliteResult<()> {
    // WAL for better concurrent access
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        apply_v1_schema(conn)?;
        conn.execute("INSERT INTO schema_version (version) VALUES (1)", [])?;
    }

    Ok(())
}

fn apply_v1_schema(conn: &Connection) -> SqliteResult<()> {
    // Symbol index with optional 384-dim embedding stored as f32-LE blob
    conn.execute(
        "CREATE TABLE IF NOT EXISTS code_index (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            path TEXT NOT NULL,
            symbol TEXT NOT NULL,
            kind TEXT NOT NULL,
            line_start INTEGER NOT NULL,
            line_end INTEGER NOT NULL,
            language TEXT,
            embedding BLOB
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_code_index_symbol ON code_index(symbol)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_code_index_path ON code_index(path)",
        [],
    )?;

    // Content-addressed cache of generated explanations
    conn.execute(
        "CREATE TABLE IF NOT EXISTS code_understanding (
            fingerprint TEXT PRIMARY KEY,
            explanation TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            ttl_seconds INTEGER NOT NULL,
            hit_count INTEGER NOT NULL DEFAULT 0
        )",
        [],
    )?;

    // Append-only per-request event log
    conn.execute(
        "CREATE TABLE IF NOT EXISTS code_analysis_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            request_id TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_events_request ON code_analysis_events(request_id)",
        [],
    )?;

    // Serialized working-memory snapshots keyed by session
    conn.execute(
        "CREATE TABLE IF NOT EXISTS session_state (
            session_id TEXT PRIMARY KEY,
            state TEXT NOT NULL,
            updated_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    Ok(())
}

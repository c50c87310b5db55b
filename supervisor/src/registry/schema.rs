//! Database schema definitions

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Create all tables if they don't exist
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- One authoritative row per process name
        CREATE TABLE IF NOT EXISTS processes (
            name TEXT PRIMARY KEY,
            command TEXT NOT NULL,
            options TEXT NOT NULL,
            status TEXT NOT NULL,
            pid INTEGER,
            started_at TEXT,
            stopped_at TEXT,
            restart_count INTEGER NOT NULL DEFAULT 0,
            last_health_check TEXT,
            health_checked_at INTEGER,
            error_log TEXT
        );

        -- Health-driven restarts, for the rolling-hour quota
        CREATE TABLE IF NOT EXISTS restart_attempts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            attempted_at INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_restart_attempts_name
        ON restart_attempts(name, attempted_at);

        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        INSERT OR IGNORE INTO schema_version (version) VALUES (1);
        "#,
    )?;

    migrate(conn)
}

/// Bring a database created by an older build up to date
fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    if get_version(conn)? < 2 {
        let has_column: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_table_info('processes') WHERE name = 'health_checked_at'",
            [],
            |row| row.get(0),
        )?;
        if has_column == 0 {
            conn.execute_batch("ALTER TABLE processes ADD COLUMN health_checked_at INTEGER")?;
        }
        conn.execute("INSERT OR IGNORE INTO schema_version (version) VALUES (2)", [])?;
    }
    Ok(())
}

/// Get the current schema version
pub fn get_version(conn: &Connection) -> rusqlite::Result<i32> {
    conn.query_row(
        "SELECT version FROM schema_version ORDER BY version DESC LIMIT 1",
        [],
        |row| row.get(0),
    )
}

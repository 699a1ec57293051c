// Database migrations
// Migrations are forward-only. Never edit or delete a migration after it ships.

use rusqlite::Connection;
use anyhow::Result;

/// All migrations in order. Each migration is a SQL string.
const MIGRATIONS: &[&str] = &[
    // Migration 1: Segment ledger
    r#"
    CREATE TABLE segments (
        id TEXT PRIMARY KEY NOT NULL,
        file_name TEXT NOT NULL,
        file_path TEXT NOT NULL,
        file_size_bytes INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER NOT NULL DEFAULT 0,
        recorded_at TEXT NOT NULL,
        upload_status TEXT NOT NULL DEFAULT 'pending'
            CHECK (upload_status IN ('pending', 'uploading', 'completed', 'failed', 'skipped')),
        uploaded_at TEXT,
        upload_destination TEXT NOT NULL DEFAULT 'local_only'
            CHECK (upload_destination IN ('local_only', 'remote_folder')),
        remote_url TEXT,
        retry_count INTEGER NOT NULL DEFAULT 0,
        last_error TEXT
    );

    CREATE INDEX idx_segments_recorded_at ON segments(recorded_at);
    CREATE INDEX idx_segments_status_recorded ON segments(upload_status, recorded_at);
    "#,

    // Migration 2: Settings KV
    r#"
    CREATE TABLE IF NOT EXISTS app_settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL
    );
    "#,
];

/// Get current schema version from database
pub fn get_schema_version(conn: &Connection) -> Result<u32> {
    let version: u32 = conn.query_row(
        "PRAGMA user_version",
        [],
        |row| row.get(0)
    )?;
    Ok(version)
}

/// Number of migrations this build knows about
pub fn target_version() -> u32 {
    MIGRATIONS.len() as u32
}

/// Run all pending migrations (crash-safe)
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    let target_version = target_version();

    // Refuse to open a DB created by a newer build
    if current_version > target_version {
        anyhow::bail!(
            "Database schema version {} is newer than this build supports (max {}). Please upgrade Evidence Cam.",
            current_version,
            target_version
        );
    }

    if current_version == target_version {
        return Ok(());
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let migration_version = (i + 1) as u32;
        if migration_version <= current_version {
            continue;
        }

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration)?;
        tx.execute_batch(&format!("PRAGMA user_version = {}", migration_version))?;
        tx.commit()?;

        log::info!("Applied migration {}", migration_version);
    }

    Ok(())
}

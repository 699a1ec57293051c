// Database module

pub mod migrations;
pub mod schema;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use anyhow::Result;

use crate::constants::{DATA_DIR_ENV, DATA_DIR_NAME, DB_FILENAME, RECORDINGS_FOLDER};
use crate::error::EvidenceCamError;

/// Shared connection handle. Every ledger and settings operation runs under the
/// mutex, so single-row statements are linearizable across the recorder and the
/// upload worker.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database file and apply migrations.
    pub fn open(db_path: &Path) -> Result<Self> {
        Ok(Self { conn: Mutex::new(open_db(db_path)?) })
    }

    /// In-memory database with migrations applied.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        migrations::run_migrations(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Run `f` with exclusive access to the connection.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> crate::error::Result<T>,
    ) -> crate::error::Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| EvidenceCamError::Other("database mutex poisoned".to_string()))?;
        f(&guard)
    }
}

/// Open or create a database at the given path
pub fn open_db(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(db_path)?;

    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

    migrations::run_migrations(&conn)?;

    Ok(conn)
}

/// Resolve the data directory: explicit path, then $EVIDENCECAM_HOME, then ~/.evidencecam
pub fn resolve_data_dir(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Ok(v) = std::env::var(DATA_DIR_ENV) {
        if !v.is_empty() {
            return Ok(PathBuf::from(v));
        }
    }
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.home_dir().join(DATA_DIR_NAME))
}

/// Get the database path for a data directory
pub fn get_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join(DB_FILENAME)
}

/// Get the recordings folder for a data directory
pub fn get_recordings_dir(data_dir: &Path) -> PathBuf {
    data_dir.join(RECORDINGS_FOLDER)
}

/// Initialize data folder structure
pub fn init_data_folders(data_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(data_dir)?;
    std::fs::create_dir_all(get_recordings_dir(data_dir))?;
    Ok(())
}

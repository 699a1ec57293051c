// Database schema types and query helpers

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::Result;

// ----- Enums -----

#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Upload state of a finalized segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    Pending,
    Uploading,
    Completed,
    Failed,
    Skipped,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Completed => "completed",
            UploadStatus::Failed => "failed",
            UploadStatus::Skipped => "skipped",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "uploading" => Ok(UploadStatus::Uploading),
            "completed" => Ok(UploadStatus::Completed),
            "failed" => Ok(UploadStatus::Failed),
            "skipped" => Ok(UploadStatus::Skipped),
            other => Err(ParseEnumError { kind: "upload status", value: other.to_string() }),
        }
    }
}

/// Where finalized segments are sent. Local-only segments are never uploaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadDestination {
    #[default]
    LocalOnly,
    RemoteFolder,
}

impl UploadDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadDestination::LocalOnly => "local_only",
            UploadDestination::RemoteFolder => "remote_folder",
        }
    }

    pub fn is_local_only(&self) -> bool {
        matches!(self, UploadDestination::LocalOnly)
    }

    /// Initial ledger status for a segment created with this destination.
    pub fn initial_status(&self) -> UploadStatus {
        if self.is_local_only() {
            UploadStatus::Skipped
        } else {
            UploadStatus::Pending
        }
    }
}

impl fmt::Display for UploadDestination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UploadDestination {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "local_only" => Ok(UploadDestination::LocalOnly),
            "remote_folder" => Ok(UploadDestination::RemoteFolder),
            other => Err(ParseEnumError { kind: "upload destination", value: other.to_string() }),
        }
    }
}

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

sql_text_enum!(UploadStatus);
sql_text_enum!(UploadDestination);

// ----- Timestamps -----

/// Fixed-width RFC 3339 so that text ordering matches chronological ordering.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|d| d.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

// ----- Segment -----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size_bytes: i64,
    pub duration_ms: i64,
    pub recorded_at: DateTime<Utc>,
    pub upload_status: UploadStatus,
    pub uploaded_at: Option<DateTime<Utc>>,
    pub upload_destination: UploadDestination,
    pub remote_url: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

const SEGMENT_COLUMNS: &str = "id, file_name, file_path, file_size_bytes, duration_ms, recorded_at,
    upload_status, uploaded_at, upload_destination, remote_url, retry_count, last_error";

fn row_to_segment(row: &Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: row.get(0)?,
        file_name: row.get(1)?,
        file_path: row.get(2)?,
        file_size_bytes: row.get(3)?,
        duration_ms: row.get(4)?,
        recorded_at: parse_ts(row, 5)?,
        upload_status: row.get(6)?,
        uploaded_at: parse_opt_ts(row, 7)?,
        upload_destination: row.get(8)?,
        remote_url: row.get(9)?,
        retry_count: row.get(10)?,
        last_error: row.get(11)?,
    })
}

/// Ordering of `recorded_at` for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordedOrder {
    NewestFirst,
    OldestFirst,
}

impl RecordedOrder {
    fn sql(&self) -> &'static str {
        match self {
            RecordedOrder::NewestFirst => "DESC",
            RecordedOrder::OldestFirst => "ASC",
        }
    }
}

/// Insert a segment; an existing row with the same id is replaced.
pub fn insert_segment(conn: &Connection, seg: &Segment) -> Result<()> {
    conn.execute(
        "INSERT INTO segments (id, file_name, file_path, file_size_bytes, duration_ms, recorded_at,
                               upload_status, uploaded_at, upload_destination, remote_url,
                               retry_count, last_error)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
             file_name = excluded.file_name,
             file_path = excluded.file_path,
             file_size_bytes = excluded.file_size_bytes,
             duration_ms = excluded.duration_ms,
             recorded_at = excluded.recorded_at,
             upload_status = excluded.upload_status,
             uploaded_at = excluded.uploaded_at,
             upload_destination = excluded.upload_destination,
             remote_url = excluded.remote_url,
             retry_count = excluded.retry_count,
             last_error = excluded.last_error",
        params![
            seg.id,
            seg.file_name,
            seg.file_path,
            seg.file_size_bytes,
            seg.duration_ms,
            format_ts(&seg.recorded_at),
            seg.upload_status,
            seg.uploaded_at.as_ref().map(format_ts),
            seg.upload_destination,
            seg.remote_url,
            seg.retry_count,
            seg.last_error,
        ],
    )?;
    Ok(())
}

/// Overwrite every mutable column of an existing row. Returns false if the row is gone.
pub fn update_segment(conn: &Connection, seg: &Segment) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE segments SET file_name = ?2, file_path = ?3, file_size_bytes = ?4, duration_ms = ?5,
                recorded_at = ?6, upload_status = ?7, uploaded_at = ?8, upload_destination = ?9,
                remote_url = ?10, retry_count = ?11, last_error = ?12
         WHERE id = ?1",
        params![
            seg.id,
            seg.file_name,
            seg.file_path,
            seg.file_size_bytes,
            seg.duration_ms,
            format_ts(&seg.recorded_at),
            seg.upload_status,
            seg.uploaded_at.as_ref().map(format_ts),
            seg.upload_destination,
            seg.remote_url,
            seg.retry_count,
            seg.last_error,
        ],
    )?;
    Ok(rows > 0)
}

pub fn delete_segment_row(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute("DELETE FROM segments WHERE id = ?1", params![id])?;
    Ok(rows > 0)
}

pub fn delete_all_segment_rows(conn: &Connection) -> Result<usize> {
    Ok(conn.execute("DELETE FROM segments", [])?)
}

pub fn get_segment(conn: &Connection, id: &str) -> Result<Option<Segment>> {
    let sql = format!("SELECT {} FROM segments WHERE id = ?1", SEGMENT_COLUMNS);
    let result = conn.query_row(&sql, params![id], row_to_segment).optional()?;
    Ok(result)
}

pub fn list_segments(conn: &Connection, order: RecordedOrder, limit: Option<i64>) -> Result<Vec<Segment>> {
    let sql = format!(
        "SELECT {} FROM segments ORDER BY recorded_at {}, id {} LIMIT ?1",
        SEGMENT_COLUMNS,
        order.sql(),
        order.sql()
    );
    let mut stmt = conn.prepare(&sql)?;
    let segments = stmt
        .query_map(params![limit.unwrap_or(-1)], row_to_segment)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(segments)
}

/// Segments in one status, oldest first.
pub fn list_segments_by_status(conn: &Connection, status: UploadStatus, limit: Option<i64>) -> Result<Vec<Segment>> {
    let sql = format!(
        "SELECT {} FROM segments WHERE upload_status = ?1 ORDER BY recorded_at ASC, id ASC LIMIT ?2",
        SEGMENT_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let segments = stmt
        .query_map(params![status, limit.unwrap_or(-1)], row_to_segment)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(segments)
}

pub fn get_oldest_segment(conn: &Connection) -> Result<Option<Segment>> {
    Ok(list_segments(conn, RecordedOrder::OldestFirst, Some(1))?.into_iter().next())
}

/// Oldest segment the quota may evict. Rows being uploaded are protected.
pub fn get_oldest_evictable_segment(conn: &Connection) -> Result<Option<Segment>> {
    let sql = format!(
        "SELECT {} FROM segments WHERE upload_status != 'uploading' ORDER BY recorded_at ASC, id ASC LIMIT 1",
        SEGMENT_COLUMNS
    );
    let segment = conn.query_row(&sql, [], row_to_segment).optional()?;
    Ok(segment)
}

/// Delete a row unless an upload claimed it in the meantime.
pub fn delete_evictable_segment_row(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "DELETE FROM segments WHERE id = ?1 AND upload_status != 'uploading'",
        params![id],
    )?;
    Ok(rows > 0)
}

pub fn count_segments(conn: &Connection) -> Result<i64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM segments", [], |row| row.get(0))?;
    Ok(count)
}

pub fn sum_file_size(conn: &Connection) -> Result<i64> {
    let total: i64 = conn.query_row(
        "SELECT COALESCE(SUM(file_size_bytes), 0) FROM segments",
        [],
        |row| row.get(0),
    )?;
    Ok(total)
}

pub fn count_by_status(conn: &Connection) -> Result<Vec<(UploadStatus, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT upload_status, COUNT(*) FROM segments GROUP BY upload_status ORDER BY upload_status"
    )?;
    let counts = stmt
        .query_map([], |row| Ok((row.get::<_, UploadStatus>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(counts)
}

// ----- Upload state transitions -----
// Every transition names the status it expects to leave, so a stale caller
// cannot move a row backwards.

/// Uploading -> Pending for every row (crash recovery). retry_count is untouched.
pub fn reset_stuck_uploads(conn: &Connection) -> Result<usize> {
    let rows = conn.execute(
        "UPDATE segments SET upload_status = 'pending' WHERE upload_status = 'uploading'",
        [],
    )?;
    Ok(rows)
}

/// Pending -> Uploading
pub fn mark_uploading(conn: &Connection, id: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE segments SET upload_status = 'uploading' WHERE id = ?1 AND upload_status = 'pending'",
        params![id],
    )?;
    Ok(rows > 0)
}

/// Uploading -> Completed
pub fn mark_uploaded(conn: &Connection, id: &str, remote_url: &str, uploaded_at: &DateTime<Utc>) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE segments SET upload_status = 'completed', uploaded_at = ?2, remote_url = ?3, last_error = NULL
         WHERE id = ?1 AND upload_status = 'uploading'",
        params![id, format_ts(uploaded_at), remote_url],
    )?;
    Ok(rows > 0)
}

/// {Pending, Uploading} -> Failed, retry_count untouched
pub fn mark_failed(conn: &Connection, id: &str, error: &str) -> Result<bool> {
    let rows = conn.execute(
        "UPDATE segments SET upload_status = 'failed', last_error = ?2
         WHERE id = ?1 AND upload_status IN ('pending', 'uploading')",
        params![id, error],
    )?;
    Ok(rows > 0)
}

/// {Pending, Uploading} -> Pending with retry_count + 1, or Failed once the
/// incremented count reaches `max_retries`. Returns the resulting status, or
/// None if the row was gone or not in an uploadable state.
pub fn record_retry(conn: &Connection, id: &str, error: &str, max_retries: i32) -> Result<Option<UploadStatus>> {
    let status = conn.query_row(
        "UPDATE segments
         SET retry_count = retry_count + 1,
             last_error = ?2,
             upload_status = CASE WHEN retry_count + 1 >= ?3 THEN 'failed' ELSE 'pending' END
         WHERE id = ?1 AND upload_status IN ('pending', 'uploading')
         RETURNING upload_status",
        params![id, error, max_retries],
        |row| row.get::<_, UploadStatus>(0),
    ).optional()?;
    Ok(status)
}

// ----- Settings KV -----

pub fn get_setting(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn.query_row(
        "SELECT value FROM app_settings WHERE key = ?1",
        [key],
        |row| row.get(0),
    ).optional()?;
    Ok(value)
}

/// Set a setting value (upsert).
pub fn set_setting(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO app_settings (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn setup_test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::migrations::run_migrations(&conn).unwrap();
        conn
    }

    fn segment(id: &str, minute: u32, status: UploadStatus) -> Segment {
        Segment {
            id: id.to_string(),
            file_name: format!("{}.mp4", id),
            file_path: format!("/rec/{}.mp4", id),
            file_size_bytes: 1000,
            duration_ms: 30_000,
            recorded_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            upload_status: status,
            uploaded_at: None,
            upload_destination: UploadDestination::RemoteFolder,
            remote_url: None,
            retry_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_insert_and_get_roundtrip_fields() {
        let conn = setup_test_db();
        let seg = segment("a", 1, UploadStatus::Pending);
        insert_segment(&conn, &seg).unwrap();
        let loaded = get_segment(&conn, "a").unwrap().unwrap();
        assert_eq!(loaded, seg);
        assert!(get_segment(&conn, "missing").unwrap().is_none());
    }

    #[test]
    fn test_insert_same_id_replaces() {
        let conn = setup_test_db();
        let mut seg = segment("a", 1, UploadStatus::Pending);
        insert_segment(&conn, &seg).unwrap();
        seg.file_size_bytes = 4242;
        insert_segment(&conn, &seg).unwrap();
        assert_eq!(count_segments(&conn).unwrap(), 1);
        assert_eq!(get_segment(&conn, "a").unwrap().unwrap().file_size_bytes, 4242);
    }

    #[test]
    fn test_list_orders() {
        let conn = setup_test_db();
        insert_segment(&conn, &segment("mid", 5, UploadStatus::Pending)).unwrap();
        insert_segment(&conn, &segment("old", 1, UploadStatus::Skipped)).unwrap();
        insert_segment(&conn, &segment("new", 9, UploadStatus::Pending)).unwrap();

        let newest: Vec<String> = list_segments(&conn, RecordedOrder::NewestFirst, None)
            .unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(newest, vec!["new", "mid", "old"]);

        let pending: Vec<String> = list_segments_by_status(&conn, UploadStatus::Pending, Some(1))
            .unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(pending, vec!["mid"]);

        assert_eq!(get_oldest_segment(&conn).unwrap().unwrap().id, "old");
        assert_eq!(sum_file_size(&conn).unwrap(), 3000);
    }

    #[test]
    fn test_transitions_are_forward_only() {
        let conn = setup_test_db();
        insert_segment(&conn, &segment("a", 1, UploadStatus::Pending)).unwrap();

        // Completed requires Uploading first
        assert!(!mark_uploaded(&conn, "a", "url", &Utc::now()).unwrap());
        assert!(mark_uploading(&conn, "a").unwrap());
        assert!(!mark_uploading(&conn, "a").unwrap());
        assert!(mark_uploaded(&conn, "a", "url", &Utc::now()).unwrap());

        // Completed rows cannot fail or retry
        assert!(!mark_failed(&conn, "a", "late").unwrap());
        assert_eq!(record_retry(&conn, "a", "late", 5).unwrap(), None);

        let seg = get_segment(&conn, "a").unwrap().unwrap();
        assert_eq!(seg.upload_status, UploadStatus::Completed);
        assert_eq!(seg.remote_url.as_deref(), Some("url"));
        assert!(seg.uploaded_at.is_some());
    }

    #[test]
    fn test_record_retry_caps_at_max() {
        let conn = setup_test_db();
        let mut seg = segment("a", 1, UploadStatus::Uploading);
        seg.retry_count = 3;
        insert_segment(&conn, &seg).unwrap();

        assert_eq!(record_retry(&conn, "a", "timeout", 5).unwrap(), Some(UploadStatus::Pending));
        assert!(mark_uploading(&conn, "a").unwrap());
        assert_eq!(record_retry(&conn, "a", "timeout", 5).unwrap(), Some(UploadStatus::Failed));

        let seg = get_segment(&conn, "a").unwrap().unwrap();
        assert_eq!(seg.retry_count, 5);
        assert_eq!(seg.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_reset_stuck_uploads_keeps_retry_count() {
        let conn = setup_test_db();
        let mut seg = segment("a", 1, UploadStatus::Uploading);
        seg.retry_count = 2;
        insert_segment(&conn, &seg).unwrap();
        insert_segment(&conn, &segment("b", 2, UploadStatus::Completed)).unwrap();

        assert_eq!(reset_stuck_uploads(&conn).unwrap(), 1);
        let seg = get_segment(&conn, "a").unwrap().unwrap();
        assert_eq!(seg.upload_status, UploadStatus::Pending);
        assert_eq!(seg.retry_count, 2);
        assert_eq!(get_segment(&conn, "b").unwrap().unwrap().upload_status, UploadStatus::Completed);
    }

    #[test]
    fn test_settings_kv_upsert() {
        let conn = setup_test_db();
        assert!(get_setting(&conn, "k").unwrap().is_none());
        set_setting(&conn, "k", "1").unwrap();
        set_setting(&conn, "k", "2").unwrap();
        assert_eq!(get_setting(&conn, "k").unwrap().as_deref(), Some("2"));
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("failed".parse::<UploadStatus>().unwrap(), UploadStatus::Failed);
        assert!("FAILED".parse::<UploadStatus>().is_err());
        assert_eq!(UploadDestination::LocalOnly.initial_status(), UploadStatus::Skipped);
        assert_eq!(UploadDestination::RemoteFolder.initial_status(), UploadStatus::Pending);
    }
}

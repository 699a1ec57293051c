// Storage ledger -- the durable record of every finalized segment.
//
// Rows are only ever written for fully finalized files. All mutations are single
// statements under the database mutex, so the recorder and the upload worker can
// share one ledger without any further locking.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use crate::constants::UPLOAD_MAX_RETRIES;
use crate::db::schema::{self, RecordedOrder, Segment, UploadStatus};
use crate::db::Database;
use crate::error::{EvidenceCamError, Result};

#[derive(Clone)]
pub struct Ledger {
    db: Arc<Database>,
}

impl Ledger {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn insert(&self, segment: &Segment) -> Result<()> {
        self.db.with_conn(|c| schema::insert_segment(c, segment))
    }

    pub fn update(&self, segment: &Segment) -> Result<()> {
        let updated = self.db.with_conn(|c| schema::update_segment(c, segment))?;
        if !updated {
            return Err(EvidenceCamError::SegmentNotFound(segment.id.clone()));
        }
        Ok(())
    }

    /// Remove only the row. Use `delete_segment` to also remove the file.
    pub fn delete(&self, id: &str) -> Result<bool> {
        self.db.with_conn(|c| schema::delete_segment_row(c, id))
    }

    pub fn get(&self, id: &str) -> Result<Option<Segment>> {
        self.db.with_conn(|c| schema::get_segment(c, id))
    }

    /// Display order.
    pub fn list_newest_first(&self, limit: Option<i64>) -> Result<Vec<Segment>> {
        self.db.with_conn(|c| schema::list_segments(c, RecordedOrder::NewestFirst, limit))
    }

    /// Eviction and upload-queue order.
    pub fn list_oldest_first(&self, limit: Option<i64>) -> Result<Vec<Segment>> {
        self.db.with_conn(|c| schema::list_segments(c, RecordedOrder::OldestFirst, limit))
    }

    pub fn list_by_status(&self, status: UploadStatus) -> Result<Vec<Segment>> {
        self.db.with_conn(|c| schema::list_segments_by_status(c, status, None))
    }

    /// Up to `limit` Pending segments, oldest first.
    pub fn pending_batch(&self, limit: usize) -> Result<Vec<Segment>> {
        self.db
            .with_conn(|c| schema::list_segments_by_status(c, UploadStatus::Pending, Some(limit as i64)))
    }

    pub fn oldest(&self) -> Result<Option<Segment>> {
        self.db.with_conn(schema::get_oldest_segment)
    }

    /// Oldest segment not currently being uploaded.
    pub fn oldest_evictable(&self) -> Result<Option<Segment>> {
        self.db.with_conn(schema::get_oldest_evictable_segment)
    }

    pub fn count(&self) -> Result<i64> {
        self.db.with_conn(schema::count_segments)
    }

    pub fn sum_file_size(&self) -> Result<i64> {
        self.db.with_conn(schema::sum_file_size)
    }

    pub fn count_by_status(&self) -> Result<Vec<(UploadStatus, i64)>> {
        self.db.with_conn(schema::count_by_status)
    }

    /// Any row left in Uploading has no live worker behind it; put it back in the queue.
    pub fn reset_stuck_uploads(&self) -> Result<usize> {
        let reset = self.db.with_conn(schema::reset_stuck_uploads)?;
        if reset > 0 {
            log::warn!("Reset {} stuck upload(s) back to pending", reset);
        }
        Ok(reset)
    }

    pub fn mark_uploading(&self, id: &str) -> Result<bool> {
        self.db.with_conn(|c| schema::mark_uploading(c, id))
    }

    pub fn mark_uploaded(&self, id: &str, remote_url: &str) -> Result<bool> {
        let now = Utc::now();
        self.db.with_conn(|c| schema::mark_uploaded(c, id, remote_url, &now))
    }

    /// Permanent failure; retry_count is not touched.
    pub fn mark_failed(&self, id: &str, error: &str) -> Result<bool> {
        self.db.with_conn(|c| schema::mark_failed(c, id, error))
    }

    /// Transient failure. Returns the resulting status (Pending, or Failed once the cap is hit).
    pub fn record_retry(&self, id: &str, error: &str) -> Result<Option<UploadStatus>> {
        self.db
            .with_conn(|c| schema::record_retry(c, id, error, UPLOAD_MAX_RETRIES))
    }

    /// Delete the backing file, then the row. The row goes even if the file
    /// delete fails; the ledger stays authoritative and the file is left as an
    /// orphan for `quota::purge_orphans`.
    pub fn delete_segment(&self, segment: &Segment) -> Result<()> {
        remove_backing_file(Path::new(&segment.file_path));
        self.delete(&segment.id)?;
        log::info!("Deleted segment {} ({})", segment.id, segment.file_name);
        Ok(())
    }

    /// Quota eviction: drop the row only if no upload holds it, then the file.
    /// Returns false (and touches nothing) if the row is gone or Uploading.
    pub fn evict(&self, segment: &Segment) -> Result<bool> {
        let removed = self.db.with_conn(|c| schema::delete_evictable_segment_row(c, &segment.id))?;
        if removed {
            remove_backing_file(Path::new(&segment.file_path));
            log::info!("Evicted segment {} ({})", segment.id, segment.file_name);
        }
        Ok(removed)
    }

    /// Delete every segment and its file. Returns the number of rows removed.
    pub fn delete_all(&self) -> Result<usize> {
        let segments = self.list_oldest_first(None)?;
        for seg in &segments {
            remove_backing_file(Path::new(&seg.file_path));
        }
        self.db.with_conn(schema::delete_all_segment_rows)
    }
}

fn remove_backing_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not delete {}: {} (left as orphan)", path.display(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::UploadDestination;
    use chrono::{Duration, TimeZone};

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn segment_at(dir: &Path, id: &str, offset_secs: i64) -> Segment {
        let path = dir.join(format!("{}.mp4", id));
        std::fs::write(&path, vec![0u8; 100]).unwrap();
        Segment {
            id: id.to_string(),
            file_name: format!("{}.mp4", id),
            file_path: path.to_string_lossy().to_string(),
            file_size_bytes: 100,
            duration_ms: 1000,
            recorded_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(offset_secs),
            upload_status: UploadStatus::Pending,
            uploaded_at: None,
            upload_destination: UploadDestination::RemoteFolder,
            remote_url: None,
            retry_count: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_delete_segment_removes_file_and_row() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let seg = segment_at(dir.path(), "a", 0);
        ledger.insert(&seg).unwrap();

        ledger.delete_segment(&seg).unwrap();
        assert!(ledger.get("a").unwrap().is_none());
        assert!(!Path::new(&seg.file_path).exists());
    }

    #[test]
    fn test_delete_segment_with_missing_file_still_drops_row() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let seg = segment_at(dir.path(), "a", 0);
        std::fs::remove_file(&seg.file_path).unwrap();
        ledger.insert(&seg).unwrap();

        ledger.delete_segment(&seg).unwrap();
        assert_eq!(ledger.count().unwrap(), 0);
    }

    #[test]
    fn test_update_missing_row_errors() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let seg = segment_at(dir.path(), "ghost", 0);
        assert!(matches!(ledger.update(&seg), Err(EvidenceCamError::SegmentNotFound(_))));
    }

    #[test]
    fn test_pending_batch_and_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            ledger.insert(&segment_at(dir.path(), id, 10 - i as i64)).unwrap();
        }
        let batch: Vec<String> = ledger.pending_batch(2).unwrap().into_iter().map(|s| s.id).collect();
        assert_eq!(batch, vec!["b", "a"]);
        assert_eq!(ledger.oldest().unwrap().unwrap().id, "b");
        assert_eq!(ledger.sum_file_size().unwrap(), 300);
    }

    #[test]
    fn test_evict_refuses_claimed_upload() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let seg = segment_at(dir.path(), "a", 0);
        ledger.insert(&seg).unwrap();
        assert!(ledger.mark_uploading("a").unwrap());

        assert!(!ledger.evict(&seg).unwrap());
        assert!(ledger.get("a").unwrap().is_some());
        assert!(Path::new(&seg.file_path).exists());
        assert!(ledger.oldest_evictable().unwrap().is_none());

        ledger.record_retry("a", "timeout").unwrap();
        assert!(ledger.evict(&seg).unwrap());
        assert!(!Path::new(&seg.file_path).exists());
    }

    #[test]
    fn test_delete_all() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = ledger();
        let a = segment_at(dir.path(), "a", 0);
        let b = segment_at(dir.path(), "b", 1);
        ledger.insert(&a).unwrap();
        ledger.insert(&b).unwrap();

        assert_eq!(ledger.delete_all().unwrap(), 2);
        assert!(!Path::new(&a.file_path).exists());
        assert!(!Path::new(&b.file_path).exists());
    }
}

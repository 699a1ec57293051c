// Storage quota enforcement and storage accounting.
//
// The enforcer only ever looks at ledger rows. The segment currently being
// recorded has no row yet, so it can never be evicted.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use walkdir::WalkDir;

use crate::constants::{NEAR_FULL_PERCENT, SEGMENT_FILE_EXTENSION};
use crate::error::{EvidenceCamError, Result};
use crate::ledger::Ledger;

/// Raw filesystem capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskSpace {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

pub trait SpaceProbe: Send + Sync {
    fn disk_space(&self) -> Result<DiskSpace>;
}

/// statvfs on the filesystem holding the recordings directory.
pub struct StatvfsProbe {
    root: PathBuf,
}

impl StatvfsProbe {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl SpaceProbe for StatvfsProbe {
    fn disk_space(&self) -> Result<DiskSpace> {
        let v = nix::sys::statvfs::statvfs(&self.root).map_err(|e| {
            EvidenceCamError::Io(std::io::Error::from_raw_os_error(e as i32))
        })?;
        let fragment = v.fragment_size() as u64;
        Ok(DiskSpace {
            total_bytes: v.blocks() as u64 * fragment,
            available_bytes: v.blocks_available() as u64 * fragment,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageInfo {
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub recordings_count: i64,
    pub recordings_size: i64,
}

impl StorageInfo {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.used_bytes as f64 / self.total_bytes as f64) * 100.0
    }

    pub fn is_near_full(&self) -> bool {
        self.used_percent() >= NEAR_FULL_PERCENT
    }
}

#[derive(Clone)]
pub struct QuotaEnforcer {
    ledger: Ledger,
    probe: Arc<dyn SpaceProbe>,
}

impl QuotaEnforcer {
    pub fn new(ledger: Ledger, probe: Arc<dyn SpaceProbe>) -> Self {
        Self { ledger, probe }
    }

    pub fn storage_info(&self) -> Result<StorageInfo> {
        let space = self.probe.disk_space()?;
        Ok(StorageInfo {
            total_bytes: space.total_bytes,
            used_bytes: space.total_bytes.saturating_sub(space.available_bytes),
            available_bytes: space.available_bytes,
            recordings_count: self.ledger.count()?,
            recordings_size: self.ledger.sum_file_size()?,
        })
    }

    /// Delete the oldest segment, one at a time, until used space drops below
    /// `max_percent` or nothing evictable is left. Returns the number deleted.
    ///
    /// Segments in Uploading are skipped. The threshold is trusted as given;
    /// clamping happens in settings.
    pub fn enforce(&self, max_percent: u8) -> Result<usize> {
        let threshold = f64::from(max_percent);
        let mut deleted = 0;

        loop {
            let info = self.storage_info()?;
            if info.used_percent() < threshold {
                break;
            }

            let oldest = match self.ledger.oldest_evictable()? {
                Some(seg) => seg,
                None => {
                    let protected = self.ledger.count()?;
                    log::warn!(
                        "Storage at {:.1}% (limit {}%) but no segments left to evict ({} uploading)",
                        info.used_percent(),
                        max_percent,
                        protected
                    );
                    break;
                }
            };

            log::info!(
                "Storage at {:.1}% (limit {}%), evicting {} recorded at {}",
                info.used_percent(),
                max_percent,
                oldest.file_name,
                oldest.recorded_at
            );
            // An upload may claim the row between the read and the delete
            if self.ledger.evict(&oldest)? {
                deleted += 1;
            }
        }

        if deleted > 0 {
            log::info!("Quota cleanup deleted {} segment(s)", deleted);
        }
        Ok(deleted)
    }
}

/// Segment-looking files in `recordings_dir` that have no ledger row.
/// `exclude` is the file currently being written, if any.
pub fn scan_orphans(recordings_dir: &Path, ledger: &Ledger, exclude: Option<&Path>) -> Result<Vec<PathBuf>> {
    let known: HashSet<PathBuf> = ledger
        .list_oldest_first(None)?
        .into_iter()
        .map(|s| PathBuf::from(s.file_path))
        .collect();

    let mut orphans = Vec::new();
    for entry in WalkDir::new(recordings_dir).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let is_segment = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(SEGMENT_FILE_EXTENSION))
            .unwrap_or(false);
        if !is_segment || known.contains(path) || exclude == Some(path) {
            continue;
        }
        orphans.push(path.to_path_buf());
    }
    orphans.sort();
    Ok(orphans)
}

/// Delete orphaned files. Returns how many were removed.
pub fn purge_orphans(recordings_dir: &Path, ledger: &Ledger, exclude: Option<&Path>) -> Result<usize> {
    let mut removed = 0;
    for path in scan_orphans(recordings_dir, ledger, exclude)? {
        match std::fs::remove_file(&path) {
            Ok(()) => {
                log::info!("Removed orphaned file {}", path.display());
                removed += 1;
            }
            Err(e) => log::warn!("Could not remove orphan {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}

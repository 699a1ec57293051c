// Segment file naming

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::constants::{SEGMENT_FILE_EXTENSION, SEGMENT_FILE_PREFIX, SEGMENT_TIMESTAMP_FORMAT};

/// `EvidenceCam_2024-01-31_13-45-00`
pub fn segment_stem(started: DateTime<Local>) -> String {
    format!("{}{}", SEGMENT_FILE_PREFIX, started.format(SEGMENT_TIMESTAMP_FORMAT))
}

/// First free path for a segment starting at `started`. Appends `_1`, `_2`, ...
/// when segments start within the same second.
pub fn next_segment_path(dir: &Path, started: DateTime<Local>) -> PathBuf {
    let stem = segment_stem(started);
    let candidate = dir.join(format!("{}.{}", stem, SEGMENT_FILE_EXTENSION));
    if !candidate.exists() {
        return candidate;
    }

    let mut counter = 1;
    loop {
        let candidate = dir.join(format!("{}_{}.{}", stem, counter, SEGMENT_FILE_EXTENSION));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

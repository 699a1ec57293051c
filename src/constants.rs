// Evidence Cam Constants
// Defaults for the recorder, quota and upload pipeline. Persisted settings override
// the user-facing ones; the rest are fixed policy.

// Paths
pub const DATA_DIR_NAME: &str = ".evidencecam";
pub const DATA_DIR_ENV: &str = "EVIDENCECAM_HOME";
pub const DB_FILENAME: &str = "evidencecam.db";
pub const RECORDINGS_FOLDER: &str = "recordings";

// Segment files
pub const SEGMENT_FILE_PREFIX: &str = "EvidenceCam_";
pub const SEGMENT_FILE_EXTENSION: &str = "mp4";
pub const SEGMENT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";
pub const OVERLAY_SUFFIX: &str = "_overlay";
pub const OVERLAY_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const OVERLAY_NO_LOCATION: &str = "GPS: N/A";

// Segment duration presets (seconds)
pub const SEGMENT_DURATION_PRESETS_SECS: [u64; 6] = [15, 30, 60, 120, 300, 600];
pub const DEFAULT_SEGMENT_DURATION_SECS: u64 = 120;

// Elapsed-duration observable refresh
pub const ELAPSED_TICK_MS: u64 = 1000;

// Storage quota
pub const DEFAULT_MAX_STORAGE_PERCENT: u8 = 90;
pub const MIN_STORAGE_PERCENT: u8 = 50;
pub const MAX_STORAGE_PERCENT: u8 = 95;
pub const NEAR_FULL_PERCENT: f64 = 90.0;

// Upload pipeline
pub const UPLOAD_BATCH_SIZE: usize = 5;
pub const UPLOAD_MAX_RETRIES: i32 = 5;
pub const UPLOAD_BASE_BACKOFF_SECONDS: u64 = 60;
pub const UPLOAD_MAX_BACKOFF_SECONDS: u64 = 3600;
pub const UPLOAD_QUOTA_BACKOFF_MULTIPLIER: u32 = 4;
pub const UPLOAD_BACKOFF_JITTER_MS: u64 = 5000;

// Copy verification
pub const HASH_CHUNK_SIZE: usize = 1_048_576; // 1MB

// Settings keys (app_settings table)
pub const SETTINGS_KEY: &str = "settings";
pub const SETTINGS_VERSION_KEY: &str = "settings_version";

// Logging
pub const DEFAULT_LOG_FILTER: &str = "info,evidence_cam_lib=info";

// Recording and upload settings.
//
// Persisted as JSON in the app_settings KV table together with a version counter
// that bumps on every save. The recorder and the upload pipeline read a snapshot
// at cycle boundaries; a save mid-segment only affects the next segment.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_MAX_STORAGE_PERCENT, DEFAULT_SEGMENT_DURATION_SECS, MAX_STORAGE_PERCENT,
    MIN_STORAGE_PERCENT, SEGMENT_DURATION_PRESETS_SECS, SETTINGS_KEY, SETTINGS_VERSION_KEY,
};
use crate::db::schema::{self, UploadDestination};
use crate::db::Database;
use crate::error::{EvidenceCamError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Sd,
    #[default]
    Hd,
    Fhd,
}

impl VideoQuality {
    pub fn width(&self) -> u32 {
        match self {
            VideoQuality::Sd => 854,
            VideoQuality::Hd => 1280,
            VideoQuality::Fhd => 1920,
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            VideoQuality::Sd => 480,
            VideoQuality::Hd => 720,
            VideoQuality::Fhd => 1080,
        }
    }

    pub fn bitrate(&self) -> u32 {
        match self {
            VideoQuality::Sd => 2_000_000,
            VideoQuality::Hd => 5_000_000,
            VideoQuality::Fhd => 10_000_000,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            VideoQuality::Sd => "SD (480p)",
            VideoQuality::Hd => "HD (720p)",
            VideoQuality::Fhd => "Full HD (1080p)",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub upload_destination: UploadDestination,
    pub video_quality: VideoQuality,
    pub segment_duration_ms: u64,
    pub max_storage_percent: u8,
    pub upload_on_wifi_only: bool,
    pub enable_audio: bool,
    pub auto_delete_after_upload: bool,
    pub remote_folder: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            upload_destination: UploadDestination::LocalOnly,
            video_quality: VideoQuality::Hd,
            segment_duration_ms: DEFAULT_SEGMENT_DURATION_SECS * 1000,
            max_storage_percent: DEFAULT_MAX_STORAGE_PERCENT,
            upload_on_wifi_only: false,
            enable_audio: true,
            auto_delete_after_upload: false,
            remote_folder: None,
        }
    }
}

impl Settings {
    pub fn segment_duration(&self) -> Duration {
        Duration::from_millis(self.segment_duration_ms)
    }

    /// Clamp the quota threshold and check the segment duration preset.
    pub fn normalized(mut self) -> Result<Self> {
        self.max_storage_percent = clamp_storage_percent(self.max_storage_percent);
        let secs = self.segment_duration_ms / 1000;
        if self.segment_duration_ms % 1000 != 0 || !SEGMENT_DURATION_PRESETS_SECS.contains(&secs) {
            return Err(EvidenceCamError::Config(format!(
                "segment duration {}ms is not one of the presets {:?} (seconds)",
                self.segment_duration_ms, SEGMENT_DURATION_PRESETS_SECS
            )));
        }
        Ok(self)
    }
}

pub fn clamp_storage_percent(percent: u8) -> u8 {
    percent.clamp(MIN_STORAGE_PERCENT, MAX_STORAGE_PERCENT)
}

/// A settings value tagged with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct SettingsSnapshot {
    pub version: u64,
    pub settings: Settings,
}

/// Read-only view used by the recorder and the upload pipeline.
pub trait SettingsSource: Send + Sync {
    fn snapshot(&self) -> Result<SettingsSnapshot>;
}

/// Fixed settings, never persisted.
pub struct StaticSettings(pub Settings);

impl SettingsSource for StaticSettings {
    fn snapshot(&self) -> Result<SettingsSnapshot> {
        Ok(SettingsSnapshot { version: 0, settings: self.0.clone() })
    }
}

/// Settings persisted in the app_settings table.
#[derive(Clone)]
pub struct SettingsStore {
    db: Arc<Database>,
}

impl SettingsStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn load(&self) -> Result<SettingsSnapshot> {
        self.db.with_conn(|conn| {
            let settings = match schema::get_setting(conn, SETTINGS_KEY)? {
                Some(raw) => serde_json::from_str::<Settings>(&raw).unwrap_or_else(|e| {
                    log::warn!("Stored settings unreadable ({}), using defaults", e);
                    Settings::default()
                }),
                None => Settings::default(),
            };
            let version = schema::get_setting(conn, SETTINGS_VERSION_KEY)?
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            Ok(SettingsSnapshot { version, settings })
        })
    }

    /// Validate, persist and bump the version. Returns the stored snapshot.
    pub fn save(&self, settings: Settings) -> Result<SettingsSnapshot> {
        let settings = settings.normalized()?;
        let json = serde_json::to_string(&settings)?;
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let version = schema::get_setting(&tx, SETTINGS_VERSION_KEY)?
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            schema::set_setting(&tx, SETTINGS_KEY, &json)?;
            schema::set_setting(&tx, SETTINGS_VERSION_KEY, &version.to_string())?;
            tx.commit()?;
            log::info!("Saved settings version {}", version);
            Ok(SettingsSnapshot { version, settings })
        })
    }

    /// Load, apply `f`, save.
    pub fn update(&self, f: impl FnOnce(&mut Settings)) -> Result<SettingsSnapshot> {
        let mut settings = self.load()?.settings;
        f(&mut settings);
        self.save(settings)
    }
}

impl SettingsSource for SettingsStore {
    fn snapshot(&self) -> Result<SettingsSnapshot> {
        self.load()
    }
}

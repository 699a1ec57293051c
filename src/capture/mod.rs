// External collaborators of the segment recorder: capture device, overlay
// renderer, duration probe, location source and keep-awake resource.
//
// Each one is a trait so the recorder can be driven by ffmpeg in production and
// by in-process fakes in tests.

pub mod ffmpeg;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::constants::{OVERLAY_NO_LOCATION, OVERLAY_TIMESTAMP_FORMAT};
use crate::error::Result;
use crate::settings::VideoQuality;

pub use ffmpeg::{FfmpegCapture, FfmpegOverlay, FfprobeDuration};

/// Opaque token for one in-progress capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureHandle {
    pub token: u64,
    pub output: PathBuf,
}

/// Result of stopping a capture. `error` set means the file must not be trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    pub file: PathBuf,
    pub duration_hint_ms: Option<u64>,
    pub error: Option<String>,
}

impl Finalized {
    pub fn ok(file: PathBuf, duration_hint_ms: Option<u64>) -> Self {
        Self { file, duration_hint_ms, error: None }
    }

    pub fn failed(file: PathBuf, error: impl Into<String>) -> Self {
        Self { file, duration_hint_ms: None, error: Some(error.into()) }
    }
}

pub trait CaptureDevice: Send {
    /// Bind the device for the given quality. Called once per recording session.
    fn prepare(&mut self, quality: VideoQuality) -> Result<()>;

    fn start_capture(&mut self, output: &Path, audio_enabled: bool) -> Result<CaptureHandle>;

    /// Stop and wait for the file to be finalized.
    fn stop(&mut self, handle: CaptureHandle) -> Finalized;

    /// Non-blocking health check while recording. `Some(message)` means the
    /// device died underneath the current segment.
    fn poll_failure(&mut self) -> Option<String> {
        None
    }

    fn release(&mut self);
}

pub trait OverlayRenderer: Send {
    /// Burn the timestamp/location text into `file`. Returns the final file.
    /// On error the original file is left untouched.
    fn burn_overlay(&self, file: &Path, recorded_at: DateTime<Local>, location: Option<Location>) -> Result<PathBuf>;
}

pub trait MediaProbe: Send {
    fn duration_ms(&self, file: &Path) -> Option<u64>;
}

pub trait LocationSource: Send {
    fn start(&self) {}
    fn stop(&self) {}
    fn current_location(&self) -> Option<Location>;
}

pub trait KeepAwake: Send {
    fn acquire(&mut self);
    fn release(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// `12.345678N 98.765432W`
    pub fn overlay_line(&self) -> String {
        let ns = if self.latitude >= 0.0 { 'N' } else { 'S' };
        let ew = if self.longitude >= 0.0 { 'E' } else { 'W' };
        format!(
            "{:.6}{} {:.6}{}",
            self.latitude.abs(),
            ns,
            self.longitude.abs(),
            ew
        )
    }
}

/// The two overlay lines: local timestamp, then coordinates or a placeholder.
pub fn overlay_lines(recorded_at: DateTime<Local>, location: Option<Location>) -> (String, String) {
    let ts = recorded_at.format(OVERLAY_TIMESTAMP_FORMAT).to_string();
    let loc = location
        .map(|l| l.overlay_line())
        .unwrap_or_else(|| OVERLAY_NO_LOCATION.to_string());
    (ts, loc)
}

/// Location source that always reports the same (possibly absent) fix.
pub struct FixedLocation(pub Option<Location>);

impl LocationSource for FixedLocation {
    fn current_location(&self) -> Option<Location> {
        self.0
    }
}

/// Keep-awake for hosts that never sleep mid-recording.
#[derive(Default)]
pub struct NoKeepAwake {
    held: bool,
}

impl KeepAwake for NoKeepAwake {
    fn acquire(&mut self) {
        if !self.held {
            log::debug!("keep-awake acquired");
            self.held = true;
        }
    }

    fn release(&mut self) {
        if self.held {
            log::debug!("keep-awake released");
            self.held = false;
        }
    }
}

/// Everything the recorder needs from the outside world.
pub struct Collaborators {
    pub capture: Box<dyn CaptureDevice>,
    pub overlay: Box<dyn OverlayRenderer>,
    pub probe: Box<dyn MediaProbe>,
    pub location: Box<dyn LocationSource>,
    pub keep_awake: Box<dyn KeepAwake>,
}

impl Collaborators {
    /// ffmpeg-backed capture, overlay and probe.
    pub fn ffmpeg(capture: FfmpegCapture, location: Option<Location>) -> Self {
        Self {
            capture: Box::new(capture),
            overlay: Box::new(FfmpegOverlay),
            probe: Box::new(FfprobeDuration),
            location: Box::new(FixedLocation(location)),
            keep_awake: Box::new(NoKeepAwake::default()),
        }
    }
}

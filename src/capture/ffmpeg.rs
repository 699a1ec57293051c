// ffmpeg/ffprobe-backed capture, overlay burn-in and duration probe

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};

use chrono::{DateTime, Local};
use serde::Deserialize;

use super::{overlay_lines, CaptureDevice, CaptureHandle, Finalized, Location, MediaProbe, OverlayRenderer};
use crate::constants::OVERLAY_SUFFIX;
use crate::error::{EvidenceCamError, Result};
use crate::settings::VideoQuality;
use crate::tools::Tool;

/// Input device as ffmpeg sees it, e.g. `v4l2` + `/dev/video0`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputSpec {
    pub format: String,
    pub device: String,
}

impl InputSpec {
    pub fn new(format: impl Into<String>, device: impl Into<String>) -> Self {
        Self { format: format.into(), device: device.into() }
    }
}

struct ActiveCapture {
    token: u64,
    child: Child,
}

pub struct FfmpegCapture {
    video: InputSpec,
    audio: Option<InputSpec>,
    quality: VideoQuality,
    active: Option<ActiveCapture>,
    next_token: u64,
}

impl FfmpegCapture {
    pub fn new(video: InputSpec, audio: Option<InputSpec>) -> Self {
        Self {
            video,
            audio,
            quality: VideoQuality::default(),
            active: None,
            next_token: 1,
        }
    }

    fn build_args(&self, output: &Path, audio_enabled: bool) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-y".into(),
            "-f".into(),
            self.video.format.clone(),
            "-i".into(),
            self.video.device.clone(),
        ];

        let audio = self.audio.as_ref().filter(|_| audio_enabled);
        if let Some(a) = audio {
            args.extend(["-f".into(), a.format.clone(), "-i".into(), a.device.clone()]);
        }

        args.extend([
            "-vf".into(),
            format!(
                "scale={}:{}:force_original_aspect_ratio=decrease,pad=ceil(iw/2)*2:ceil(ih/2)*2",
                self.quality.width(),
                self.quality.height()
            ),
            "-c:v".into(),
            "libx264".into(),
            "-preset".into(),
            "veryfast".into(),
            "-b:v".into(),
            self.quality.bitrate().to_string(),
            "-pix_fmt".into(),
            "yuv420p".into(),
        ]);

        if audio.is_some() {
            args.extend(["-c:a".into(), "aac".into(), "-b:a".into(), "128k".into()]);
        } else {
            args.push("-an".into());
        }

        args.extend(["-movflags".into(), "+faststart".into()]);
        args.push(output.to_string_lossy().to_string());
        args
    }
}

impl CaptureDevice for FfmpegCapture {
    fn prepare(&mut self, quality: VideoQuality) -> Result<()> {
        if !Tool::Ffmpeg.is_available() {
            return Err(EvidenceCamError::Capture("ffmpeg not found".to_string()));
        }
        self.quality = quality;
        log::info!(
            "Capture prepared: {} {} at {}",
            self.video.format,
            self.video.device,
            quality.display_name()
        );
        Ok(())
    }

    fn start_capture(&mut self, output: &Path, audio_enabled: bool) -> Result<CaptureHandle> {
        if self.active.is_some() {
            return Err(EvidenceCamError::Capture("a capture is already running".to_string()));
        }

        let child = Tool::Ffmpeg.command()
            .args(self.build_args(output, audio_enabled))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EvidenceCamError::Capture(format!("Failed to start ffmpeg: {}", e)))?;

        let token = self.next_token;
        self.next_token += 1;
        self.active = Some(ActiveCapture { token, child });
        log::debug!("ffmpeg capture {} writing {}", token, output.display());

        Ok(CaptureHandle { token, output: output.to_path_buf() })
    }

    fn stop(&mut self, handle: CaptureHandle) -> Finalized {
        let mut active = match self.active.take() {
            Some(a) if a.token == handle.token => a,
            other => {
                self.active = other;
                return Finalized::failed(handle.output, "unknown capture handle");
            }
        };

        // ffmpeg finishes the container cleanly on 'q'
        if let Some(mut stdin) = active.child.stdin.take() {
            let _ = stdin.write_all(b"q\n");
        }

        let output = match active.child.wait_with_output() {
            Ok(o) => o,
            Err(e) => return Finalized::failed(handle.output, format!("ffmpeg wait failed: {}", e)),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Finalized::failed(handle.output, format!("ffmpeg exited with {}: {}", output.status, stderr.trim()));
        }

        match std::fs::metadata(&handle.output) {
            Ok(m) if m.len() > 0 => Finalized::ok(handle.output, None),
            _ => Finalized::failed(handle.output, "ffmpeg produced no output"),
        }
    }

    fn poll_failure(&mut self) -> Option<String> {
        let active = self.active.as_mut()?;
        match active.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                self.active = None;
                Some(format!("ffmpeg capture exited unexpectedly ({})", status))
            }
            Err(e) => Some(format!("ffmpeg capture unreachable: {}", e)),
        }
    }

    fn release(&mut self) {
        if let Some(mut active) = self.active.take() {
            log::warn!("Killing leftover ffmpeg capture {}", active.token);
            let _ = active.child.kill();
            let _ = active.child.wait();
        }
    }
}

/// Escape text for use inside a drawtext `text='...'` value.
fn escape_drawtext(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' | ':' | '%' => {
                out.push('\\');
                out.push(c);
            }
            '\'' => out.push_str("'\\''"),
            _ => out.push(c),
        }
    }
    out
}

/// Two boxed text lines in the bottom-left corner.
fn overlay_filter(line1: &str, line2: &str) -> String {
    let style = "fontsize=24:fontcolor=white:box=1:boxcolor=black@0.5:boxborderw=6";
    format!(
        "drawtext=text='{}':{}:x=16:y=h-72,drawtext=text='{}':{}:x=16:y=h-40",
        escape_drawtext(line1),
        style,
        escape_drawtext(line2),
        style
    )
}

fn overlay_temp_path(file: &Path) -> PathBuf {
    let stem = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = file
        .extension()
        .map(|e| e.to_string_lossy().to_string())
        .unwrap_or_else(|| "mp4".to_string());
    file.with_file_name(format!("{}{}.{}", stem, OVERLAY_SUFFIX, ext))
}

pub struct FfmpegOverlay;

impl OverlayRenderer for FfmpegOverlay {
    fn burn_overlay(&self, file: &Path, recorded_at: DateTime<Local>, location: Option<Location>) -> Result<PathBuf> {
        let (line1, line2) = overlay_lines(recorded_at, location);
        let tmp_path = overlay_temp_path(file);

        let output = Tool::Ffmpeg.command()
            .args(["-hide_banner", "-loglevel", "error", "-y", "-i"])
            .arg(file)
            .args(["-vf", &overlay_filter(&line1, &line2)])
            .args(["-c:v", "libx264", "-preset", "veryfast", "-c:a", "copy", "-movflags", "+faststart"])
            .arg(&tmp_path)
            .output()
            .map_err(|e| EvidenceCamError::Overlay(format!("Failed to run ffmpeg: {}", e)))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&tmp_path);
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(EvidenceCamError::Overlay(format!("drawtext failed: {}", stderr.trim())));
        }

        if let Err(e) = std::fs::rename(&tmp_path, file) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(EvidenceCamError::Overlay(format!("could not replace original: {}", e)));
        }

        Ok(file.to_path_buf())
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: Option<FfprobeFormat>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

fn parse_duration_ms(raw: &[u8]) -> Option<u64> {
    let parsed: FfprobeOutput = serde_json::from_slice(raw).ok()?;
    let secs: f64 = parsed.format?.duration?.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some((secs * 1000.0).round() as u64)
    } else {
        None
    }
}

pub struct FfprobeDuration;

impl MediaProbe for FfprobeDuration {
    fn duration_ms(&self, file: &Path) -> Option<u64> {
        let output = Tool::Ffprobe.command()
            .args(["-v", "quiet", "-print_format", "json", "-show_format"])
            .arg(file)
            .output()
            .map_err(|e| log::warn!("ffprobe failed to run on {}: {}", file.display(), e))
            .ok()?;

        if !output.status.success() {
            log::debug!("ffprobe could not read {}", file.display());
            return None;
        }
        parse_duration_ms(&output.stdout)
    }
}

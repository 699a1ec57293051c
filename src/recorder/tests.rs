// Recorder state machine tests driven by in-process fakes

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use super::*;
use crate::capture::{CaptureDevice, CaptureHandle, Finalized, KeepAwake, Location, LocationSource, MediaProbe, OverlayRenderer};
use crate::db::schema::{UploadDestination, UploadStatus};
use crate::db::Database;
use crate::events::Event;
use crate::quota::{DiskSpace, SpaceProbe};
use crate::settings::{StaticSettings, VideoQuality};

const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct CaptureLog {
    prepared: usize,
    started: Vec<PathBuf>,
    stopped: Vec<PathBuf>,
    released: usize,
    active: bool,
    overlapped: bool,
}

struct FakeCapture {
    log: Arc<Mutex<CaptureLog>>,
    fail_prepare: Arc<AtomicBool>,
    die: Arc<AtomicBool>,
    hint_ms: Option<u64>,
    next: u64,
}

impl CaptureDevice for FakeCapture {
    fn prepare(&mut self, _quality: VideoQuality) -> crate::error::Result<()> {
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(EvidenceCamError::Capture("camera unavailable".into()));
        }
        self.log.lock().unwrap().prepared += 1;
        Ok(())
    }

    fn start_capture(&mut self, output: &Path, _audio_enabled: bool) -> crate::error::Result<CaptureHandle> {
        let mut log = self.log.lock().unwrap();
        if log.active {
            log.overlapped = true;
        }
        std::fs::write(output, vec![0u8; 1024])?;
        log.active = true;
        log.started.push(output.to_path_buf());
        self.next += 1;
        Ok(CaptureHandle { token: self.next, output: output.to_path_buf() })
    }

    fn stop(&mut self, handle: CaptureHandle) -> Finalized {
        let mut log = self.log.lock().unwrap();
        log.active = false;
        log.stopped.push(handle.output.clone());
        Finalized::ok(handle.output, self.hint_ms)
    }

    fn poll_failure(&mut self) -> Option<String> {
        if self.die.load(Ordering::SeqCst) {
            Some("usb camera disconnected".into())
        } else {
            None
        }
    }

    fn release(&mut self) {
        self.log.lock().unwrap().released += 1;
    }
}

struct FakeOverlay {
    fail: bool,
    calls: Arc<AtomicUsize>,
}

impl OverlayRenderer for FakeOverlay {
    fn burn_overlay(&self, file: &Path, _recorded_at: DateTime<Local>, _location: Option<Location>) -> crate::error::Result<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(EvidenceCamError::Overlay("no font".into()));
        }
        let mut bytes = std::fs::read(file)?;
        bytes.extend_from_slice(b"overlay");
        std::fs::write(file, bytes)?;
        Ok(file.to_path_buf())
    }
}

struct FakeProbe(Option<u64>);

impl MediaProbe for FakeProbe {
    fn duration_ms(&self, _file: &Path) -> Option<u64> {
        self.0
    }
}

struct FakeLocation {
    running: Arc<AtomicBool>,
}

impl LocationSource for FakeLocation {
    fn start(&self) {
        self.running.store(true, Ordering::SeqCst);
    }
    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
    fn current_location(&self) -> Option<Location> {
        Some(Location::new(51.5, -0.12))
    }
}

struct FakeKeepAwake {
    held: Arc<AtomicBool>,
}

impl KeepAwake for FakeKeepAwake {
    fn acquire(&mut self) {
        self.held.store(true, Ordering::SeqCst);
    }
    fn release(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

struct RoomyDisk;

impl SpaceProbe for RoomyDisk {
    fn disk_space(&self) -> crate::error::Result<DiskSpace> {
        Ok(DiskSpace { total_bytes: 1 << 40, available_bytes: 1 << 39 })
    }
}

struct Opts {
    segment_ms: u64,
    destination: UploadDestination,
    overlay_fails: bool,
    probe_ms: Option<u64>,
    hint_ms: Option<u64>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            segment_ms: 150,
            destination: UploadDestination::LocalOnly,
            overlay_fails: false,
            probe_ms: Some(30_000),
            hint_ms: Some(1234),
        }
    }
}

struct Harness {
    recorder: Recorder,
    handle: RecorderHandle,
    ledger: Ledger,
    events: Receiver<Event>,
    capture: Arc<Mutex<CaptureLog>>,
    fail_prepare: Arc<AtomicBool>,
    die: Arc<AtomicBool>,
    keep_awake: Arc<AtomicBool>,
    location_running: Arc<AtomicBool>,
    overlay_calls: Arc<AtomicUsize>,
    _dir: tempfile::TempDir,
}

fn harness(opts: Opts) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::new(Arc::new(Database::open_in_memory().unwrap()));
    let quota = QuotaEnforcer::new(ledger.clone(), Arc::new(RoomyDisk));
    let settings = Settings {
        segment_duration_ms: opts.segment_ms,
        upload_destination: opts.destination,
        ..Settings::default()
    };

    let capture = Arc::new(Mutex::new(CaptureLog::default()));
    let fail_prepare = Arc::new(AtomicBool::new(false));
    let die = Arc::new(AtomicBool::new(false));
    let keep_awake = Arc::new(AtomicBool::new(false));
    let location_running = Arc::new(AtomicBool::new(false));
    let overlay_calls = Arc::new(AtomicUsize::new(0));

    let collaborators = Collaborators {
        capture: Box::new(FakeCapture {
            log: Arc::clone(&capture),
            fail_prepare: Arc::clone(&fail_prepare),
            die: Arc::clone(&die),
            hint_ms: opts.hint_ms,
            next: 0,
        }),
        overlay: Box::new(FakeOverlay { fail: opts.overlay_fails, calls: Arc::clone(&overlay_calls) }),
        probe: Box::new(FakeProbe(opts.probe_ms)),
        location: Box::new(FakeLocation { running: Arc::clone(&location_running) }),
        keep_awake: Box::new(FakeKeepAwake { held: Arc::clone(&keep_awake) }),
    };

    let events = EventBus::new();
    let event_rx = events.subscribe();
    let recorder = Recorder::spawn(RecorderDeps {
        ledger: ledger.clone(),
        quota,
        settings: Arc::new(StaticSettings(settings)),
        collaborators,
        events,
        recordings_dir: dir.path().join("recordings"),
    })
    .unwrap();
    let handle = recorder.handle();

    Harness {
        recorder,
        handle,
        ledger,
        events: event_rx,
        capture,
        fail_prepare,
        die,
        keep_awake,
        location_running,
        overlay_calls,
        _dir: dir,
    }
}

fn wait_for<T: Clone>(rx: &Receiver<T>, pred: impl Fn(&T) -> bool) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        let left = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(left) {
            Ok(v) if pred(&v) => return v,
            Ok(_) => continue,
            Err(_) => panic!("condition not reached within {:?}", WAIT),
        }
    }
}

fn is_idle(s: &RecordingState) -> bool {
    *s == RecordingState::Idle
}

#[test]
fn test_rollover_records_segments_and_advances_index() {
    let h = harness(Opts::default());
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();

    wait_for(&states, |s| s.segment_index() == Some(2));
    // Row for segment 1 is written before the index advances
    let first = h.ledger.list_oldest_first(Some(1)).unwrap().remove(0);
    assert_eq!(first.duration_ms, 30_000);
    assert_eq!(first.upload_status, UploadStatus::Skipped);
    assert_eq!(first.upload_destination, UploadDestination::LocalOnly);
    assert_eq!(first.file_size_bytes, 1024 + 7);
    assert!(first.file_name.starts_with("EvidenceCam_"));
    assert!(Path::new(&first.file_path).exists());

    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);

    let log = h.capture.lock().unwrap();
    assert!(!log.overlapped);
    assert_eq!(log.prepared, 1);
    assert_eq!(log.started, log.stopped);
    assert_eq!(h.ledger.count().unwrap() as usize, log.started.len());
    assert!(log.started.len() >= 2);
    assert_eq!(h.overlay_calls.load(Ordering::SeqCst), log.started.len());
    assert!(!h.keep_awake.load(Ordering::SeqCst));
    assert!(!h.location_running.load(Ordering::SeqCst));
    assert!(h.handle.active_file().is_none());
}

#[test]
fn test_remote_destination_inserts_pending() {
    let h = harness(Opts {
        segment_ms: 60_000,
        destination: UploadDestination::RemoteFolder,
        ..Opts::default()
    });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);

    let rows = h.ledger.list_newest_first(None).unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].upload_status, UploadStatus::Pending);
    assert_eq!(rows[0].retry_count, 0);

    let events: Vec<Event> = h.events.try_iter().collect();
    assert!(events.contains(&Event::SegmentCompleted {
        id: rows[0].id.clone(),
        destination: UploadDestination::RemoteFolder,
    }));
}

#[test]
fn test_stop_before_timer_produces_single_segment() {
    let h = harness(Opts { segment_ms: 60_000, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.segment_index() == Some(1));
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);

    assert_eq!(h.ledger.count().unwrap(), 1);
    let events: Vec<Event> = h.events.try_iter().collect();
    assert_eq!(events.first(), Some(&Event::RecordingStarted));
    assert_eq!(events.get(1), Some(&Event::SegmentStarted { index: 1 }));
    assert_eq!(events.last(), Some(&Event::RecordingStopped));
    assert!(!events.contains(&Event::SegmentStarted { index: 2 }));
}

#[test]
fn test_overlay_failure_keeps_original_file() {
    let h = harness(Opts { segment_ms: 60_000, overlay_fails: true, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);

    let seg = h.ledger.list_newest_first(None).unwrap().remove(0);
    let started = h.capture.lock().unwrap().started[0].clone();
    assert_eq!(PathBuf::from(&seg.file_path), started);
    assert_eq!(seg.file_size_bytes, 1024);
}

#[test]
fn test_duration_falls_back_to_hint_then_configured() {
    let h = harness(Opts { segment_ms: 60_000, probe_ms: None, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);
    assert_eq!(h.ledger.list_newest_first(None).unwrap()[0].duration_ms, 1234);

    let h = harness(Opts { segment_ms: 60_000, probe_ms: None, hint_ms: None, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);
    assert_eq!(h.ledger.list_newest_first(None).unwrap()[0].duration_ms, 60_000);
}

#[test]
fn test_prepare_failure_parks_in_error_until_retry() {
    let h = harness(Opts { segment_ms: 60_000, ..Opts::default() });
    h.fail_prepare.store(true, Ordering::SeqCst);
    let states = h.handle.subscribe_state().unwrap();

    h.handle.request_start().unwrap();
    let state = wait_for(&states, |s| matches!(s, RecordingState::Error { .. }));
    assert_eq!(state, RecordingState::Error { message: "Capture error: camera unavailable".into() });
    assert!(!h.keep_awake.load(Ordering::SeqCst));
    assert!(h
        .events
        .try_iter()
        .any(|e| matches!(e, Event::RecordingError { .. })));

    // Stop while parked in Error changes nothing
    h.handle.request_stop().unwrap();

    h.fail_prepare.store(false, Ordering::SeqCst);
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());
    assert!(h.keep_awake.load(Ordering::SeqCst));
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);
    assert_eq!(h.ledger.count().unwrap(), 1);
}

#[test]
fn test_device_failure_mid_segment_enters_error() {
    let h = harness(Opts { segment_ms: 60_000, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());

    h.die.store(true, Ordering::SeqCst);
    wait_for(&states, |s| matches!(s, RecordingState::Error { .. }));

    // The interrupted segment never reaches the ledger
    assert_eq!(h.ledger.count().unwrap(), 0);
    assert!(!h.keep_awake.load(Ordering::SeqCst));
    assert!(h.capture.lock().unwrap().released >= 1);
}

#[test]
fn test_second_start_while_recording_is_ignored() {
    let h = harness(Opts { segment_ms: 60_000, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);

    let log = h.capture.lock().unwrap();
    assert_eq!(log.prepared, 1);
    assert_eq!(log.started.len(), 1);
}

#[test]
fn test_elapsed_ticks_while_recording() {
    let h = harness(Opts { segment_ms: 60_000, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    let elapsed = h.handle.subscribe_elapsed().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());

    let seen = wait_for(&elapsed, |d| *d >= Duration::from_millis(900));
    assert!(seen < Duration::from_secs(60));
    h.handle.request_stop().unwrap();
    wait_for(&states, is_idle);
}

#[test]
fn test_shutdown_finalizes_open_segment_and_kills_handle() {
    let h = harness(Opts { segment_ms: 60_000, ..Opts::default() });
    let states = h.handle.subscribe_state().unwrap();
    h.handle.request_start().unwrap();
    wait_for(&states, |s| s.is_recording());
    assert!(lookup().is_some());

    let handle = h.handle.clone();
    h.recorder.shutdown();

    assert_eq!(h.ledger.count().unwrap(), 1);
    assert!(matches!(handle.request_start(), Err(EvidenceCamError::RecorderGone)));
    assert!(handle.state().is_err());
}

// Segment recorder -- the record/rollover/finalize state machine.
//
// A single actor thread owns the capture device and the segment timer. Start
// and stop requests arrive over a channel; the timer is a deadline the actor
// waits on with recv_timeout, so cancelling it is just dropping the session.
// A timer can never fire into a later state.

pub mod segment;

#[cfg(test)]
mod tests;

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, LazyLock, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, Utc};
use serde::Serialize;

use crate::capture::{CaptureHandle, Collaborators, Finalized};
use crate::constants::ELAPSED_TICK_MS;
use crate::db::schema::Segment;
use crate::error::{EvidenceCamError, Result};
use crate::events::{Event, EventBus};
use crate::ledger::Ledger;
use crate::observe::Observable;
use crate::quota::QuotaEnforcer;
use crate::settings::{Settings, SettingsSource};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum RecordingState {
    Idle,
    Starting,
    #[serde(rename_all = "camelCase")]
    Recording {
        segment_index: u32,
        segment_start: DateTime<Utc>,
        total_start: DateTime<Utc>,
    },
    Stopping,
    Error { message: String },
}

impl RecordingState {
    pub fn is_recording(&self) -> bool {
        matches!(self, RecordingState::Recording { .. })
    }

    pub fn segment_index(&self) -> Option<u32> {
        match self {
            RecordingState::Recording { segment_index, .. } => Some(*segment_index),
            _ => None,
        }
    }
}

enum Command {
    Start,
    Stop,
    Shutdown,
}

struct Shared {
    commands: Sender<Command>,
    state: Observable<RecordingState>,
    elapsed: Observable<Duration>,
    active_file: Arc<Mutex<Option<PathBuf>>>,
}

static REGISTRY: LazyLock<Mutex<Vec<Weak<Shared>>>> = LazyLock::new(|| Mutex::new(Vec::new()));

/// Handle to the most recently spawned recorder that is still running.
pub fn lookup() -> Option<RecorderHandle> {
    let mut live = REGISTRY.lock().unwrap_or_else(|p| p.into_inner());
    live.retain(|w| w.strong_count() > 0);
    live.last().map(|w| RecorderHandle { shared: w.clone() })
}

/// Non-owning handle. Calls fail with `RecorderGone` once the recorder shut down.
#[derive(Clone)]
pub struct RecorderHandle {
    shared: Weak<Shared>,
}

impl RecorderHandle {
    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(EvidenceCamError::RecorderGone)
    }

    fn send(&self, cmd: Command) -> Result<()> {
        self.shared()?
            .commands
            .send(cmd)
            .map_err(|_| EvidenceCamError::RecorderGone)
    }

    pub fn request_start(&self) -> Result<()> {
        self.send(Command::Start)
    }

    pub fn request_stop(&self) -> Result<()> {
        self.send(Command::Stop)
    }

    pub fn state(&self) -> Result<RecordingState> {
        Ok(self.shared()?.state.get())
    }

    pub fn subscribe_state(&self) -> Result<Receiver<RecordingState>> {
        Ok(self.shared()?.state.subscribe())
    }

    pub fn subscribe_elapsed(&self) -> Result<Receiver<Duration>> {
        Ok(self.shared()?.elapsed.subscribe())
    }

    /// File currently being written, excluded from orphan scans.
    pub fn active_file(&self) -> Option<PathBuf> {
        let shared = self.shared.upgrade()?;
        let guard = shared.active_file.lock().unwrap_or_else(|p| p.into_inner());
        guard.clone()
    }
}

pub struct RecorderDeps {
    pub ledger: Ledger,
    pub quota: QuotaEnforcer,
    pub settings: Arc<dyn SettingsSource>,
    pub collaborators: Collaborators,
    pub events: EventBus,
    pub recordings_dir: PathBuf,
}

/// Owner of the recorder thread. Dropping it stops any recording and joins the thread.
pub struct Recorder {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Recorder {
    pub fn spawn(deps: RecorderDeps) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            commands: tx,
            state: Observable::new(RecordingState::Idle),
            elapsed: Observable::new(Duration::ZERO),
            active_file: Arc::new(Mutex::new(None)),
        });

        let actor = Actor {
            ledger: deps.ledger,
            quota: deps.quota,
            settings: deps.settings,
            collab: deps.collaborators,
            events: deps.events,
            recordings_dir: deps.recordings_dir,
            state: shared.state.clone(),
            elapsed: shared.elapsed.clone(),
            active_file: Arc::clone(&shared.active_file),
            session: None,
        };

        let thread = std::thread::Builder::new()
            .name("segment-recorder".into())
            .spawn(move || actor.run(rx))?;

        let mut live = REGISTRY.lock().unwrap_or_else(|p| p.into_inner());
        live.retain(|w| w.strong_count() > 0);
        live.push(Arc::downgrade(&shared));
        drop(live);

        Ok(Self { shared, thread: Some(thread) })
    }

    pub fn handle(&self) -> RecorderHandle {
        RecorderHandle { shared: Arc::downgrade(&self.shared) }
    }

    /// Stop recording (finalizing the open segment) and join the thread.
    pub fn shutdown(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.shared.commands.send(Command::Shutdown);
            if thread.join().is_err() {
                log::error!("Recorder thread panicked");
            }
        }
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        self.join();
    }
}

struct ActiveSegment {
    handle: CaptureHandle,
    started_at: DateTime<Utc>,
    deadline: Instant,
    settings: Settings,
}

struct Session {
    index: u32,
    total_start: DateTime<Utc>,
    total_started: Instant,
    next_tick: Instant,
    current: ActiveSegment,
}

struct Actor {
    ledger: Ledger,
    quota: QuotaEnforcer,
    settings: Arc<dyn SettingsSource>,
    collab: Collaborators,
    events: EventBus,
    recordings_dir: PathBuf,
    state: Observable<RecordingState>,
    elapsed: Observable<Duration>,
    active_file: Arc<Mutex<Option<PathBuf>>>,
    session: Option<Session>,
}

impl Actor {
    fn run(mut self, rx: Receiver<Command>) {
        log::info!("Recorder thread started");
        loop {
            let wakeup = self
                .session
                .as_ref()
                .map(|s| s.current.deadline.min(s.next_tick));

            let cmd = match wakeup {
                None => rx.recv().unwrap_or(Command::Shutdown),
                Some(at) => match rx.recv_timeout(at.saturating_duration_since(Instant::now())) {
                    Ok(cmd) => cmd,
                    Err(RecvTimeoutError::Timeout) => {
                        self.on_timer();
                        continue;
                    }
                    Err(RecvTimeoutError::Disconnected) => Command::Shutdown,
                },
            };

            match cmd {
                Command::Start => self.start(),
                Command::Stop => self.stop(),
                Command::Shutdown => {
                    self.stop();
                    break;
                }
            }
        }
        log::info!("Recorder thread exiting");
    }

    fn on_timer(&mut self) {
        let now = Instant::now();
        let (deadline_hit, tick_hit) = match &self.session {
            Some(s) => (now >= s.current.deadline, now >= s.next_tick),
            None => return,
        };

        if tick_hit {
            if let Some(message) = self.collab.capture.poll_failure() {
                self.fail(message);
                return;
            }
            if let Some(session) = self.session.as_mut() {
                self.elapsed.set(session.total_started.elapsed());
                let tick = Duration::from_millis(ELAPSED_TICK_MS);
                session.next_tick += tick;
                if session.next_tick <= now {
                    session.next_tick = now + tick;
                }
            }
        }

        if deadline_hit {
            self.rollover();
        }
    }

    fn start(&mut self) {
        match self.state.get() {
            RecordingState::Idle | RecordingState::Error { .. } => {}
            other => {
                log::debug!("Start ignored in state {:?}", other);
                return;
            }
        }
        self.state.set(RecordingState::Starting);

        let settings = match self.settings.snapshot() {
            Ok(snap) => snap.settings,
            Err(e) => return self.fail(format!("Settings unavailable: {}", e)),
        };

        self.collab.keep_awake.acquire();
        self.collab.location.start();
        self.enforce_quota(settings.max_storage_percent);

        if let Err(e) = self.collab.capture.prepare(settings.video_quality) {
            return self.fail(e.to_string());
        }

        let current = match self.open_segment(settings) {
            Ok(seg) => seg,
            Err(e) => return self.fail(e.to_string()),
        };

        let now = Instant::now();
        self.session = Some(Session {
            index: 1,
            total_start: current.started_at,
            total_started: now,
            next_tick: now + Duration::from_millis(ELAPSED_TICK_MS),
            current,
        });
        self.elapsed.set(Duration::ZERO);
        self.publish_recording();

        log::info!("Recording started");
        self.events.emit(Event::RecordingStarted);
        self.events.emit(Event::SegmentStarted { index: 1 });
    }

    fn rollover(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        let previous = session.current.settings.clone();
        let finished = self.finish_segment(session.current);
        if let Err(e) = finished {
            return self.fail(e.to_string());
        }

        // Settings are re-read at each segment boundary
        let settings = match self.settings.snapshot() {
            Ok(snap) => snap.settings,
            Err(e) => {
                log::warn!("Settings unavailable at rollover, reusing previous: {}", e);
                previous
            }
        };
        self.enforce_quota(settings.max_storage_percent);

        session.current = match self.open_segment(settings) {
            Ok(seg) => seg,
            Err(e) => return self.fail(e.to_string()),
        };
        session.index += 1;
        let index = session.index;
        self.session = Some(session);
        self.publish_recording();

        log::info!("Rolled over to segment {}", index);
        self.events.emit(Event::SegmentStarted { index });
    }

    fn stop(&mut self) {
        let Some(session) = self.session.take() else {
            log::debug!("Stop ignored in state {:?}", self.state.get());
            return;
        };
        self.state.set(RecordingState::Stopping);

        let threshold = session.current.settings.max_storage_percent;
        if let Err(e) = self.finish_segment(session.current) {
            return self.fail(e.to_string());
        }
        self.enforce_quota(threshold);

        self.release_resources();
        self.elapsed.set(Duration::ZERO);

        log::info!("Recording stopped after {} segment(s)", session.index);
        self.events.emit(Event::RecordingStopped);
        self.state.set(RecordingState::Idle);
    }

    fn fail(&mut self, message: String) {
        log::error!("Recording error: {}", message);
        if let Some(session) = self.session.take() {
            // Partial file is left for the orphan scan
            let _ = self.collab.capture.stop(session.current.handle);
            self.set_active_file(None);
        }
        self.release_resources();
        self.elapsed.set(Duration::ZERO);
        self.events.emit(Event::RecordingError { message: message.clone() });
        self.state.set(RecordingState::Error { message });
    }

    fn release_resources(&mut self) {
        self.collab.capture.release();
        self.collab.location.stop();
        self.collab.keep_awake.release();
    }

    fn publish_recording(&self) {
        if let Some(s) = &self.session {
            self.state.set(RecordingState::Recording {
                segment_index: s.index,
                segment_start: s.current.started_at,
                total_start: s.total_start,
            });
        }
    }

    fn set_active_file(&self, path: Option<PathBuf>) {
        *self.active_file.lock().unwrap_or_else(|p| p.into_inner()) = path;
    }

    fn enforce_quota(&self, max_percent: u8) {
        match self.quota.enforce(max_percent) {
            Ok(0) => {}
            Ok(deleted) => self.events.emit(Event::StorageCleaned { deleted }),
            Err(e) => log::warn!("Quota enforcement failed: {}", e),
        }
    }

    fn open_segment(&mut self, settings: Settings) -> Result<ActiveSegment> {
        std::fs::create_dir_all(&self.recordings_dir)?;
        let started = Local::now();
        let path = segment::next_segment_path(&self.recordings_dir, started);

        let handle = self.collab.capture.start_capture(&path, settings.enable_audio)?;
        self.set_active_file(Some(path));

        Ok(ActiveSegment {
            handle,
            started_at: started.with_timezone(&Utc),
            deadline: Instant::now() + settings.segment_duration(),
            settings,
        })
    }

    /// Stop capture, then overlay, measure and record the file.
    fn finish_segment(&mut self, seg: ActiveSegment) -> Result<Segment> {
        let finalized = self.collab.capture.stop(seg.handle.clone());
        let result = self.finalize(&seg, finalized);
        self.set_active_file(None);
        result
    }

    fn finalize(&self, seg: &ActiveSegment, finalized: Finalized) -> Result<Segment> {
        if let Some(err) = finalized.error {
            return Err(EvidenceCamError::Capture(format!(
                "{} did not finalize: {}",
                finalized.file.display(),
                err
            )));
        }

        let file = finalized.file;
        if !file.exists() {
            return Err(EvidenceCamError::FileNotFound(file.display().to_string()));
        }

        let location = self.collab.location.current_location();
        let final_file = match self
            .collab
            .overlay
            .burn_overlay(&file, seg.started_at.with_timezone(&Local), location)
        {
            Ok(path) => path,
            Err(e) => {
                log::warn!("Overlay failed for {}, keeping original: {}", file.display(), e);
                file
            }
        };

        let duration_ms = self
            .collab
            .probe
            .duration_ms(&final_file)
            .or(finalized.duration_hint_ms)
            .unwrap_or(seg.settings.segment_duration_ms);
        let size = std::fs::metadata(&final_file)?.len();
        let file_name = final_file
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| EvidenceCamError::InvalidPath(final_file.display().to_string()))?;

        let destination = seg.settings.upload_destination;
        let segment = Segment {
            id: uuid::Uuid::new_v4().to_string(),
            file_name,
            file_path: final_file.to_string_lossy().to_string(),
            file_size_bytes: size as i64,
            duration_ms: duration_ms as i64,
            recorded_at: seg.started_at,
            upload_status: destination.initial_status(),
            uploaded_at: None,
            upload_destination: destination,
            remote_url: None,
            retry_count: 0,
            last_error: None,
        };
        self.ledger.insert(&segment)?;

        log::info!(
            "Segment {} finalized ({} bytes, {} ms, {})",
            segment.file_name,
            segment.file_size_bytes,
            segment.duration_ms,
            segment.upload_status
        );
        self.events.emit(Event::SegmentCompleted {
            id: segment.id.clone(),
            destination,
        });
        Ok(segment)
    }
}

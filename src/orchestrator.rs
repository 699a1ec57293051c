// Orchestrator -- wires the ledger, recorder and upload scheduler together.
//
// Upload passes are triggered at build time, after every finalized segment
// bound for a remote destination, and on explicit reconnect. Storage info is
// refreshed whenever a segment is added or removed.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;

use crate::capture::Collaborators;
use crate::db::{self, Database};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::ledger::Ledger;
use crate::observe::Observable;
use crate::quota::{self, QuotaEnforcer, SpaceProbe, StatvfsProbe, StorageInfo};
use crate::recorder::{Recorder, RecorderDeps, RecorderHandle, RecordingState};
use crate::settings::SettingsStore;
use crate::upload::{
    AssumeOnline, BackoffPolicy, Connector, FolderConnector, NetworkStatus, UploadPipeline, UploadScheduler,
};

const LISTENER_POLL: Duration = Duration::from_millis(250);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct EvidenceCamConfig {
    pub data_dir: PathBuf,
    pub collaborators: Collaborators,
    pub connector: Arc<dyn Connector>,
    pub network: Arc<dyn NetworkStatus>,
    /// Defaults to statvfs on the recordings directory.
    pub space_probe: Option<Arc<dyn SpaceProbe>>,
    pub backoff: BackoffPolicy,
}

impl EvidenceCamConfig {
    pub fn new(data_dir: PathBuf, collaborators: Collaborators) -> Self {
        Self {
            data_dir,
            collaborators,
            connector: Arc::new(FolderConnector),
            network: Arc::new(AssumeOnline),
            space_probe: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Cleanup summary for `EvidenceCam::cleanup`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CleanupReport {
    pub evicted: usize,
    pub orphans_removed: usize,
}

pub struct EvidenceCam {
    data_dir: PathBuf,
    settings: SettingsStore,
    ledger: Ledger,
    quota: QuotaEnforcer,
    events: EventBus,
    storage: Observable<StorageInfo>,
    recorder: Option<Recorder>,
    handle: RecorderHandle,
    scheduler: UploadScheduler,
    listener: Option<JoinHandle<()>>,
    listener_stop: Arc<AtomicBool>,
}

impl EvidenceCam {
    pub fn build(config: EvidenceCamConfig) -> anyhow::Result<Self> {
        let data_dir = config.data_dir;
        db::init_data_folders(&data_dir)
            .with_context(|| format!("Could not create data folders in {}", data_dir.display()))?;
        let recordings_dir = db::get_recordings_dir(&data_dir);

        let database = Arc::new(Database::open(&db::get_db_path(&data_dir))?);
        let settings = SettingsStore::new(Arc::clone(&database));
        let ledger = Ledger::new(Arc::clone(&database));

        let probe = config
            .space_probe
            .unwrap_or_else(|| Arc::new(StatvfsProbe::new(recordings_dir.clone())));
        let quota = QuotaEnforcer::new(ledger.clone(), probe);
        let events = EventBus::new();
        let storage = Observable::new(quota.storage_info().unwrap_or_default());

        let pipeline = UploadPipeline::new(
            ledger.clone(),
            Arc::new(settings.clone()),
            config.connector,
            config.network,
            events.clone(),
        );
        let scheduler = UploadScheduler::new(pipeline, config.backoff);

        // Subscribe before the recorder exists so no completion is missed
        let rx = events.subscribe();
        let listener_stop = Arc::new(AtomicBool::new(false));
        let listener = {
            let scheduler = scheduler.clone();
            let quota = quota.clone();
            let storage = storage.clone();
            let stop = Arc::clone(&listener_stop);
            std::thread::Builder::new()
                .name("event-listener".into())
                .spawn(move || listen(rx, scheduler, quota, storage, stop))?
        };

        let recorder = Recorder::spawn(RecorderDeps {
            ledger: ledger.clone(),
            quota: quota.clone(),
            settings: Arc::new(settings.clone()),
            collaborators: config.collaborators,
            events: events.clone(),
            recordings_dir,
        })?;
        let handle = recorder.handle();

        log::info!("EvidenceCam ready at {}", data_dir.display());
        scheduler.trigger();

        Ok(Self {
            data_dir,
            settings,
            ledger,
            quota,
            events,
            storage,
            recorder: Some(recorder),
            handle,
            scheduler,
            listener: Some(listener),
            listener_stop,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn recordings_dir(&self) -> PathBuf {
        db::get_recordings_dir(&self.data_dir)
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn recorder(&self) -> RecorderHandle {
        self.handle.clone()
    }

    pub fn request_start(&self) -> Result<()> {
        self.handle.request_start()
    }

    pub fn request_stop(&self) -> Result<()> {
        self.handle.request_stop()
    }

    pub fn state(&self) -> Result<RecordingState> {
        self.handle.state()
    }

    pub fn subscribe_state(&self) -> Result<Receiver<RecordingState>> {
        self.handle.subscribe_state()
    }

    pub fn subscribe_elapsed(&self) -> Result<Receiver<Duration>> {
        self.handle.subscribe_elapsed()
    }

    pub fn subscribe_storage(&self) -> Receiver<StorageInfo> {
        self.storage.subscribe()
    }

    pub fn subscribe_events(&self) -> Receiver<Event> {
        self.events.subscribe()
    }

    pub fn trigger_upload_pass(&self) {
        self.scheduler.trigger();
    }

    /// The user re-linked the remote destination.
    pub fn reconnect(&self) {
        log::info!("Remote destination reconnected, scheduling upload pass");
        self.scheduler.trigger();
    }

    pub fn wait_uploads_idle(&self, timeout: Duration) -> bool {
        self.scheduler.wait_idle(timeout)
    }

    /// Fresh storage numbers, also pushed to storage subscribers.
    pub fn storage_info(&self) -> Result<StorageInfo> {
        let info = self.quota.storage_info()?;
        self.storage.set(info);
        Ok(info)
    }

    /// Run the quota once and optionally delete orphaned files.
    pub fn cleanup(&self, purge_orphans: bool) -> Result<CleanupReport> {
        let threshold = self.settings.load()?.settings.max_storage_percent;
        let evicted = self.quota.enforce(threshold)?;
        if evicted > 0 {
            self.events.emit(Event::StorageCleaned { deleted: evicted });
        }

        let orphans_removed = if purge_orphans {
            let active = self.handle.active_file();
            quota::purge_orphans(&self.recordings_dir(), &self.ledger, active.as_deref())?
        } else {
            0
        };

        self.storage_info()?;
        Ok(CleanupReport { evicted, orphans_removed })
    }

    /// Stop recording (finalizing the open segment), then let any in-flight
    /// upload pass finish.
    pub fn shutdown(mut self) {
        self.shutdown_inner();
    }

    fn shutdown_inner(&mut self) {
        if let Some(recorder) = self.recorder.take() {
            recorder.shutdown();
        }
        if let Some(listener) = self.listener.take() {
            self.listener_stop.store(true, Ordering::SeqCst);
            if listener.join().is_err() {
                log::error!("Event listener panicked");
            }
            self.scheduler.shutdown(SHUTDOWN_GRACE);
            log::info!("EvidenceCam shut down");
        }
    }
}

impl Drop for EvidenceCam {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}

fn listen(
    rx: Receiver<Event>,
    scheduler: UploadScheduler,
    quota: QuotaEnforcer,
    storage: Observable<StorageInfo>,
    stop: Arc<AtomicBool>,
) {
    let refresh = || match quota.storage_info() {
        Ok(info) => storage.set(info),
        Err(e) => log::warn!("Storage info unavailable: {}", e),
    };

    while !stop.load(Ordering::SeqCst) {
        let event = match rx.recv_timeout(LISTENER_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };

        match event {
            Event::SegmentCompleted { destination, .. } => {
                refresh();
                if !destination.is_local_only() {
                    scheduler.trigger();
                }
            }
            Event::StorageCleaned { .. } | Event::UploadCompleted { .. } => refresh(),
            Event::RecordingError { message } => log::warn!("Recorder reported: {}", message),
            Event::UploadAttention { file_name, reason, .. } => {
                log::warn!("Upload needs attention: {}: {}", file_name, reason)
            }
            _ => {}
        }
    }

    // Completions that raced with shutdown still get their upload
    let pending_remote = rx.try_iter().any(|e| {
        matches!(e, Event::SegmentCompleted { destination, .. } if !destination.is_local_only())
    });
    if pending_remote {
        scheduler.trigger();
    }
}

// Evidence Cam - Library Entry Point

pub mod constants;
pub mod error;
pub mod tools;
pub mod events;
pub mod observe;
pub mod db;
pub mod ledger;
pub mod settings;
pub mod quota;
pub mod capture;
pub mod recorder;
pub mod upload;
pub mod orchestrator;

pub use error::{EvidenceCamError, Result};
pub use events::{Event, EventBus};
pub use ledger::Ledger;
pub use orchestrator::{CleanupReport, EvidenceCam, EvidenceCamConfig};
pub use recorder::{RecorderHandle, RecordingState};
pub use settings::{Settings, SettingsStore};

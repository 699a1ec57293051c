// Upload pipeline -- one bounded pass over Pending segments.
//
// A pass never loops on its own. It reports an outcome and the scheduler
// decides whether and when to run again. Every status write is a guarded
// single-row update, so a pass can be interrupted at any point and the next
// pass (after resetting stuck rows) picks up where it left off.

pub mod error;
pub mod scheduler;
pub mod transport;


use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::constants::{UPLOAD_BATCH_SIZE, UPLOAD_MAX_RETRIES};
use crate::db::schema::{Segment, UploadStatus};
use crate::error::Result;
use crate::events::{Event, EventBus};
use crate::ledger::Ledger;
use crate::settings::SettingsSource;

pub use error::{classify, ErrorCategory, TransportError, UploadError};
pub use scheduler::{BackoffPolicy, UploadScheduler};
pub use transport::{AssumeOnline, Connector, FolderConnector, FolderTransport, NetworkStatus, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassOutcome {
    Success,
    Retry,
    Failure,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PassReport {
    pub outcome: PassOutcome,
    pub batch_size: usize,
    pub uploaded: usize,
    pub retried: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Remote storage was full or rate-limited; back off harder.
    pub quota_hit: bool,
}

impl PassReport {
    fn empty(outcome: PassOutcome) -> Self {
        Self {
            outcome,
            batch_size: 0,
            uploaded: 0,
            retried: 0,
            failed: 0,
            skipped: 0,
            quota_hit: false,
        }
    }
}

/// How one segment ended up after an attempt.
enum Attempt {
    Uploaded,
    Retried,
    Failed,
    Skipped,
}

pub struct UploadPipeline {
    ledger: Ledger,
    settings: Arc<dyn SettingsSource>,
    connector: Arc<dyn Connector>,
    network: Arc<dyn NetworkStatus>,
    events: EventBus,
}

impl UploadPipeline {
    pub fn new(
        ledger: Ledger,
        settings: Arc<dyn SettingsSource>,
        connector: Arc<dyn Connector>,
        network: Arc<dyn NetworkStatus>,
        events: EventBus,
    ) -> Self {
        Self { ledger, settings, connector, network, events }
    }

    pub fn run_pass(&self) -> Result<PassReport> {
        let settings = self.settings.snapshot()?.settings;

        if settings.upload_on_wifi_only && !self.network.is_wifi() {
            log::info!("Upload pass deferred: Wi-Fi required but not connected");
            return Ok(PassReport::empty(PassOutcome::Retry));
        }

        if settings.upload_destination.is_local_only() {
            log::debug!("Upload destination is local only, nothing to do");
            return Ok(PassReport::empty(PassOutcome::Success));
        }

        if !self.network.is_connected() {
            log::info!("Upload pass deferred: offline");
            return Ok(PassReport::empty(PassOutcome::Retry));
        }

        self.ledger.reset_stuck_uploads()?;

        let batch = self.ledger.pending_batch(UPLOAD_BATCH_SIZE)?;
        if batch.is_empty() {
            return Ok(PassReport::empty(PassOutcome::Success));
        }
        log::info!("Upload pass: {} pending segment(s)", batch.len());

        let transport = self.connector.connect(&settings);
        let mut report = PassReport::empty(PassOutcome::Success);
        report.batch_size = batch.len();

        for queued in &batch {
            match self.process(queued, transport.as_ref(), settings.auto_delete_after_upload, &mut report)? {
                Attempt::Uploaded => report.uploaded += 1,
                Attempt::Retried => report.retried += 1,
                Attempt::Failed => report.failed += 1,
                Attempt::Skipped => report.skipped += 1,
            }
        }

        report.outcome = if report.failed == report.batch_size {
            PassOutcome::Failure
        } else if report.failed > 0 || report.retried > 0 {
            PassOutcome::Retry
        } else {
            PassOutcome::Success
        };

        log::info!(
            "Upload pass finished: {:?} ({} uploaded, {} retrying, {} failed, {} skipped)",
            report.outcome,
            report.uploaded,
            report.retried,
            report.failed,
            report.skipped
        );
        Ok(report)
    }

    fn process(
        &self,
        queued: &Segment,
        transport: &dyn Transport,
        auto_delete: bool,
        report: &mut PassReport,
    ) -> Result<Attempt> {
        // The row may have changed or vanished since the batch was read
        let seg = match self.ledger.get(&queued.id)? {
            Some(s) if s.upload_status == UploadStatus::Pending => s,
            _ => return Ok(Attempt::Skipped),
        };

        if seg.retry_count >= UPLOAD_MAX_RETRIES {
            log::warn!("{} exceeded max retry count ({})", seg.file_name, seg.retry_count);
            let reason = format!("Exceeded maximum retry attempts after {} tries", seg.retry_count);
            self.ledger.mark_failed(&seg.id, &reason)?;
            self.attention(&seg, reason);
            return Ok(Attempt::Failed);
        }

        let local = Path::new(&seg.file_path);
        if !local.exists() {
            log::error!("Local file not found: {}", seg.file_path);
            self.ledger.mark_failed(&seg.id, "Local file not found")?;
            return Ok(Attempt::Failed);
        }

        if !self.ledger.mark_uploading(&seg.id)? {
            return Ok(Attempt::Skipped);
        }

        let result = match transport.upload(local, &seg.file_name) {
            Ok(url) if url.is_empty() => Err(UploadError::Server("Upload completed but no URL returned".into())),
            Ok(url) => Ok(url),
            Err(e) => Err(classify(&e)),
        };

        match result {
            Ok(url) => {
                self.complete(&seg, &url, auto_delete)?;
                Ok(Attempt::Uploaded)
            }
            Err(err) => self.handle_failure(&seg, err, report),
        }
    }

    fn complete(&self, seg: &Segment, url: &str, auto_delete: bool) -> Result<()> {
        if !self.ledger.mark_uploaded(&seg.id, url)? {
            log::warn!("{} changed during upload; not marking completed", seg.file_name);
            return Ok(());
        }
        log::info!("Uploaded {} -> {}", seg.file_name, url);
        self.events.emit(Event::UploadCompleted { id: seg.id.clone(), url: url.to_string() });

        if auto_delete {
            match self.ledger.get(&seg.id)? {
                Some(fresh) if fresh.upload_status == UploadStatus::Completed && fresh.remote_url.is_some() => {
                    self.ledger.delete_segment(&fresh)?;
                    log::info!("Auto-deleted local copy of {}", seg.file_name);
                }
                _ => log::warn!("Skipping auto-delete for {}: upload not confirmed", seg.file_name),
            }
        }
        Ok(())
    }

    fn handle_failure(&self, seg: &Segment, err: UploadError, report: &mut PassReport) -> Result<Attempt> {
        log::error!("Upload failed: {} - {}", seg.file_name, err);
        let message = err.to_string();

        if err.is_permanent() {
            self.ledger.mark_failed(&seg.id, &message)?;
            if err.needs_attention() {
                self.attention(seg, message);
            }
            return Ok(Attempt::Failed);
        }

        if matches!(err, UploadError::Quota(_)) {
            report.quota_hit = true;
        }
        match self.ledger.record_retry(&seg.id, &message)? {
            Some(UploadStatus::Failed) => {
                self.attention(seg, format!("Giving up after {} attempts: {}", UPLOAD_MAX_RETRIES, message));
                Ok(Attempt::Failed)
            }
            Some(_) => {
                if err.needs_attention() {
                    self.attention(seg, format!("{} - will retry later", message));
                }
                Ok(Attempt::Retried)
            }
            None => Ok(Attempt::Skipped),
        }
    }

    fn attention(&self, seg: &Segment, reason: String) {
        self.events.emit(Event::UploadAttention {
            id: seg.id.clone(),
            file_name: seg.file_name.clone(),
            reason,
        });
    }
}

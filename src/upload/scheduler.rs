// Upload pass scheduling.
//
// At most one pass runs at a time. A trigger that arrives while a pass is in
// flight is coalesced into a single follow-up pass. After a Retry outcome one
// delayed re-trigger is armed with exponential backoff; a later Success or an
// explicit trigger supersedes it.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;

use super::{PassOutcome, PassReport, UploadPipeline};
use crate::constants::{
    UPLOAD_BACKOFF_JITTER_MS, UPLOAD_BASE_BACKOFF_SECONDS, UPLOAD_MAX_BACKOFF_SECONDS,
    UPLOAD_QUOTA_BACKOFF_MULTIPLIER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub quota_multiplier: u32,
    pub jitter_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(UPLOAD_BASE_BACKOFF_SECONDS),
            max: Duration::from_secs(UPLOAD_MAX_BACKOFF_SECONDS),
            quota_multiplier: UPLOAD_QUOTA_BACKOFF_MULTIPLIER,
            jitter_ms: UPLOAD_BACKOFF_JITTER_MS,
        }
    }
}

impl BackoffPolicy {
    /// `base * 2^(attempt-1)`, times the quota multiplier when the remote was
    /// full, capped at `max`. Jitter is added by the caller.
    pub fn delay(&self, attempt: u32, quota_hit: bool) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let mut delay = self.base.saturating_mul(1u32 << exp);
        if quota_hit {
            delay = delay.saturating_mul(self.quota_multiplier.max(1));
        }
        delay.min(self.max)
    }

    fn jittered(&self, attempt: u32, quota_hit: bool) -> Duration {
        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        } else {
            0
        };
        self.delay(attempt, quota_hit) + Duration::from_millis(jitter)
    }
}

#[derive(Default)]
struct RunState {
    running: bool,
    rerun: bool,
    shutdown: bool,
    /// Consecutive Retry outcomes.
    retry_streak: u32,
    /// Bumped whenever an armed retry timer becomes stale.
    retry_generation: u64,
    passes: u64,
    last_report: Option<PassReport>,
}

struct Inner {
    pipeline: UploadPipeline,
    policy: BackoffPolicy,
    state: Mutex<RunState>,
    changed: Condvar,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Clone)]
pub struct UploadScheduler {
    inner: Arc<Inner>,
}

impl UploadScheduler {
    pub fn new(pipeline: UploadPipeline, policy: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                pipeline,
                policy,
                state: Mutex::new(RunState::default()),
                changed: Condvar::new(),
            }),
        }
    }

    /// Request a pass. Returns immediately.
    pub fn trigger(&self) {
        let mut state = self.inner.lock();
        if state.shutdown {
            return;
        }
        if state.running {
            state.rerun = true;
            return;
        }
        state.running = true;
        // An explicit trigger replaces any armed retry
        state.retry_generation += 1;
        drop(state);

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("upload-pass".into())
            .spawn(move || pass_loop(inner));
        if let Err(e) = spawned {
            log::error!("Failed to spawn upload pass thread: {}", e);
            let mut state = self.inner.lock();
            state.running = false;
            self.inner.changed.notify_all();
        }
    }

    /// Block until no pass is running or queued, or `timeout` elapses.
    /// Returns true if idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.inner.lock();
        let (state, _) = self
            .inner
            .changed
            .wait_timeout_while(state, timeout, |s| s.running)
            .unwrap_or_else(|p| p.into_inner());
        !state.running
    }

    pub fn passes(&self) -> u64 {
        self.inner.lock().passes
    }

    pub fn last_report(&self) -> Option<PassReport> {
        self.inner.lock().last_report.clone()
    }

    /// Stop accepting triggers, disarm retries and wait for the current pass.
    pub fn shutdown(&self, timeout: Duration) {
        {
            let mut state = self.inner.lock();
            state.shutdown = true;
            state.rerun = false;
            state.retry_generation += 1;
            self.inner.changed.notify_all();
        }
        if !self.wait_idle(timeout) {
            log::warn!("Upload pass still running at shutdown");
        }
    }
}

fn pass_loop(inner: Arc<Inner>) {
    loop {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| inner.pipeline.run_pass()));

        let report = match result {
            Ok(Ok(report)) => Some(report),
            Ok(Err(e)) => {
                log::error!("Upload pass failed: {}", e);
                None
            }
            Err(_) => {
                log::error!("Upload pass panicked (recovered)");
                None
            }
        };

        let mut state = inner.lock();
        state.passes += 1;
        // A pass that could not run at all is retried like a Retry outcome
        let outcome = report.as_ref().map(|r| r.outcome).unwrap_or(PassOutcome::Retry);
        let quota_hit = report.as_ref().map(|r| r.quota_hit).unwrap_or(false);
        state.last_report = report;

        match outcome {
            PassOutcome::Success | PassOutcome::Failure => {
                state.retry_streak = 0;
                state.retry_generation += 1;
            }
            PassOutcome::Retry => {
                state.retry_streak += 1;
                state.retry_generation += 1;
                if !state.shutdown && !state.rerun {
                    let delay = inner.policy.jittered(state.retry_streak, quota_hit);
                    arm_retry(&inner, state.retry_generation, delay);
                }
            }
        }

        if state.rerun && !state.shutdown {
            state.rerun = false;
            drop(state);
            continue;
        }

        state.running = false;
        inner.changed.notify_all();
        return;
    }
}

fn arm_retry(inner: &Arc<Inner>, generation: u64, delay: Duration) {
    log::info!("Next upload pass in {:.1}s", delay.as_secs_f64());
    let inner = Arc::clone(inner);
    let spawned = std::thread::Builder::new()
        .name("upload-retry".into())
        .spawn(move || {
            let state = inner.lock();
            let (state, timeout) = inner
                .changed
                .wait_timeout_while(state, delay, |s| !s.shutdown && s.retry_generation == generation)
                .unwrap_or_else(|p| p.into_inner());
            if !timeout.timed_out() || state.shutdown || state.retry_generation != generation {
                return;
            }
            drop(state);
            UploadScheduler { inner }.trigger();
        });
    if let Err(e) = spawned {
        log::error!("Failed to arm upload retry: {}", e);
    }
}
